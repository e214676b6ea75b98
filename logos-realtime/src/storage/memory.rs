use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::collaborators::{DocumentId, Persistence};
use crate::error::StoreError;

/// In-memory [`Persistence`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, Vec<u8>>>,
    saves: AtomicU64,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a document's content.
    pub fn insert(&self, id: DocumentId, content: Vec<u8>) {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, content);
    }

    pub fn get(&self, id: DocumentId) -> Option<Vec<u8>> {
        self.documents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.get(id).is_some()
    }

    /// Number of successful saves since creation.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every subsequent load fail.
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent save fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_latest_content(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("loads disabled".into()));
        }
        Ok(self.get(id))
    }

    async fn save_content(&self, id: DocumentId, content: &[u8]) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("saves disabled".into()));
        }
        self.insert(id, content.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
