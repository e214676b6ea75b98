//! Authoritative CRDT replicas and their storage handoff.
//!
//! ```text
//!   load_latest_content ──► ReplicaManager::open ──► Box<dyn Replica>
//!                                                        │  summarize / diff
//!                                                        │  apply_update
//!   save_content ◄──────── ReplicaManager::finalize ◄────┘
//! ```
//!
//! The merge algorithm is not ours: [`YrsReplica`] delegates to yrs, which
//! provides idempotent, commutative update application. The gateway's job is
//! to feed each replica one update at a time.

use std::sync::Arc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::collaborators::{DocumentId, Persistence};
use crate::error::{ReplicaError, StoreError};

/// A conflict-free replicated document.
pub trait Replica: Send + Sync {
    /// Compact summary of what this replica already has (a state vector).
    fn summarize(&self) -> Vec<u8>;

    /// Everything this replica holds beyond `summary`.
    fn diff(&self, summary: &[u8]) -> Result<Vec<u8>, ReplicaError>;

    /// Merge an encoded update. Returns whether the replica changed;
    /// re-applying an update is a no-op and returns `false`.
    fn apply_update(&mut self, update: &[u8]) -> Result<bool, ReplicaError>;

    /// Full state, suitable for persistence and for seeding a new replica.
    fn encode_state(&self) -> Vec<u8>;

    /// Merge another replica's complete state into this one.
    fn merge(&mut self, other: &dyn Replica) -> Result<bool, ReplicaError> {
        self.apply_update(&other.encode_state())
    }
}

/// [`Replica`] backed by a yrs document.
pub struct YrsReplica {
    doc: Doc,
}

impl YrsReplica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Seed a replica from persisted content.
    pub fn from_content(content: &[u8]) -> Result<Self, ReplicaError> {
        let mut replica = Self::new();
        replica.apply_update(content)?;
        Ok(replica)
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl Default for YrsReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica for YrsReplica {
    fn summarize(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, summary: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote_sv = StateVector::decode_v1(summary)
            .map_err(|e| ReplicaError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    fn apply_update(&mut self, update: &[u8]) -> Result<bool, ReplicaError> {
        let update =
            Update::decode_v1(update).map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))?;
        if update.is_empty() {
            return Ok(false);
        }

        let mut txn = self.doc.transact_mut();
        let known = txn.state_vector();
        // Blocks past our clocks count even if they end up pending on a gap
        let brings_blocks = update
            .state_vector()
            .iter()
            .any(|(client, clock)| *clock > known.get(client));
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Merge(e.to_string()))?;
        Ok(brings_blocks || !txn.delete_set().is_empty())
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }
}

/// Builds a replica from persisted content (`None` = new document).
pub type ReplicaFactory =
    Arc<dyn Fn(Option<&[u8]>) -> Result<Box<dyn Replica>, ReplicaError> + Send + Sync>;

fn open_yrs(content: Option<&[u8]>) -> Result<Box<dyn Replica>, ReplicaError> {
    let replica = match content {
        Some(bytes) if !bytes.is_empty() => YrsReplica::from_content(bytes)?,
        _ => YrsReplica::new(),
    };
    Ok(Box::new(replica))
}

/// Opens replicas from storage and hands their content back on eviction.
#[derive(Clone)]
pub struct ReplicaManager {
    persistence: Arc<dyn Persistence>,
    factory: ReplicaFactory,
}

impl ReplicaManager {
    /// Manager producing [`YrsReplica`]s.
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_factory(persistence, Arc::new(open_yrs))
    }

    pub fn with_factory(persistence: Arc<dyn Persistence>, factory: ReplicaFactory) -> Self {
        Self {
            persistence,
            factory,
        }
    }

    /// Create a replica seeded from the latest persisted content.
    pub async fn open(&self, id: DocumentId) -> Result<Box<dyn Replica>, ReplicaError> {
        let content = self
            .persistence
            .load_latest_content(id)
            .await
            .map_err(|e| ReplicaError::Load(id, e))?;

        match &content {
            Some(bytes) => log::debug!("Seeding document {id} from {} persisted bytes", bytes.len()),
            None => log::debug!("Document {id} has no persisted content"),
        }

        (self.factory)(content.as_deref())
    }

    /// Flush a replica's content to storage.
    pub async fn finalize(&self, id: DocumentId, replica: &dyn Replica) -> Result<(), StoreError> {
        let content = replica.encode_state();
        self.persistence.save_content(id, &content).await?;
        log::info!("Flushed document {id} ({} bytes)", content.len());
        Ok(())
    }
}
