//! Ephemeral presence (awareness) state.
//!
//! ```text
//! AWARENESS frame from X ──► PresenceStore::set(doc, X)   (last write wins)
//!                      └──► broadcast verbatim to peers of doc
//!
//! X disconnects ──► PresenceStore::remove(doc, X) ──► removal update to peers
//! last detach   ──► PresenceStore::clear_document(doc)
//! ```
//!
//! Payloads are stored as received. The only thing the store reads out of
//! them is the set of awareness client ids and their clocks, so that a
//! removal update can be built when the connection goes away.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::codec::AwarenessUpdate;
use crate::collaborators::DocumentId;
use crate::connection::ConnectionId;

/// Latest presence of one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceEntry {
    /// Last AWARENESS payload received, verbatim
    pub payload: Vec<u8>,
    /// Awareness client id → last seen clock
    pub clients: HashMap<u64, u32>,
}

impl PresenceEntry {
    fn absorb(&mut self, payload: Vec<u8>, update: &AwarenessUpdate) {
        self.payload = payload;
        for entry in &update.entries {
            if entry.is_removal() {
                self.clients.remove(&entry.client_id);
            } else {
                self.clients.insert(entry.client_id, entry.clock);
            }
        }
    }

    /// AWARENESS payload announcing that every client of this entry left.
    pub fn removal_payload(&self) -> Option<Vec<u8>> {
        if self.clients.is_empty() {
            return None;
        }
        let mut clients: Vec<(u64, u32)> = self.clients.iter().map(|(id, c)| (*id, *c)).collect();
        clients.sort_unstable();
        Some(AwarenessUpdate::removal(clients).encode())
    }
}

/// Per-document presence, keyed by connection.
#[derive(Debug, Default)]
pub struct PresenceStore {
    documents: RwLock<HashMap<DocumentId, HashMap<ConnectionId, PresenceEntry>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection's latest presence payload.
    pub fn set(
        &self,
        document: DocumentId,
        connection: ConnectionId,
        payload: Vec<u8>,
        update: &AwarenessUpdate,
    ) {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        documents
            .entry(document)
            .or_default()
            .entry(connection)
            .or_default()
            .absorb(payload, update);
    }

    pub fn remove(&self, document: DocumentId, connection: ConnectionId) -> Option<PresenceEntry> {
        let mut documents = self.documents.write().unwrap_or_else(PoisonError::into_inner);
        let entries = documents.get_mut(&document)?;
        let removed = entries.remove(&connection);
        if entries.is_empty() {
            documents.remove(&document);
        }
        removed
    }

    /// Drop all presence of a document. Returns how many entries were dropped.
    pub fn clear_document(&self, document: DocumentId) -> usize {
        self.documents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&document)
            .map_or(0, |entries| entries.len())
    }

    /// Payloads of every connection on `document` except `excluding`.
    pub fn snapshot(&self, document: DocumentId, excluding: ConnectionId) -> Vec<Vec<u8>> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents
            .get(&document)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(conn, _)| **conn != excluding)
                    .map(|(_, entry)| entry.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, document: DocumentId, connection: ConnectionId) -> Option<PresenceEntry> {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents.get(&document)?.get(&connection).cloned()
    }

    /// Number of presence entries held for `document`.
    pub fn len(&self, document: DocumentId) -> usize {
        let documents = self.documents.read().unwrap_or_else(PoisonError::into_inner);
        documents.get(&document).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, document: DocumentId) -> bool {
        self.len(document) == 0
    }
}
