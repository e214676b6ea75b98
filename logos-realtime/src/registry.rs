//! Session registry: which connection is on which document, and the live
//! session of every open document.
//!
//! ```text
//!            RegistryState (std Mutex, never held across .await)
//!  ┌────────────────────────────────────────────────────────────┐
//!  │ attached: ConnectionId → DocumentId                        │
//!  │ slots:    DocumentId   → Arc<tokio Mutex<SlotState>>       │
//!  └───────────────────────────────┬────────────────────────────┘
//!                                  │ per-document slot lock
//!                                  ▼
//!        Vacant ──load──► Live(DocumentSession) ──last detach──► Retired
//! ```
//!
//! The slot lock serializes attach, detach and every merge/broadcast for one
//! document. A retired slot is already unlinked from `slots`; whoever finds
//! one starts over with a fresh slot. Lock order is always slot, then state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::codec::Frame;
use crate::collaborators::{Document, DocumentId, Identity};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::{RegistryError, ReplicaError};
use crate::presence::PresenceStore;
use crate::replica::{Replica, ReplicaManager};
use crate::stats::GatewayStats;

/// An admitted connection on a document.
#[derive(Debug, Clone)]
pub struct Participant {
    pub handle: ConnectionHandle,
    pub identity: Identity,
    pub document: Document,
}

impl Participant {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }
}

/// The in-memory state of one open document.
pub struct DocumentSession {
    id: DocumentId,
    replica: Box<dyn Replica>,
    participants: HashMap<ConnectionId, Participant>,
    dirty: bool,
}

impl DocumentSession {
    fn new(id: DocumentId, replica: Box<dyn Replica>) -> Self {
        Self {
            id,
            replica,
            participants: HashMap::new(),
            dirty: false,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn replica(&self) -> &dyn Replica {
        self.replica.as_ref()
    }

    /// Merge an update into the replica. The session only turns dirty when
    /// the replica actually changed; returns whether it did.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<bool, ReplicaError> {
        let changed = self.replica.apply_update(update)?;
        self.dirty |= changed;
        Ok(changed)
    }

    /// True once anything was merged since load (or since the last flush).
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn participant(&self, connection: ConnectionId) -> Option<&Participant> {
        self.participants.get(&connection)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Queue `frame` on every participant except `excluding`.
    /// Returns how many connections accepted it.
    pub fn broadcast(&self, frame: Arc<Vec<u8>>, excluding: Option<ConnectionId>) -> usize {
        self.participants
            .values()
            .filter(|p| Some(p.id()) != excluding)
            .filter(|p| p.handle.send(frame.clone()))
            .count()
    }

    pub fn send_to(&self, connection: ConnectionId, frame: Arc<Vec<u8>>) -> bool {
        self.participants
            .get(&connection)
            .is_some_and(|p| p.handle.send(frame))
    }
}

enum SlotState {
    /// Created, replica not loaded yet
    Vacant,
    Live(DocumentSession),
    /// Evicted or failed to load; unlinked from the registry
    Retired,
}

type Slot = Arc<tokio::sync::Mutex<SlotState>>;

#[derive(Default)]
struct RegistryState {
    attached: HashMap<ConnectionId, DocumentId>,
    slots: HashMap<DocumentId, Slot>,
}

/// Single authority over document sessions and connection attachment.
pub struct SessionRegistry {
    replicas: ReplicaManager,
    presence: Arc<PresenceStore>,
    stats: Arc<GatewayStats>,
    state: Mutex<RegistryState>,
    live_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(
        replicas: ReplicaManager,
        presence: Arc<PresenceStore>,
        stats: Arc<GatewayStats>,
    ) -> Self {
        Self {
            replicas,
            presence,
            stats,
            state: Mutex::new(RegistryState::default()),
            live_sessions: AtomicUsize::new(0),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unlink_slot(&self, document: DocumentId, slot: &Slot) {
        let mut state = self.lock_state();
        if state
            .slots
            .get(&document)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            state.slots.remove(&document);
        }
    }

    /// Attach a connection to its document, opening the session if needed.
    pub async fn attach(&self, participant: Participant) -> Result<(), RegistryError> {
        self.attach_with(participant, |_| ()).await
    }

    /// Attach, then run `on_attached` before the document's critical section
    /// is released. Frames it queues precede any later broadcast.
    pub async fn attach_with(
        &self,
        participant: Participant,
        on_attached: impl FnOnce(&DocumentSession),
    ) -> Result<(), RegistryError> {
        let connection = participant.id();
        let document = participant.document.id;

        loop {
            let slot = {
                let mut state = self.lock_state();
                if let Some(existing) = state.attached.get(&connection) {
                    return Err(RegistryError::AlreadyAttached {
                        connection,
                        document: *existing,
                    });
                }
                state
                    .slots
                    .entry(document)
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(SlotState::Vacant)))
                    .clone()
            };

            let mut guard = slot.lock().await;

            if matches!(*guard, SlotState::Retired) {
                drop(guard);
                tokio::task::yield_now().await;
                continue;
            }

            if matches!(*guard, SlotState::Vacant) {
                match self.replicas.open(document).await {
                    Ok(replica) => {
                        *guard = SlotState::Live(DocumentSession::new(document, replica));
                        self.live_sessions.fetch_add(1, Ordering::SeqCst);
                        self.stats.session_created();
                        log::info!("Opened session for document {document}");
                    }
                    Err(e) => {
                        *guard = SlotState::Retired;
                        self.unlink_slot(document, &slot);
                        return Err(e.into());
                    }
                }
            }

            let SlotState::Live(session) = &mut *guard else {
                continue;
            };

            {
                let mut state = self.lock_state();
                if let Some(existing) = state.attached.get(&connection) {
                    return Err(RegistryError::AlreadyAttached {
                        connection,
                        document: *existing,
                    });
                }
                state.attached.insert(connection, document);
            }
            session.participants.insert(connection, participant);
            log::info!(
                "Attached {connection} to document {document} ({} connected)",
                session.len()
            );
            on_attached(session);
            return Ok(());
        }
    }

    /// Detach a connection. Returns the document it was on, `None` if it
    /// was not attached.
    ///
    /// The connection's presence is removed and announced to the remaining
    /// peers. When the last connection leaves, a dirty replica is flushed to
    /// storage and the session is evicted; a failed flush is logged and the
    /// eviction completes anyway.
    pub async fn detach(&self, connection: ConnectionId) -> Option<DocumentId> {
        let (document, slot) = {
            let state = self.lock_state();
            let document = *state.attached.get(&connection)?;
            (document, state.slots.get(&document).cloned())
        };

        let Some(slot) = slot else {
            log::error!("{connection} mapped to document {document} without a session");
            debug_assert!(false, "attached connection without a session slot");
            self.lock_state().attached.remove(&connection);
            return Some(document);
        };

        let mut guard = slot.lock().await;
        if self.lock_state().attached.remove(&connection).is_none() {
            // Lost a race with a concurrent detach of the same connection
            return None;
        }

        let SlotState::Live(session) = &mut *guard else {
            log::error!("{connection} detached from document {document} with no live session");
            debug_assert!(false, "attached connection on a non-live slot");
            return Some(document);
        };

        let removed = session.participants.remove(&connection);
        if removed.is_none() {
            log::error!("{connection} missing from the session of document {document}");
        }
        debug_assert!(removed.is_some(), "session and registry disagree");

        if let Some(entry) = self.presence.remove(document, connection) {
            if let Some(payload) = entry.removal_payload() {
                let frame = Arc::new(Frame::Awareness(payload).encode());
                let sent = session.broadcast(frame, None);
                self.stats.frames_broadcast(sent);
            }
        }

        log::info!(
            "Detached {connection} from document {document} ({} remaining)",
            session.len()
        );

        if !session.is_empty() {
            return Some(document);
        }

        if session.is_dirty() {
            if let Err(e) = self.replicas.finalize(document, session.replica()).await {
                log::error!("Failed to flush document {document} on eviction: {e}");
                self.stats.flush_failed();
            }
        } else {
            log::debug!("Document {document} unchanged since load, skipping flush");
        }

        self.presence.clear_document(document);
        *guard = SlotState::Retired;
        self.unlink_slot(document, &slot);
        self.live_sessions.fetch_sub(1, Ordering::SeqCst);
        self.stats.session_evicted();
        log::info!("Evicted session for document {document}");

        Some(document)
    }

    /// Run `f` inside the document's critical section. `None` if the
    /// document has no live session.
    pub async fn with_session<R>(
        &self,
        document: DocumentId,
        f: impl FnOnce(&mut DocumentSession) -> R,
    ) -> Option<R> {
        let slot = self.lock_state().slots.get(&document).cloned()?;
        let mut guard = slot.lock().await;
        match &mut *guard {
            SlotState::Live(session) => Some(f(session)),
            _ => None,
        }
    }

    /// Handles of every connection on `document` except `excluding`.
    pub async fn peers(
        &self,
        document: DocumentId,
        excluding: ConnectionId,
    ) -> Vec<ConnectionHandle> {
        self.with_session(document, |session| {
            session
                .participants()
                .filter(|p| p.id() != excluding)
                .map(|p| p.handle.clone())
                .collect()
        })
        .await
        .unwrap_or_default()
    }

    /// Every participant on `document`.
    pub async fn participants(&self, document: DocumentId) -> Vec<Participant> {
        self.with_session(document, |session| session.participants().cloned().collect())
            .await
            .unwrap_or_default()
    }

    pub async fn connections(&self, document: DocumentId) -> Vec<ConnectionId> {
        self.with_session(document, |session| session.participants.keys().copied().collect())
            .await
            .unwrap_or_default()
    }

    pub fn document_of(&self, connection: ConnectionId) -> Option<DocumentId> {
        self.lock_state().attached.get(&connection).copied()
    }

    /// Documents with a live session.
    pub fn session_count(&self) -> usize {
        self.live_sessions.load(Ordering::SeqCst)
    }

    /// Attached connections across all documents.
    pub fn connection_count(&self) -> usize {
        self.lock_state().attached.len()
    }

    /// Every document id with a slot, live or loading.
    pub fn documents(&self) -> Vec<DocumentId> {
        self.lock_state().slots.keys().copied().collect()
    }

    /// Flush every dirty live session without evicting it.
    /// Returns how many documents were written.
    pub async fn finalize_all(&self) -> usize {
        let slots: Vec<(DocumentId, Slot)> = self
            .lock_state()
            .slots
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut flushed = 0;
        for (document, slot) in slots {
            let mut guard = slot.lock().await;
            let SlotState::Live(session) = &mut *guard else {
                continue;
            };
            if !session.is_dirty() {
                continue;
            }
            match self.replicas.finalize(document, session.replica()).await {
                Ok(()) => {
                    session.dirty = false;
                    flushed += 1;
                }
                Err(e) => {
                    log::error!("Failed to flush document {document}: {e}");
                    self.stats.flush_failed();
                }
            }
        }
        flushed
    }
}
