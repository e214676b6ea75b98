//! Connection gateway: admission, per-frame entry point, and teardown.
//!
//! ```text
//! on_connect ── parse path ── resolve identity ── find document ── can_read
//!      │                                                              │
//!      │ any failure: close, no protocol frame                        ▼
//!      └──────────────────────────────────────────── attach ── greet (Step1 + presence)
//!
//! on_message ── Multiplexer (panics caught per frame)
//! on_disconnect ── detach
//! ```
//!
//! The gateway owns no transport. The WebSocket server in [`crate::server`]
//! drives it, and tests drive it directly with in-process connections.

use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::codec::{ControlMessage, Frame, SyncMessage};
use crate::collaborators::{Collaborators, ConnectionRequest, DocumentId, LookupError};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::AdmissionError;
use crate::handler::{HandlerContext, Multiplexer};
use crate::presence::PresenceStore;
use crate::registry::{DocumentSession, Participant, SessionRegistry};
use crate::replica::ReplicaManager;
use crate::stats::{GatewayStats, StatsSnapshot};

/// Path prefix every admitted request must carry.
pub const PATH_PREFIX: &str = "/realtime/";

/// Extract the document locator from a request path.
///
/// The query string and fragment are ignored. The locator must be a single,
/// non-empty path segment.
pub fn parse_document_locator(path: &str) -> Option<&str> {
    let path = path.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
    let locator = path.strip_prefix(PATH_PREFIX)?;
    if locator.is_empty() || locator.contains('/') {
        return None;
    }
    Some(locator)
}

pub struct Gateway {
    collaborators: Collaborators,
    registry: Arc<SessionRegistry>,
    presence: Arc<PresenceStore>,
    multiplexer: Multiplexer,
    stats: Arc<GatewayStats>,
}

impl Gateway {
    /// Gateway with yrs replicas persisted through `collaborators.persistence`.
    pub fn new(collaborators: Collaborators) -> Self {
        let replicas = ReplicaManager::new(collaborators.persistence.clone());
        Self::with_replicas(collaborators, replicas)
    }

    pub fn with_replicas(collaborators: Collaborators, replicas: ReplicaManager) -> Self {
        let stats = Arc::new(GatewayStats::new());
        let presence = Arc::new(PresenceStore::new());
        let registry = Arc::new(SessionRegistry::new(
            replicas,
            presence.clone(),
            stats.clone(),
        ));
        let multiplexer = Multiplexer::new(Arc::new(HandlerContext {
            registry: registry.clone(),
            presence: presence.clone(),
            authorization: collaborators.authorization.clone(),
            stats: stats.clone(),
        }));

        Self {
            collaborators,
            registry,
            presence,
            multiplexer,
            stats,
        }
    }

    /// Admit a new connection.
    ///
    /// On failure the connection is closed and nothing about it is
    /// registered. On success it is attached and has been greeted.
    pub async fn on_connect(
        &self,
        handle: ConnectionHandle,
        request: &ConnectionRequest,
    ) -> Result<Participant, AdmissionError> {
        let connection = handle.id();
        match self.admit(handle.clone(), request).await {
            Ok(participant) => {
                self.stats.connection_accepted();
                Ok(participant)
            }
            Err(e) => {
                match &e {
                    AdmissionError::InvalidPath(_)
                    | AdmissionError::NotFound(_)
                    | AdmissionError::Forbidden(_) => {
                        log::info!("Rejected {connection} ({}): {e}", request.path)
                    }
                    _ => log::warn!("Rejected {connection} ({}): {e}", request.path),
                }
                self.stats.connection_rejected();
                handle.close();
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        handle: ConnectionHandle,
        request: &ConnectionRequest,
    ) -> Result<Participant, AdmissionError> {
        let locator = parse_document_locator(&request.path)
            .ok_or_else(|| AdmissionError::InvalidPath(request.path.clone()))?;

        let identity = self
            .collaborators
            .identity
            .resolve_identity(request)
            .await
            .map_err(AdmissionError::Identity)?;

        let document = self
            .collaborators
            .lookup
            .find_document(locator)
            .await
            .map_err(|e| match e {
                LookupError::NotFound => AdmissionError::NotFound(locator.to_string()),
                LookupError::Forbidden => AdmissionError::Forbidden(locator.to_string()),
                LookupError::Backend(msg) => AdmissionError::Lookup(msg),
            })?;

        if !self
            .collaborators
            .authorization
            .can_read(&identity, &document)
            .await
        {
            return Err(AdmissionError::Unauthorized);
        }

        let participant = Participant {
            handle,
            identity,
            document,
        };
        let connection = participant.id();
        self.registry
            .attach_with(participant.clone(), |session| {
                greet(session, &self.presence, connection)
            })
            .await?;
        Ok(participant)
    }

    /// Handle one inbound binary frame. Never fails and never panics outward.
    pub async fn on_message(&self, participant: &Participant, data: &[u8]) {
        let handled = AssertUnwindSafe(self.multiplexer.handle_frame(participant, data))
            .catch_unwind()
            .await;
        if let Err(panic) = handled {
            log::error!(
                "Panic while handling frame from {}: {}",
                participant.id(),
                panic_message(panic.as_ref())
            );
            self.stats.frame_dropped();
        }
    }

    /// Tear down a connection. No-op if it was never attached.
    pub async fn on_disconnect(&self, connection: ConnectionId) -> Option<DocumentId> {
        self.registry.detach(connection).await
    }

    /// Re-check read access of every connection on `document`.
    ///
    /// Connections that lost access get `AccessRevoked`, then are closed and
    /// detached. The rest get `PermissionsChanged`. Returns how many were
    /// revoked.
    pub async fn notify_permissions_changed(&self, document: DocumentId) -> usize {
        let mut revoked = 0;
        for participant in self.registry.participants(document).await {
            let allowed = self
                .collaborators
                .authorization
                .can_read(&participant.identity, &participant.document)
                .await;
            if allowed {
                participant.handle.send(control_frame(&ControlMessage::PermissionsChanged));
                continue;
            }

            log::info!("Read access to {document} revoked for {}", participant.id());
            participant.handle.send(control_frame(&ControlMessage::AccessRevoked));
            participant.handle.close();
            self.registry.detach(participant.id()).await;
            revoked += 1;
        }
        revoked
    }

    /// Notify every connection that the server is going away and flush
    /// every live session. Returns how many documents were written.
    pub async fn shutdown(&self) -> usize {
        let notice = control_frame(&ControlMessage::ShutdownNotice);
        for document in self.registry.documents() {
            for participant in self.registry.participants(document).await {
                participant.handle.send(notice.clone());
                participant.handle.close();
            }
        }
        let flushed = self.registry.finalize_all().await;
        log::info!("Gateway shut down, flushed {flushed} documents");
        flushed
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn presence(&self) -> &Arc<PresenceStore> {
        &self.presence
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Send the server's Step1 and the current presence of everyone else.
/// Runs under the document lock, so nothing overtakes it and no presence
/// arrives both here and as a broadcast.
fn greet(session: &DocumentSession, presence: &PresenceStore, connection: ConnectionId) {
    let step1 = Frame::sync(&SyncMessage::Step1(session.replica().summarize()));
    session.send_to(connection, Arc::new(step1.encode()));
    for payload in presence.snapshot(session.id(), connection) {
        session.send_to(connection, Arc::new(Frame::Awareness(payload).encode()));
    }
}

fn control_frame(msg: &ControlMessage) -> Arc<Vec<u8>> {
    Arc::new(Frame::control(msg).encode())
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic payload"
    }
}
