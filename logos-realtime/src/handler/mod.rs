//! Per-frame routing.
//!
//! ```text
//! raw frame ──► Frame::decode ──┬─ SYNC      ──► sync::handle
//!                               ├─ AWARENESS ──► awareness::handle
//!                               ├─ CONTROL   ──► control::handle
//!                               └─ unknown   ──► ignored
//! ```
//!
//! Handler errors never leave the multiplexer: the frame is dropped, the
//! error logged, and the connection stays open.

pub mod awareness;
pub mod control;
pub mod sync;

use std::sync::Arc;

use crate::codec::Frame;
use crate::collaborators::Authorization;
use crate::error::HandlerError;
use crate::presence::PresenceStore;
use crate::registry::{Participant, SessionRegistry};
use crate::stats::GatewayStats;

/// Shared state every handler works against.
pub struct HandlerContext {
    pub registry: Arc<SessionRegistry>,
    pub presence: Arc<PresenceStore>,
    pub authorization: Arc<dyn Authorization>,
    pub stats: Arc<GatewayStats>,
}

/// Decodes frames and dispatches them to the category handlers.
#[derive(Clone)]
pub struct Multiplexer {
    ctx: Arc<HandlerContext>,
}

impl Multiplexer {
    pub fn new(ctx: Arc<HandlerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Handle one inbound frame, logging and counting anything that fails.
    pub async fn handle_frame(&self, participant: &Participant, data: &[u8]) {
        self.ctx.stats.frame_received();
        if let Err(e) = self.dispatch(participant, data).await {
            log::warn!("Dropped frame from {}: {e}", participant.id());
            self.ctx.stats.frame_dropped();
        }
    }

    /// Route one inbound frame.
    pub async fn dispatch(&self, participant: &Participant, data: &[u8]) -> Result<(), HandlerError> {
        let connection = participant.id();
        if self.ctx.registry.document_of(connection) != Some(participant.document.id) {
            return Err(HandlerError::NotAttached(connection));
        }

        let frame = Frame::decode(data)?;
        log::trace!(
            "{connection}: category {} ({} bytes)",
            frame.category(),
            data.len()
        );

        match frame {
            Frame::Sync(payload) => sync::handle(&self.ctx, participant, &payload).await,
            Frame::Awareness(payload) => {
                awareness::handle(&self.ctx, participant, data, &payload).await
            }
            Frame::Control(payload) => control::handle(participant, &payload),
            Frame::Unknown { category, .. } => {
                log::debug!("{connection}: ignoring frame with unknown category {category}");
                Ok(())
            }
        }
    }
}
