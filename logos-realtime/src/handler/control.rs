//! CONTROL frames sent by clients.
//!
//! Clients only ever originate `Ping`. Notices that flow server → client are
//! accepted and ignored when a client echoes them back.

use std::sync::Arc;

use crate::codec::{ControlMessage, Frame};
use crate::error::HandlerError;
use crate::registry::Participant;

pub fn handle(participant: &Participant, payload: &[u8]) -> Result<(), HandlerError> {
    let connection = participant.id();
    match ControlMessage::decode(payload)? {
        ControlMessage::Ping => {
            participant
                .handle
                .send(Arc::new(Frame::control(&ControlMessage::Pong).encode()));
        }
        ControlMessage::Pong => log::trace!("{connection}: pong"),
        ControlMessage::Unknown { tag, body } => {
            log::warn!(
                "{connection}: ignoring unknown control sub-tag {tag} ({} bytes)",
                body.len()
            );
        }
        other => log::debug!("{connection}: ignoring server notice {other:?} from client"),
    }
    Ok(())
}
