//! AWARENESS frames: store the sender's presence, relay the frame as is.

use std::sync::Arc;

use crate::codec::AwarenessUpdate;
use crate::error::HandlerError;
use crate::handler::HandlerContext;
use crate::registry::Participant;

/// `frame` is the complete inbound frame, `payload` its AWARENESS payload.
pub async fn handle(
    ctx: &HandlerContext,
    participant: &Participant,
    frame: &[u8],
    payload: &[u8],
) -> Result<(), HandlerError> {
    let connection = participant.id();
    let document = participant.document.id;
    let update = AwarenessUpdate::decode(payload)?;
    let frame = Arc::new(frame.to_vec());

    let sent = ctx
        .registry
        .with_session(document, |session| {
            ctx.presence
                .set(document, connection, payload.to_vec(), &update);
            session.broadcast(frame, Some(connection))
        })
        .await
        .ok_or(HandlerError::NotAttached(connection))?;

    ctx.stats.frames_broadcast(sent);
    Ok(())
}
