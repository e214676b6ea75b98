//! SYNC frames: the Step1/Step2 handshake and incremental updates.

use std::sync::Arc;

use crate::codec::{is_empty_update, ControlMessage, Frame, SyncMessage};
use crate::error::{HandlerError, ReplicaError};
use crate::handler::HandlerContext;
use crate::registry::Participant;

pub async fn handle(
    ctx: &HandlerContext,
    participant: &Participant,
    payload: &[u8],
) -> Result<(), HandlerError> {
    let connection = participant.id();
    let document = participant.document.id;

    match SyncMessage::decode(payload)? {
        SyncMessage::Step1(summary) => {
            // Reply inside the critical section so it is ordered with broadcasts
            ctx.registry
                .with_session(document, |session| {
                    let diff = session.replica().diff(&summary)?;
                    let reply = Frame::sync(&SyncMessage::Step2(diff)).encode();
                    session.send_to(connection, Arc::new(reply));
                    Ok::<(), ReplicaError>(())
                })
                .await
                .ok_or(HandlerError::NotAttached(connection))??;
        }
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            // An up-to-date client answers our Step1 with an empty update
            if is_empty_update(&update) {
                log::trace!("{connection}: empty update for {document}");
                return Ok(());
            }

            if !ctx
                .authorization
                .can_write(&participant.identity, &participant.document)
                .await
            {
                log::info!("{connection} may not write to {document}, update rejected");
                participant
                    .handle
                    .send(Arc::new(Frame::control(&ControlMessage::WriteRejected).encode()));
                ctx.stats.frame_dropped();
                return Ok(());
            }

            let frame = Arc::new(Frame::sync(&SyncMessage::Update(update.clone())).encode());
            let sent = ctx
                .registry
                .with_session(document, |session| -> Result<Option<usize>, ReplicaError> {
                    if !session.apply_update(&update)? {
                        return Ok(None);
                    }
                    Ok(Some(session.broadcast(frame, Some(connection))))
                })
                .await
                .ok_or(HandlerError::NotAttached(connection))??;

            match sent {
                Some(sent) => {
                    ctx.stats.update_merged();
                    ctx.stats.frames_broadcast(sent);
                    log::trace!(
                        "{connection}: merged {} bytes into {document}, sent to {sent} peers",
                        update.len()
                    );
                }
                None => log::trace!("{connection}: update already known to {document}"),
            }
        }
    }
    Ok(())
}
