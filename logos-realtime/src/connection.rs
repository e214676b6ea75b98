//! Connection identity and the outbound side of a live connection.
//!
//! The transport owns the socket. Everything else holds a cheap
//! [`ConnectionHandle`] that can enqueue frames and request a close.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Opaque per-connection identity. Minted once per accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", &self.0.simple().to_string()[..8])
    }
}

struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

/// Sending half of a connection.
///
/// Frames are pre-encoded and shared, so fan-out to N peers costs N pointer
/// copies. The queue is bounded; a peer that cannot keep up is closed instead
/// of stalling the document it belongs to.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::Sender<Arc<Vec<u8>>>,
    close: Arc<CloseSignal>,
}

/// What [`ConnectionOutbox::next`] yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Frame(Arc<Vec<u8>>),
    Close,
}

async fn wait_closed(signal: &CloseSignal) {
    loop {
        let notified = signal.notify.notified();
        if signal.closed.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// Receiving half of a connection, drained by the transport task.
pub struct ConnectionOutbox {
    rx: mpsc::Receiver<Arc<Vec<u8>>>,
    close: Arc<CloseSignal>,
}

/// Create a handle/outbox pair with the given queue capacity.
pub fn channel(capacity: usize) -> (ConnectionHandle, ConnectionOutbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let close = Arc::new(CloseSignal {
        closed: AtomicBool::new(false),
        notify: Notify::new(),
    });
    (
        ConnectionHandle {
            id: ConnectionId::new(),
            tx,
            close: close.clone(),
        },
        ConnectionOutbox { rx, close },
    )
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue an encoded frame. Returns `false` if the frame was not queued.
    ///
    /// A full queue closes the connection: the client is too far behind to
    /// converge from the stream and has to resync from a fresh handshake.
    pub fn send(&self, frame: Arc<Vec<u8>>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Outbound queue full for {}, closing connection", self.id);
                self.close();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Request the transport to close this connection.
    pub fn close(&self) {
        if !self.close.closed.swap(true, Ordering::SeqCst) {
            self.close.notify.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionOutbox {
    /// Next frame to write. `None` once every handle is gone.
    pub async fn recv(&mut self) -> Option<Arc<Vec<u8>>> {
        self.rx.recv().await
    }

    /// Non-blocking receive, used by tests and drain loops.
    pub fn try_recv(&mut self) -> Option<Arc<Vec<u8>>> {
        self.rx.try_recv().ok()
    }

    /// Resolves once a close was requested through any handle.
    pub async fn closed(&self) {
        wait_closed(&self.close).await
    }

    /// Next thing the transport has to do. Frames queued before a close are
    /// still delivered ahead of it.
    pub async fn next(&mut self) -> Outbound {
        tokio::select! {
            biased;
            frame = self.rx.recv() => match frame {
                Some(frame) => Outbound::Frame(frame),
                None => Outbound::Close,
            },
            _ = wait_closed(&self.close) => Outbound::Close,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close.closed.load(Ordering::SeqCst)
    }
}
