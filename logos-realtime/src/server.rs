//! WebSocket transport in front of the [`Gateway`].
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ── tokio::spawn(handle_connection)
//!                               │
//!                  accept_hdr_async (captures path + headers)
//!                               │
//!                      Gateway::on_connect ── rejected ──► Close
//!                               │
//!             ┌─────────────────┼────────────────────┐
//!             ▼                 ▼                    ▼
//!      ws_rx.next()      outbox.next()        heartbeat.tick()
//!      on_message        Binary / Close       Ping
//!                               │
//!                      Gateway::on_disconnect
//! ```
//!
//! One task per connection. Nothing here knows the protocol; frames are
//! handed to the gateway as opaque binary messages.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::collaborators::{ConnectionRequest, Persistence};
use crate::connection::{self, Outbound};
use crate::error::{ServerError, StoreError};
use crate::gateway::Gateway;
use crate::storage::{DocumentStore, MemoryStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames queued per connection before it is closed as too slow
    pub outbound_capacity: usize,
    /// Transport-level ping interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Persistence for this deployment: a RocksDB store at `storage_path`,
    /// or an in-memory store when no path is configured.
    pub fn open_persistence(&self) -> Result<Arc<dyn Persistence>, StoreError> {
        match &self.storage_path {
            Some(path) => Ok(Arc::new(DocumentStore::open(StoreConfig::at(path))?)),
            None => {
                log::warn!("No storage path configured, documents live in memory only");
                Ok(Arc::new(MemoryStore::new()))
            }
        }
    }
}

/// Accept loop feeding WebSocket connections into a [`Gateway`].
pub struct GatewayServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig, gateway: Arc<Gateway>) -> Self {
        Self { config, gateway }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until `shutdown` resolves, then
    /// shut the gateway down.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        log::info!("Realtime gateway listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let gateway = self.gateway.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, gateway, config).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }

        self.gateway.shutdown().await;
        Ok(())
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Handle a single WebSocket connection from handshake to teardown.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
    config: ServerConfig,
) -> Result<(), ServerError> {
    let mut path = String::new();
    let mut headers = HashMap::new();
    let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let request = ConnectionRequest {
        path,
        headers,
        remote_addr: Some(addr),
    };
    let (handle, mut outbox) = connection::channel(config.outbound_capacity);
    let participant = match gateway.on_connect(handle, &request).await {
        Ok(participant) => participant,
        Err(_) => {
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        }
    };
    let connection = participant.id();
    log::info!("WebSocket connection {connection} established from {addr}");

    let mut heartbeat =
        tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs.max(1)));
    // The first tick completes immediately
    heartbeat.tick().await;

    let result: Result<(), ServerError> = loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        gateway.on_message(&participant, &data).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                            break Err(e.into());
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        log::debug!("{connection}: ignoring text message");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {connection} closed by {addr}");
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                }
            }
            outbound = outbox.next() => {
                match outbound {
                    Outbound::Frame(frame) => {
                        if let Err(e) = ws_sender.send(Message::Binary(frame.to_vec().into())).await {
                            break Err(e.into());
                        }
                    }
                    Outbound::Close => {
                        log::info!("Closing connection {connection}");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break Ok(());
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = ws_sender.send(Message::Ping(Vec::new().into())).await {
                    break Err(e.into());
                }
            }
        }
    };

    gateway.on_disconnect(connection).await;
    result
}
