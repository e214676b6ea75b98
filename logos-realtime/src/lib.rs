//! # logos-realtime: Realtime document-collaboration gateway
//!
//! Accepts many concurrent binary-protocol connections per document, keeps
//! an authoritative CRDT replica of every open document, merges incoming
//! edits and presence, and fans the converging updates back out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket  ┌───────────────┐   admit   ┌──────────────────┐
//! │ Client A │ ◄─────────► │ GatewayServer │ ────────► │ Gateway          │
//! │ Client B │             │ (per-conn)    │           │  Collaborators   │
//! └──────────┘             └───────┬───────┘           └────────┬─────────┘
//!                                  │ frames                     │ attach/detach
//!                                  ▼                            ▼
//!                          ┌───────────────┐           ┌──────────────────┐
//!                          │ Multiplexer   │ ────────► │ SessionRegistry  │
//!                          │ sync/awareness│           │  DocumentSession │
//!                          │ /control      │           │  (Replica, peers)│
//!                          └───────┬───────┘           └────────┬─────────┘
//!                                  ▼                            ▼
//!                          ┌───────────────┐           ┌──────────────────┐
//!                          │ PresenceStore │           │ ReplicaManager   │
//!                          └───────────────┘           │  → Persistence   │
//!                                                      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: frame categories, SYNC/CONTROL/AWARENESS sub-codecs (lib0 varints)
//! - [`collaborators`]: identity, lookup, authorization and persistence traits
//! - [`connection`]: connection ids and bounded outbound queues
//! - [`replica`]: the `Replica` trait and its yrs implementation
//! - [`presence`]: ephemeral per-connection awareness state
//! - [`registry`]: connection ↔ document mapping and session lifecycle
//! - [`handler`]: per-frame dispatch
//! - [`gateway`]: admission, permission changes, shutdown
//! - [`server`]: WebSocket transport
//! - [`storage`]: in-memory and RocksDB persistence
//! - [`standalone`]: collaborators for running without a host application

pub mod codec;
pub mod collaborators;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod presence;
pub mod registry;
pub mod replica;
pub mod server;
pub mod standalone;
pub mod stats;
pub mod storage;

// Re-exports for convenience
pub use codec::{AwarenessEntry, AwarenessUpdate, ControlMessage, Frame, SyncMessage};
pub use collaborators::{
    Authorization, Collaborators, ConnectionRequest, Document, DocumentId, DocumentLookup,
    Identity, IdentityResolver, LookupError, Persistence,
};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionOutbox, Outbound};
pub use error::{
    AdmissionError, CodecError, HandlerError, RegistryError, ReplicaError, ServerError,
    StoreError,
};
pub use gateway::{parse_document_locator, Gateway};
pub use presence::{PresenceEntry, PresenceStore};
pub use registry::{DocumentSession, Participant, SessionRegistry};
pub use replica::{Replica, ReplicaFactory, ReplicaManager, YrsReplica};
pub use server::{GatewayServer, ServerConfig};
pub use standalone::{AliasLookup, GuestIdentity, OpenAccess};
pub use stats::{GatewayStats, StatsSnapshot};
pub use storage::{DocumentMetadata, DocumentStore, MemoryStore, StoreConfig};
