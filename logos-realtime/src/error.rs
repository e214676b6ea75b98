use thiserror::Error;

use crate::connection::ConnectionId;
use crate::DocumentId;

/// Wire codec errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Empty frame")]
    Empty,

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Unknown sync message type: {0}")]
    UnknownSyncType(u32),
}

/// CRDT replica errors.
#[derive(Error, Debug, Clone)]
pub enum ReplicaError {
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Failed to load document {0}: {1}")]
    Load(DocumentId, StoreError),
}

/// Persistence errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Session registry errors.
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    #[error("Connection {connection} is already attached to document {document}")]
    AlreadyAttached {
        connection: ConnectionId,
        document: DocumentId,
    },

    #[error(transparent)]
    Replica(#[from] ReplicaError),
}

/// Reasons a connection is refused at admission.
#[derive(Error, Debug, Clone)]
pub enum AdmissionError {
    #[error("Request path does not name a document: {0}")]
    InvalidPath(String),

    #[error("Identity resolution failed: {0}")]
    Identity(String),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document may not be accessed: {0}")]
    Forbidden(String),

    #[error("Document lookup failed: {0}")]
    Lookup(String),

    #[error("Read access denied")]
    Unauthorized,

    #[error("Attach failed: {0}")]
    Attach(#[from] RegistryError),
}

/// Recoverable per-frame errors. The frame is dropped, the connection stays.
#[derive(Error, Debug, Clone)]
pub enum HandlerError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Replica(#[from] ReplicaError),

    #[error("Connection {0} is not attached to a document")]
    NotAttached(ConnectionId),
}

/// Transport server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
