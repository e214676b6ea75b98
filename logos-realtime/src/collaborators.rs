//! Boundaries to the systems this gateway does not own.
//!
//! Identity, document lookup, authorization and persistence are all injected
//! through [`Collaborators`] at construction time, so every component can be
//! driven by test doubles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreError;

/// Stable document identifier, resolved from a locator by [`DocumentLookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for DocumentId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// The acting user of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub guest: bool,
}

impl Identity {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guest: false,
        }
    }

    pub fn guest() -> Self {
        Self {
            name: "guest".to_string(),
            guest: true,
        }
    }
}

/// A resolved document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: DocumentId,
    /// Locator the client used to reach it
    pub locator: String,
}

/// What the transport knows about an incoming connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    /// Request target path, query string excluded
    pub path: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub remote_addr: Option<SocketAddr>,
}

impl ConnectionRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Document lookup failures. Both `NotFound` and `Forbidden` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    #[error("not found")]
    NotFound,
    #[error("forbidden identifier")]
    Forbidden,
    #[error("lookup backend failed: {0}")]
    Backend(String),
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_identity(&self, request: &ConnectionRequest) -> Result<Identity, String>;
}

#[async_trait]
pub trait DocumentLookup: Send + Sync {
    async fn find_document(&self, locator: &str) -> Result<Document, LookupError>;
}

#[async_trait]
pub trait Authorization: Send + Sync {
    async fn can_read(&self, identity: &Identity, document: &Document) -> bool;

    /// Checked lazily whenever a connection submits an update.
    async fn can_write(&self, identity: &Identity, document: &Document) -> bool;
}

/// Durable storage of document content (encoded CRDT state).
#[async_trait]
pub trait Persistence: Send + Sync {
    /// `None` for a document that has never been saved.
    async fn load_latest_content(&self, id: DocumentId) -> Result<Option<Vec<u8>>, StoreError>;

    async fn save_content(&self, id: DocumentId, content: &[u8]) -> Result<(), StoreError>;
}

/// Everything the gateway consumes from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub identity: Arc<dyn IdentityResolver>,
    pub lookup: Arc<dyn DocumentLookup>,
    pub authorization: Arc<dyn Authorization>,
    pub persistence: Arc<dyn Persistence>,
}
