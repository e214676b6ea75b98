//! Built-in collaborators for running the gateway on its own.
//!
//! The surrounding application normally provides identity, lookup and
//! authorization. These implementations are enough for a single-tenant
//! deployment and for local development.

use async_trait::async_trait;
use std::collections::HashSet;
use uuid::Uuid;

use crate::collaborators::{
    Authorization, ConnectionRequest, Document, DocumentId, DocumentLookup, Identity,
    IdentityResolver, LookupError,
};

/// Header set by an authenticating reverse proxy.
pub const FORWARDED_USER_HEADER: &str = "x-forwarded-user";

/// Trusts the proxy's user header, otherwise treats the caller as a guest.
#[derive(Debug, Default, Clone)]
pub struct GuestIdentity;

#[async_trait]
impl IdentityResolver for GuestIdentity {
    async fn resolve_identity(&self, request: &ConnectionRequest) -> Result<Identity, String> {
        match request.header(FORWARDED_USER_HEADER).map(str::trim) {
            Some(name) if !name.is_empty() => Ok(Identity::user(name)),
            _ => Ok(Identity::guest()),
        }
    }
}

/// Resolves a locator as a canonical UUID, or derives a stable id from an alias.
#[derive(Debug, Default, Clone)]
pub struct AliasLookup {
    forbidden: HashSet<String>,
}

impl AliasLookup {
    pub fn new(forbidden: impl IntoIterator<Item = String>) -> Self {
        Self {
            forbidden: forbidden.into_iter().collect(),
        }
    }

    /// Id a given alias maps to.
    pub fn id_for(locator: &str) -> DocumentId {
        match Uuid::parse_str(locator) {
            Ok(id) => DocumentId(id),
            Err(_) => DocumentId(Uuid::new_v5(&Uuid::NAMESPACE_URL, locator.as_bytes())),
        }
    }
}

#[async_trait]
impl DocumentLookup for AliasLookup {
    async fn find_document(&self, locator: &str) -> Result<Document, LookupError> {
        if locator.is_empty() {
            return Err(LookupError::NotFound);
        }
        if self.forbidden.contains(locator) {
            return Err(LookupError::Forbidden);
        }
        Ok(Document {
            id: Self::id_for(locator),
            locator: locator.to_string(),
        })
    }
}

/// Everyone may read; everyone may write unless the deployment is read-only.
#[derive(Debug, Default, Clone)]
pub struct OpenAccess {
    pub read_only: bool,
}

#[async_trait]
impl Authorization for OpenAccess {
    async fn can_read(&self, _identity: &Identity, _document: &Document) -> bool {
        true
    }

    async fn can_write(&self, _identity: &Identity, _document: &Document) -> bool {
        !self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guest_identity_without_header() {
        let identity = GuestIdentity
            .resolve_identity(&ConnectionRequest::new("/realtime/abc"))
            .await
            .unwrap();
        assert!(identity.guest);
    }

    #[tokio::test]
    async fn test_forwarded_user_header() {
        let request = ConnectionRequest::new("/realtime/abc").with_header("X-Forwarded-User", "ada");
        let identity = GuestIdentity.resolve_identity(&request).await.unwrap();
        assert_eq!(identity, Identity::user("ada"));
    }

    #[tokio::test]
    async fn test_alias_ids_are_stable() {
        let lookup = AliasLookup::default();
        let a = lookup.find_document("meeting-notes").await.unwrap();
        let b = lookup.find_document("meeting-notes").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, lookup.find_document("other").await.unwrap().id);
    }

    #[tokio::test]
    async fn test_canonical_uuid_locator() {
        let id = Uuid::new_v4();
        let doc = AliasLookup::default()
            .find_document(&id.to_string())
            .await
            .unwrap();
        assert_eq!(doc.id, DocumentId(id));
    }

    #[tokio::test]
    async fn test_forbidden_alias() {
        let lookup = AliasLookup::new(["admin".to_string()]);
        assert_eq!(
            lookup.find_document("admin").await,
            Err(LookupError::Forbidden)
        );
        assert_eq!(lookup.find_document("").await, Err(LookupError::NotFound));
    }

    #[tokio::test]
    async fn test_read_only_access() {
        let doc = Document {
            id: DocumentId::new(),
            locator: "abc".into(),
        };
        let access = OpenAccess { read_only: true };
        assert!(access.can_read(&Identity::guest(), &doc).await);
        assert!(!access.can_write(&Identity::guest(), &doc).await);
    }
}
