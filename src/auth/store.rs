//! Credential store trait and built-in stores.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::{Error, Result};

/// A pluggable lookup source for resolving a target's credential.
///
/// Implementations override [`credential`](CredentialStore::credential);
/// the default body fails with [`Error::MissingOverride`], which marks a
/// store that was wired in without implementing the contract. That is a
/// defect in the embedding program, not a runtime fault.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store name, used in logs and contract-violation errors.
    fn name(&self) -> &str {
        "credential store"
    }

    /// Look up the credential for a target host. `Ok(None)` means this
    /// store has nothing for the target and the next store in the chain
    /// should be consulted.
    async fn credential(&self, target: &str) -> Result<Option<Credential>> {
        let _ = target;
        Err(Error::MissingOverride {
            store: self.name().to_string(),
        })
    }

    /// Convenience: the username from this store's credential, if any.
    async fn user(&self, target: &str) -> Result<Option<String>> {
        Ok(self
            .credential(target)
            .await?
            .map(|c| c.user().to_string()))
    }

    /// Convenience: the password from this store's credential, if any.
    async fn password(&self, target: &str) -> Result<Option<String>> {
        match self.credential(target).await? {
            Some(credential) => credential.password(),
            None => Ok(None),
        }
    }
}

/// In-memory map-backed store, with an optional fallback credential for
/// targets that have no dedicated entry.
#[derive(Debug, Default)]
pub struct StaticStore {
    entries: HashMap<String, Credential>,
    fallback: Option<Credential>,
}

impl StaticStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a credential for one target.
    pub fn with_entry(mut self, target: impl Into<String>, credential: Credential) -> Self {
        self.entries.insert(target.into(), credential);
        self
    }

    /// Builder: credential returned for targets without a dedicated entry.
    pub fn with_fallback(mut self, credential: Credential) -> Self {
        self.fallback = Some(credential);
        self
    }

    /// Register a credential for one target.
    pub fn insert(&mut self, target: impl Into<String>, credential: Credential) {
        self.entries.insert(target.into(), credential);
    }
}

#[async_trait]
impl CredentialStore for StaticStore {
    fn name(&self) -> &str {
        "static"
    }

    async fn credential(&self, target: &str) -> Result<Option<Credential>> {
        Ok(self
            .entries
            .get(target)
            .or(self.fallback.as_ref())
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Unimplemented;
    impl CredentialStore for Unimplemented {}

    #[tokio::test]
    async fn test_missing_override_is_a_contract_error() {
        let store = Unimplemented;
        let err = store.credential("web01").await.unwrap_err();
        assert!(matches!(err, Error::MissingOverride { .. }));
    }

    #[tokio::test]
    async fn test_static_store_entry_and_fallback() {
        let store = StaticStore::new()
            .with_entry("web01", Credential::new("deploy"))
            .with_fallback(Credential::new("root"));

        let hit = store.credential("web01").await.unwrap().unwrap();
        assert_eq!(hit.user(), "deploy");

        let fallback = store.credential("db01").await.unwrap().unwrap();
        assert_eq!(fallback.user(), "root");
    }

    #[tokio::test]
    async fn test_derived_user_and_password() {
        let store = StaticStore::new()
            .with_entry("web01", Credential::new("deploy").with_password("pw").unwrap());

        assert_eq!(store.user("web01").await.unwrap().as_deref(), Some("deploy"));
        assert_eq!(store.password("web01").await.unwrap().as_deref(), Some("pw"));
        assert_eq!(store.user("absent").await.unwrap(), None);
    }
}
