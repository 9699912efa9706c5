//! Credential resolution.
//!
//! [`Auth`] walks an ordered chain of [`CredentialStore`]s and keeps a
//! process-wide cache of resolved credentials keyed by host. A cached entry
//! short-circuits the chain only while both its user and password are
//! populated; anything less and the stores are consulted again, with the
//! fresh hit overwriting the stale entry.
//!
//! The resolver is an explicit service object: library code receives it by
//! reference (usually through the pool context), tests construct their own,
//! and [`Auth::global`] lazily provides the shared process-wide instance.

mod store;

pub use store::{CredentialStore, StaticStore};

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::credential::Credential;
use crate::error::{Error, Result};

static GLOBAL: OnceCell<Arc<Auth>> = OnceCell::new();

/// Resolves credentials through a store chain with a write-through cache.
#[derive(Default)]
pub struct Auth {
    stores: RwLock<Vec<Arc<dyn CredentialStore>>>,
    cache: Mutex<HashMap<String, Credential>>,
}

impl Auth {
    /// Create a resolver with an empty store chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resolver over an ordered store chain.
    pub fn with_stores(stores: Vec<Arc<dyn CredentialStore>>) -> Self {
        Self {
            stores: RwLock::new(stores),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide resolver, created lazily on first use.
    pub fn global() -> Arc<Auth> {
        GLOBAL.get_or_init(|| Arc::new(Auth::new())).clone()
    }

    /// Append a store to the end of the chain.
    pub fn add_store(&self, store: Arc<dyn CredentialStore>) {
        self.stores.write().push(store);
    }

    /// Resolve the credential for a target.
    ///
    /// Cache hits with both user and password populated are returned
    /// without consulting stores. Otherwise each store is queried in
    /// order; the first hit is cached and returned. No hit at all fails
    /// with [`Error::MissingCredential`].
    pub async fn resolve(&self, target: &str) -> Result<Credential> {
        if let Some(cached) = self.cached(target) {
            if cached.is_cache_valid() {
                trace!(target = %target, "Credential cache hit");
                return Ok(cached);
            }
            trace!(target = %target, "Cached credential incomplete, re-resolving");
        }

        // Snapshot the chain so no lock is held across store lookups.
        let stores: Vec<Arc<dyn CredentialStore>> = self.stores.read().clone();
        for store in stores {
            if let Some(credential) = store.credential(target).await? {
                debug!(target = %target, store = %store.name(), "Credential resolved");
                self.cache.lock().insert(target.to_string(), credential.clone());
                return Ok(credential);
            }
        }

        Err(Error::missing_credential(target))
    }

    /// The cached credential for a target, valid or not.
    pub fn cached(&self, target: &str) -> Option<Credential> {
        self.cache.lock().get(target).cloned()
    }

    /// Explicitly assign a credential for a target, bypassing the stores.
    pub fn assign(&self, target: impl Into<String>, credential: Credential) {
        self.cache.lock().insert(target.into(), credential);
    }

    /// Drop the cached credential for one target, forcing re-resolution.
    pub fn evict(&self, target: &str) {
        if self.cache.lock().remove(target).is_some() {
            debug!(target = %target, "Credential cache entry evicted");
        }
    }

    /// Drop every cached credential.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    /// Store that counts lookups, for cache-consultation assertions.
    struct CountingStore {
        lookups: AtomicUsize,
        credential: Option<Credential>,
    }

    impl CountingStore {
        fn returning(credential: Option<Credential>) -> Arc<Self> {
            Arc::new(Self {
                lookups: AtomicUsize::new(0),
                credential,
            })
        }
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        fn name(&self) -> &str {
            "counting"
        }

        async fn credential(&self, _target: &str) -> Result<Option<Credential>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.credential.clone())
        }
    }

    fn full_credential() -> Credential {
        Credential::new("deploy").with_password("pw").unwrap()
    }

    #[tokio::test]
    async fn test_resolve_consults_stores_in_order() {
        let empty = CountingStore::returning(None);
        let hit = CountingStore::returning(Some(full_credential()));
        let unreached = CountingStore::returning(Some(Credential::new("wrong")));

        let auth =
            Auth::with_stores(vec![empty.clone(), hit.clone(), unreached.clone()]);
        let credential = auth.resolve("web01").await.unwrap();

        assert_eq!(credential.user(), "deploy");
        assert_eq!(empty.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(hit.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(unreached.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_valid_cache_hit_skips_stores() {
        let store = CountingStore::returning(Some(full_credential()));
        let auth = Auth::with_stores(vec![store.clone()]);

        auth.resolve("web01").await.unwrap();
        auth.resolve("web01").await.unwrap();

        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_incomplete_cache_entry_forces_re_resolution() {
        let store = CountingStore::returning(Some(full_credential()));
        let auth = Auth::with_stores(vec![store.clone()]);

        // No password: not valid for reuse.
        auth.assign("web01", Credential::new("stale"));
        let credential = auth.resolve("web01").await.unwrap();

        assert_eq!(credential.user(), "deploy");
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
        // The fresh hit overwrote the stale entry.
        assert_eq!(auth.cached("web01").unwrap().user(), "deploy");
    }

    #[tokio::test]
    async fn test_no_store_hit_is_missing_credential() {
        let auth = Auth::with_stores(vec![CountingStore::returning(None)]);
        let err = auth.resolve("web01").await.unwrap_err();
        assert!(matches!(err, Error::MissingCredential { .. }));
    }

    #[tokio::test]
    async fn test_evict_and_clear() {
        let store = CountingStore::returning(Some(full_credential()));
        let auth = Auth::with_stores(vec![store.clone()]);

        auth.resolve("web01").await.unwrap();
        auth.evict("web01");
        auth.resolve("web01").await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);

        auth.clear();
        assert!(auth.cached("web01").is_none());
    }
}
