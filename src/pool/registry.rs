//! Process-wide pool registry.
//!
//! Maps a configuration signature to its [`HostPool`]. All map mutations
//! serialize on one lock; pool construction, which may probe the network,
//! runs outside it with a re-check on insert. The registry is an explicit
//! service object: embedders usually install one process-wide instance
//! with [`Pool::init_global`], while tests construct their own.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::host_pool::{ConnectOptions, HostPool};
use crate::auth::Auth;
use crate::error::Result;
use crate::transport::Transports;

static GLOBAL: OnceCell<Pool> = OnceCell::new();

struct Registered {
    signature: String,
    pool: Arc<HostPool>,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Host pools currently registered.
    pub pools: usize,
}

/// Thread-safe registry of host pools keyed by configuration signature.
pub struct Pool {
    pools: Mutex<HashMap<String, Registered>>,
    transports: Transports,
    auth: Arc<Auth>,
}

impl Pool {
    /// Create a registry over the given transports, resolving credentials
    /// through the process-wide [`Auth`].
    pub fn new(transports: Transports) -> Self {
        Self::with_auth(transports, Auth::global())
    }

    /// Create a registry with an injected credential resolver.
    pub fn with_auth(transports: Transports, auth: Arc<Auth>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            transports,
            auth,
        }
    }

    /// Install the process-wide registry. The first call wins; later
    /// calls return the already-installed instance.
    pub fn init_global(transports: Transports) -> &'static Pool {
        GLOBAL.get_or_init(|| Pool::new(transports))
    }

    /// The process-wide registry, if one has been installed.
    pub fn global() -> Option<&'static Pool> {
        GLOBAL.get()
    }

    /// Return the pool for `host` under `options`, building it on first
    /// use. A host whose existing pool was built under a different
    /// configuration gets a fresh pool; the old one is force-expired and
    /// replaced, to be collected by the next [`reap`](Self::reap).
    pub async fn connect(&self, host: &str, options: ConnectOptions) -> Result<Arc<HostPool>> {
        let signature = options.signature(host);

        if let Some(entry) = self.pools.lock().get(host) {
            if entry.signature == signature {
                return Ok(entry.pool.clone());
            }
        }

        // Construction may probe the network; keep it outside the lock.
        let pool = Arc::new(
            HostPool::build(host, options, self.transports.clone(), self.auth.clone()).await?,
        );

        let mut pools = self.pools.lock();
        let existing = match pools.get(host) {
            // Someone else registered the same configuration while we
            // were building; reuse theirs.
            Some(entry) if entry.signature == signature => Some(entry.pool.clone()),
            Some(entry) => {
                debug!(host = %host, "Configuration changed, replacing host pool");
                entry.pool.expire();
                None
            }
            None => None,
        };
        if let Some(existing) = existing {
            return Ok(existing);
        }
        pools.insert(
            host.to_string(),
            Registered {
                signature,
                pool: pool.clone(),
            },
        );
        Ok(pool)
    }

    /// Remove every expired pool, returning how many were removed.
    pub fn reap(&self) -> usize {
        let mut pools = self.pools.lock();
        let before = pools.len();
        pools.retain(|_, entry| !entry.pool.is_expired());
        let reaped = before - pools.len();
        if reaped > 0 {
            info!(reaped = %reaped, "Reaped expired host pools");
        }
        reaped
    }

    /// Remove every pool unconditionally, returning how many were
    /// removed.
    pub fn clear(&self) -> usize {
        let mut pools = self.pools.lock();
        let cleared = pools.len();
        pools.clear();
        if cleared > 0 {
            info!(cleared = %cleared, "Cleared host pool registry");
        }
        cleared
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Registry statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats { pools: self.len() }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("pools", &self.len())
            .finish_non_exhaustive()
    }
}
