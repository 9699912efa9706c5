//! Per-host connection pool with sliding expiration.
//!
//! A [`HostPool`] holds at most `size` connections to one host under one
//! configuration. Borrowing waits up to the pool timeout for a free slot;
//! that wait is the only backpressure bounding concurrent sessions per
//! host. Every borrow pushes the expiration deadline forward, so a pool in
//! active use never expires mid-use; an expired pool keeps working until
//! the registry reaps it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace, warn};

use crate::auth::Auth;
use crate::connection::{build_connection, probe, Connection, PoolContext, Protocol};
use crate::error::{Error, Result};
use crate::transport::Transports;

/// Connections kept per host when the caller does not say otherwise.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Borrow timeout and expiration window when the caller does not say
/// otherwise.
pub const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Pool operation names metadata keys must not shadow.
const RESERVED_METADATA_KEYS: &[&str] = &[
    "host",
    "port",
    "protocol",
    "size",
    "timeout",
    "metadata",
    "connect",
    "checkout",
    "with",
    "expire",
    "expired",
    "is_expired",
    "close",
];

/// Fold a free-form key to a canonical identifier: lowercase, word
/// boundaries collapsed to underscores. Used only to detect collisions
/// with reserved operation names, never to synthesize anything.
pub fn normalize_key(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len());
    let mut last_was_separator = true;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            normalized.push('_');
            last_was_separator = true;
        }
    }
    while normalized.ends_with('_') {
        normalized.pop();
    }
    normalized
}

fn validate_metadata_key(key: &str) -> Result<()> {
    if RESERVED_METADATA_KEYS.contains(&normalize_key(key).as_str()) {
        return Err(Error::InvalidMetadataKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

/// Configuration for one `connect` call. Only explicitly supplied options
/// participate in the registry signature.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Protocol; probed from the well-known ports when absent.
    pub protocol: Option<Protocol>,
    /// Target port; the protocol's well-known port when absent.
    pub port: Option<u16>,
    /// Pool capacity; [`DEFAULT_POOL_SIZE`] when absent.
    pub size: Option<usize>,
    /// Borrow timeout and expiration window; [`DEFAULT_POOL_TIMEOUT`]
    /// when absent.
    pub timeout: Option<Duration>,
    /// Free-form pool metadata, gateway configuration included.
    pub metadata: HashMap<String, Value>,
}

impl ConnectOptions {
    /// New options with nothing supplied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the protocol.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the pool capacity.
    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    /// Set the borrow timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add one metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The configuration signature: host plus every explicitly supplied
    /// option. Two connects agree on a pool exactly when their signatures
    /// agree.
    pub fn signature(&self, host: &str) -> String {
        let mut parts = vec![format!("host={}", host)];
        if let Some(protocol) = self.protocol {
            parts.push(format!("protocol={}", protocol));
        }
        if let Some(port) = self.port {
            parts.push(format!("port={}", port));
        }
        if let Some(size) = self.size {
            parts.push(format!("size={}", size));
        }
        if let Some(timeout) = self.timeout {
            parts.push(format!("timeout={}", timeout.as_millis()));
        }
        let mut keys: Vec<&String> = self.metadata.keys().collect();
        keys.sort();
        for key in keys {
            parts.push(format!("meta.{}={}", key, self.metadata[key]));
        }
        parts.join(";")
    }
}

/// Bounded set of reusable connections to one host under one
/// configuration.
pub struct HostPool {
    ctx: Arc<PoolContext>,
    size: usize,
    timeout: Duration,
    expiration: Mutex<Instant>,
    slots: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Arc<dyn Connection>>>>,
    /// Bumped by `close`; borrowed connections from older generations are
    /// closed instead of returned to the idle set.
    generation: Arc<AtomicU64>,
}

impl HostPool {
    /// Construct a pool, probing the protocol when none was supplied.
    pub async fn build(
        host: &str,
        options: ConnectOptions,
        transports: Transports,
        auth: Arc<Auth>,
    ) -> Result<Self> {
        for key in options.metadata.keys() {
            validate_metadata_key(key)?;
        }

        let protocol = match options.protocol {
            Some(protocol) => protocol,
            None => probe::host_type(host, probe::DEFAULT_PROBE_TIMEOUT)
                .await
                .ok_or_else(|| Error::HostTypeDetermination {
                    host: host.to_string(),
                })?,
        };
        let port = options.port.unwrap_or_else(|| protocol.well_known_port());
        let size = options.size.unwrap_or(DEFAULT_POOL_SIZE).max(1);
        let timeout = options.timeout.unwrap_or(DEFAULT_POOL_TIMEOUT);

        debug!(
            host = %host,
            protocol = %protocol,
            port = %port,
            size = %size,
            "Host pool created"
        );

        Ok(Self {
            ctx: Arc::new(PoolContext {
                host: host.to_string(),
                port,
                protocol,
                metadata: parking_lot::RwLock::new(options.metadata),
                auth,
                transports,
            }),
            size,
            timeout,
            expiration: Mutex::new(Instant::now() + timeout),
            slots: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Mutex::new(Vec::with_capacity(size))),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Target hostname.
    pub fn host(&self) -> &str {
        &self.ctx.host
    }

    /// Selected protocol.
    pub fn protocol(&self) -> Protocol {
        self.ctx.protocol
    }

    /// Target port.
    pub fn port(&self) -> u16 {
        self.ctx.port
    }

    /// Pool capacity.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Borrow timeout and expiration window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Metadata value for a key, if present.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.ctx.get(key)
    }

    /// Replace one metadata value. Reserved operation names are rejected
    /// here exactly as at construction.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        validate_metadata_key(&key)?;
        self.ctx.set(key, value);
        Ok(())
    }

    /// Borrow a connection, waiting up to the pool timeout for a slot.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        self.checkout_with(Duration::ZERO).await
    }

    /// [`checkout`](Self::checkout) with extra headroom added to both the
    /// slot wait and the expiration extension.
    pub async fn checkout_with(&self, extra: Duration) -> Result<PooledConnection> {
        let window = self.timeout + extra;
        let permit = tokio::time::timeout(window, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| Error::PoolTimeout {
                host: self.ctx.host.clone(),
                timeout_secs: window.as_secs(),
            })?
            .map_err(|_| Error::Transport("connection pool is shut down".into()))?;

        // Extend before handing out: a pool in active use never expires
        // mid-use.
        *self.expiration.lock() = Instant::now() + window;

        let connection = {
            let mut idle = self.idle.lock();
            idle.pop()
        };
        let connection = match connection {
            Some(connection) => {
                trace!(host = %self.ctx.host, "Reusing pooled connection");
                connection
            }
            None => {
                trace!(host = %self.ctx.host, "Creating pooled connection");
                build_connection(self.ctx.clone())
            }
        };

        Ok(PooledConnection {
            connection,
            idle: self.idle.clone(),
            generation: self.generation.clone(),
            generation_at_checkout: self.generation.load(Ordering::SeqCst),
            _permit: permit,
        })
    }

    /// Borrow a connection for the duration of `f`.
    pub async fn with<T, Fut>(
        &self,
        f: impl FnOnce(Arc<dyn Connection>) -> Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let borrowed = self.checkout().await?;
        f(borrowed.connection()).await
    }

    /// Force immediate expiration; the pool stays usable until reaped.
    pub fn expire(&self) {
        *self.expiration.lock() = Instant::now();
    }

    /// Whether the expiration deadline has passed.
    pub fn is_expired(&self) -> bool {
        *self.expiration.lock() <= Instant::now()
    }

    /// Close every pooled connection and mark the pool for full rebuild on
    /// next use.
    pub async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let drained: Vec<Arc<dyn Connection>> = std::mem::take(&mut *self.idle.lock());
        for connection in drained {
            if let Err(err) = connection.close().await {
                warn!(host = %self.ctx.host, error = %err, "Connection close failed");
            }
        }
    }

    /// Connections currently parked in the idle set.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("host", &self.ctx.host)
            .field("protocol", &self.ctx.protocol)
            .field("port", &self.ctx.port)
            .field("size", &self.size)
            .field("timeout", &self.timeout)
            .field("expired", &self.is_expired())
            .finish_non_exhaustive()
    }
}

/// A borrowed connection. Dropping it returns the connection to the idle
/// set and frees the slot; if the pool was closed in the meantime the
/// connection is closed instead of returned.
pub struct PooledConnection {
    connection: Arc<dyn Connection>,
    idle: Arc<Mutex<Vec<Arc<dyn Connection>>>>,
    generation: Arc<AtomicU64>,
    generation_at_checkout: u64,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// A shared handle to the borrowed connection.
    pub fn connection(&self) -> Arc<dyn Connection> {
        self.connection.clone()
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("generation_at_checkout", &self.generation_at_checkout)
            .finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Arc<dyn Connection>;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.generation.load(Ordering::SeqCst) == self.generation_at_checkout {
            self.idle.lock().push(self.connection.clone());
        } else {
            let connection = self.connection.clone();
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_key_folds_case_and_boundaries() {
        assert_eq!(normalize_key("Gateway-Host"), "gateway_host");
        assert_eq!(normalize_key("gateway host"), "gateway_host");
        assert_eq!(normalize_key("  Close "), "close");
        assert_eq!(normalize_key("isExpired"), "isexpired");
    }

    #[test]
    fn test_signature_includes_only_supplied_options() {
        let bare = ConnectOptions::new().signature("web01");
        assert_eq!(bare, "host=web01");

        let full = ConnectOptions::new()
            .protocol(Protocol::Ssh)
            .port(2222)
            .metadata("role", serde_json::json!("db"))
            .signature("web01");
        assert!(full.contains("protocol=ssh"));
        assert!(full.contains("port=2222"));
        assert!(full.contains("meta.role=\"db\""));
    }

    #[test]
    fn test_signature_is_stable_across_metadata_order() {
        let a = ConnectOptions::new()
            .metadata("b", serde_json::json!(1))
            .metadata("a", serde_json::json!(2))
            .signature("web01");
        let b = ConnectOptions::new()
            .metadata("a", serde_json::json!(2))
            .metadata("b", serde_json::json!(1))
            .signature("web01");
        assert_eq!(a, b);
    }
}
