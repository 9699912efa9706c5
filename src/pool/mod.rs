//! Connection pooling: per-host pools and the process-wide registry.

mod host_pool;
mod registry;

pub use host_pool::{
    normalize_key, ConnectOptions, HostPool, PooledConnection, DEFAULT_POOL_SIZE,
    DEFAULT_POOL_TIMEOUT,
};
pub use registry::{Pool, PoolStats};
