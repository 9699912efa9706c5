//! # Muster - Pooled Remote Execution
//!
//! Muster runs commands and moves files against fleets of hosts reachable
//! over SSH or WinRM, selecting the protocol per host, pooling connections
//! for reuse, resolving credentials through pluggable stores, and retrying
//! transient connection failures with backoff.
//!
//! ## Core Concepts
//!
//! - **Pool registry**: process-wide map from a configuration signature to
//!   a host pool, with expiration and reaping
//! - **Host pool**: bounded set of reusable connections to one host under
//!   one configuration
//! - **Connections**: protocol variants (SSH, WinRM) behind one capability
//!   trait, with lazy session establishment and a reconnect policy that
//!   reacts to rotated credentials and dead gateways
//! - **Auth**: ordered credential-store chain with a process-wide cache of
//!   resolved credentials, encrypted at rest
//! - **Transports**: narrow traits the wire-level protocol stacks plug
//!   into; scriptable in-memory mocks ship for tests
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Pool (registry)                        │
//! │        signature -> HostPool, reap/clear lifecycle           │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          HostPool                            │
//! │     bounded connection set, sliding expiration, borrow       │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!               ┌───────────────┴───────────────┐
//!               ▼                               ▼
//! ┌─────────────────────────┐     ┌─────────────────────────────┐
//! │      SshConnection      │     │       WinRmConnection       │
//! │  run / upload / sudo /  │     │   run / transfer / exists   │
//! │    gateway chaining     │     │      elevated shells        │
//! └─────────────────────────┘     └─────────────────────────────┘
//!               │                               │
//!               ▼                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Transports (SSH / WinRM protocol stacks)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Credential resolution ([`auth::Auth`]) sits beside the connection
//! layer: every session (re)build resolves the target's credential, so a
//! rotated secret is picked up by the next operation instead of the stale
//! session limping on.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use muster::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Bind the protocol stacks and install the registry.
//!     let pool = Pool::init_global(transports);
//!
//!     // Register a credential store.
//!     Auth::global().add_store(Arc::new(
//!         StaticStore::new().with_fallback(Credential::new("deploy").with_password("pw")?),
//!     ));
//!
//!     // Borrow a connection and run a command.
//!     let host_pool = pool
//!         .connect("web01.example.com", ConnectOptions::new().protocol(Protocol::Ssh))
//!         .await?;
//!     let result = host_pool
//!         .with(|conn| async move { conn.run("hostname", &[], &RunOptions::new()).await })
//!         .await?;
//!     println!("{}", result.stdout);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Credential resolution: store chain plus process-wide cache.
pub mod auth;

/// Connection layer: protocol variants, gateway chaining, retry, probing.
pub mod connection;

/// Credentials with at-rest secret encryption.
pub mod credential;

/// Error types.
pub mod error;

/// Per-host pools and the process-wide registry.
pub mod pool;

/// Command and transfer results.
pub mod result;

/// Protocol transport traits and test mocks.
pub mod transport;

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::auth::{Auth, CredentialStore, StaticStore};
    pub use crate::connection::{
        Connection, Protocol, RunOptions, TransferOptions, DEFAULT_RETRIES,
    };
    pub use crate::credential::{Credential, SecretSet};
    pub use crate::error::{Error, Result};
    pub use crate::pool::{ConnectOptions, HostPool, Pool, PooledConnection};
    pub use crate::result::ExecResult;
    pub use crate::transport::Transports;
}

pub use error::{Error, Result};
