//! SSH gateway (jump host) chaining.
//!
//! When a pool's metadata carries `gateway_host`, its SSH connections open
//! the target session through a tunnel on the gateway instead of directly.
//! The gateway's credential goes through the same resolver as target
//! credentials, and its liveness and identity participate in the owning
//! connection's reconnect check.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::Auth;
use crate::credential::SecretSet;
use crate::error::Result;
use crate::transport::{Keepalive, SshGateway, SshOpenParams, SshSession, Transports};

/// Metadata key activating gateway chaining.
pub const GATEWAY_HOST_KEY: &str = "gateway_host";
/// Metadata key overriding the gateway port (default 22).
pub const GATEWAY_PORT_KEY: &str = "gateway_port";
/// Metadata key carrying free-form gateway metadata.
pub const GATEWAY_METADATA_KEY: &str = "gateway_metadata";

/// Gateway configuration extracted from pool metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// Gateway hostname.
    pub host: String,
    /// Gateway SSH port.
    pub port: u16,
    /// Free-form gateway metadata.
    pub metadata: HashMap<String, Value>,
}

impl GatewayConfig {
    /// Extract a configuration when `gateway_host` is present.
    pub fn from_metadata(metadata: &HashMap<String, Value>) -> Option<Self> {
        let host = metadata.get(GATEWAY_HOST_KEY)?.as_str()?.to_string();
        let port = metadata
            .get(GATEWAY_PORT_KEY)
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(22);
        let gateway_metadata = metadata
            .get(GATEWAY_METADATA_KEY)
            .and_then(Value::as_object)
            .map(|m| m.clone().into_iter().collect())
            .unwrap_or_default();
        Some(Self {
            host,
            port,
            metadata: gateway_metadata,
        })
    }
}

/// A live tunnel endpoint on an intermediate host, created fresh each time
/// the owning connection (re)establishes its session.
pub struct GatewayConnection {
    config: GatewayConfig,
    user: String,
    secrets: SecretSet,
    handle: Box<dyn SshGateway>,
}

impl GatewayConnection {
    /// Resolve the gateway credential and open the gateway session.
    pub async fn open(
        config: GatewayConfig,
        auth: &Auth,
        transports: &Transports,
    ) -> Result<Self> {
        let credential = auth.resolve(&config.host).await?;
        let secrets = credential.secret_set()?;
        debug!(gateway = %config.host, port = %config.port, "Opening gateway session");

        let handle = transports
            .ssh
            .open_gateway(&SshOpenParams {
                host: config.host.clone(),
                port: config.port,
                user: credential.user().to_string(),
                secrets: secrets.clone(),
                keepalive: Keepalive::default(),
            })
            .await?;

        Ok(Self {
            user: credential.user().to_string(),
            secrets,
            config,
            handle,
        })
    }

    /// Open a session to the final target through this gateway.
    pub async fn tunnel(&self, params: &SshOpenParams) -> Result<Box<dyn SshSession>> {
        self.handle.tunnel(params).await
    }

    /// Whether the gateway session is still alive.
    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    /// Whether this gateway still matches the wanted configuration and the
    /// currently resolved credential.
    pub fn is_current(&self, config: &GatewayConfig, user: &str, secrets: &SecretSet) -> bool {
        self.is_active()
            && self.config == *config
            && self.user == user
            && self.secrets.matches(secrets)
    }

    /// Tear the gateway session down. Failures are not propagated; the
    /// gateway is discarded either way.
    pub async fn close(&self) {
        if let Err(err) = self.handle.close().await {
            warn!(gateway = %self.config.host, error = %err, "Gateway close failed");
        }
    }
}

impl fmt::Debug for GatewayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConnection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_absent_without_gateway_host() {
        let metadata = HashMap::from([("role".to_string(), json!("db"))]);
        assert!(GatewayConfig::from_metadata(&metadata).is_none());
    }

    #[test]
    fn test_config_defaults_and_overrides() {
        let metadata = HashMap::from([("gateway_host".to_string(), json!("bastion"))]);
        let config = GatewayConfig::from_metadata(&metadata).unwrap();
        assert_eq!(config.host, "bastion");
        assert_eq!(config.port, 22);
        assert!(config.metadata.is_empty());

        let metadata = HashMap::from([
            ("gateway_host".to_string(), json!("bastion")),
            ("gateway_port".to_string(), json!(2222)),
            ("gateway_metadata".to_string(), json!({"region": "eu"})),
        ]);
        let config = GatewayConfig::from_metadata(&metadata).unwrap();
        assert_eq!(config.port, 2222);
        assert_eq!(config.metadata["region"], json!("eu"));
    }
}
