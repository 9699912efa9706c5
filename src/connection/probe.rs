//! Protocol liveness detection.
//!
//! Used when a pool is created without an explicit protocol: the SSH
//! well-known port is probed first, then WinRM, and the first one that
//! answers decides the host type.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::trace;

use super::Protocol;

/// SSH well-known port.
pub const SSH_PORT: u16 = 22;

/// WinRM well-known port.
pub const WINRM_PORT: u16 = 5985;

/// Default per-port probe timeout.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether a bounded-time TCP connection to `host:port` succeeds.
pub async fn port_open(host: &str, port: u16, timeout: Duration) -> bool {
    let open = matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    );
    trace!(host = %host, port = %port, open = %open, "Port probe");
    open
}

/// Probe the well-known ports and return the first protocol that answers.
pub async fn host_type(host: &str, timeout: Duration) -> Option<Protocol> {
    host_type_with_ports(host, SSH_PORT, WINRM_PORT, timeout).await
}

/// [`host_type`] with explicit port numbers, for non-standard layouts and
/// tests.
pub async fn host_type_with_ports(
    host: &str,
    ssh_port: u16,
    winrm_port: u16,
    timeout: Duration,
) -> Option<Protocol> {
    if port_open(host, ssh_port, timeout).await {
        return Some(Protocol::Ssh);
    }
    if port_open(host, winrm_port, timeout).await {
        return Some(Protocol::Winrm);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A port that was free a moment ago; nothing listens on it.
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_port_open_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_open("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_port_open_against_closed_port() {
        let port = closed_port().await;
        assert!(!port_open("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_host_type_prefers_ssh() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let detected =
            host_type_with_ports("127.0.0.1", port, port, Duration::from_secs(1)).await;
        assert_eq!(detected, Some(Protocol::Ssh));
    }

    #[tokio::test]
    async fn test_host_type_falls_back_to_winrm() {
        let ssh_port = closed_port().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let winrm_port = listener.local_addr().unwrap().port();
        let detected =
            host_type_with_ports("127.0.0.1", ssh_port, winrm_port, Duration::from_secs(1))
                .await;
        assert_eq!(detected, Some(Protocol::Winrm));
    }

    #[tokio::test]
    async fn test_host_type_none_when_nothing_answers() {
        let ssh_port = closed_port().await;
        let winrm_port = closed_port().await;
        let detected =
            host_type_with_ports("127.0.0.1", ssh_port, winrm_port, Duration::from_secs(1))
                .await;
        assert_eq!(detected, None);
    }
}
