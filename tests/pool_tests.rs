//! Tests for host pools and the registry: identity and replacement
//! semantics, sliding expiration and reaping, borrow backpressure,
//! metadata validation, and protocol detection.

use std::sync::Arc;
use std::time::Duration;

use muster::auth::{Auth, StaticStore};
use muster::connection::{Protocol, RunOptions};
use muster::credential::Credential;
use muster::error::Error;
use muster::pool::{ConnectOptions, Pool};
use muster::transport::mock::{MockSshTransport, MockWinRmTransport};
use muster::transport::Transports;

use pretty_assertions::assert_eq;

fn registry() -> (Pool, Arc<MockSshTransport>) {
    let ssh = Arc::new(MockSshTransport::new());
    let winrm = Arc::new(MockWinRmTransport::new());
    let auth = Arc::new(Auth::new());
    auth.add_store(Arc::new(StaticStore::new().with_fallback(
        Credential::new("deploy").with_password("pw").unwrap(),
    )));
    (
        Pool::with_auth(Transports::new(ssh.clone(), winrm), auth),
        ssh,
    )
}

fn ssh_options() -> ConnectOptions {
    ConnectOptions::new().protocol(Protocol::Ssh)
}

// ============================================================================
// Registry identity and replacement
// ============================================================================

#[tokio::test]
async fn test_identical_options_share_a_pool() {
    let (registry, _ssh) = registry();

    let first = registry.connect("web01", ssh_options()).await.unwrap();
    let second = registry.connect("web01", ssh_options()).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_differing_options_replace_without_closing_the_old_pool() {
    let (registry, _ssh) = registry();

    let ssh_pool = registry.connect("web01", ssh_options()).await.unwrap();
    let winrm_pool = registry
        .connect("web01", ConnectOptions::new().protocol(Protocol::Winrm))
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&ssh_pool, &winrm_pool));
    assert_eq!(registry.len(), 1);
    // The replaced pool is force-expired but stays usable until reaped.
    assert!(ssh_pool.is_expired());
    ssh_pool
        .with(|conn| async move { conn.run("true", &[], &RunOptions::new()).await })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_differing_metadata_is_a_different_signature() {
    let (registry, _ssh) = registry();

    let plain = registry.connect("db01", ssh_options()).await.unwrap();
    let gatewayed = registry
        .connect(
            "db01",
            ssh_options().metadata("gateway_host", serde_json::json!("bastion")),
        )
        .await
        .unwrap();

    assert!(!Arc::ptr_eq(&plain, &gatewayed));
    assert!(plain.is_expired());
}

#[tokio::test]
async fn test_pools_for_different_hosts_are_independent() {
    let (registry, _ssh) = registry();

    registry.connect("web01", ssh_options()).await.unwrap();
    registry.connect("web02", ssh_options()).await.unwrap();

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.stats().pools, 2);
}

// ============================================================================
// Expiration and reaping
// ============================================================================

#[tokio::test]
async fn test_expire_then_reap_removes_exactly_that_pool() {
    let (registry, _ssh) = registry();

    let doomed = registry.connect("web01", ssh_options()).await.unwrap();
    registry.connect("web02", ssh_options()).await.unwrap();

    doomed.expire();
    assert!(doomed.is_expired());

    assert_eq!(registry.reap(), 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.reap(), 0);
}

#[tokio::test]
async fn test_reap_on_empty_or_fresh_registry_returns_zero() {
    let (registry, _ssh) = registry();
    assert_eq!(registry.reap(), 0);

    registry.connect("web01", ssh_options()).await.unwrap();
    assert_eq!(registry.reap(), 0);
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let (registry, _ssh) = registry();

    registry.connect("web01", ssh_options()).await.unwrap();
    registry.connect("web02", ssh_options()).await.unwrap();

    assert_eq!(registry.clear(), 2);
    assert!(registry.is_empty());
    assert_eq!(registry.clear(), 0);
}

#[tokio::test]
async fn test_borrowing_extends_the_expiration_window() {
    let (registry, _ssh) = registry();

    let pool = registry
        .connect(
            "web01",
            ssh_options().timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    // Let most of the window elapse, then borrow: the deadline slides
    // forward and the pool is fresh again.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let borrowed = pool.checkout().await.unwrap();
    drop(borrowed);
    assert!(!pool.is_expired());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(pool.is_expired());
}

// ============================================================================
// Borrow backpressure
// ============================================================================

#[tokio::test]
async fn test_capacity_bounds_concurrent_borrows() {
    let (registry, _ssh) = registry();

    let pool = registry
        .connect(
            "web01",
            ssh_options().size(1).timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    let held = pool.checkout().await.unwrap();
    let err = pool.checkout().await.unwrap_err();
    assert!(matches!(err, Error::PoolTimeout { .. }));

    drop(held);
    // Slot freed: borrowing works again and reuses the same connection.
    let reborrowed = pool.checkout().await.unwrap();
    drop(reborrowed);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_close_marks_the_pool_for_rebuild() {
    let (registry, ssh) = registry();

    let pool = registry.connect("web01", ssh_options()).await.unwrap();
    pool.with(|conn| async move { conn.run("true", &[], &RunOptions::new()).await })
        .await
        .unwrap();
    assert_eq!(pool.idle_count(), 1);

    pool.close().await;
    assert_eq!(pool.idle_count(), 0);

    // Next use builds a fresh connection and session.
    pool.with(|conn| async move { conn.run("true", &[], &RunOptions::new()).await })
        .await
        .unwrap();
    assert_eq!(ssh.opens().len(), 2);
}

// ============================================================================
// Metadata
// ============================================================================

#[tokio::test]
async fn test_reserved_metadata_key_fails_construction() {
    let (registry, _ssh) = registry();

    let err = registry
        .connect(
            "web01",
            ssh_options().metadata("Close", serde_json::json!(true)),
        )
        .await
        .unwrap_err();

    match err {
        Error::InvalidMetadataKey { key } => assert_eq!(key, "Close"),
        other => panic!("expected InvalidMetadataKey, got {other:?}"),
    }
}

#[tokio::test]
async fn test_metadata_get_and_set() {
    let (registry, _ssh) = registry();

    let pool = registry
        .connect(
            "web01",
            ssh_options().metadata("role", serde_json::json!("db")),
        )
        .await
        .unwrap();

    assert_eq!(pool.get("role"), Some(serde_json::json!("db")));
    assert_eq!(pool.get("absent"), None);

    pool.set("role", serde_json::json!("cache")).unwrap();
    assert_eq!(pool.get("role"), Some(serde_json::json!("cache")));

    let err = pool.set("expire", serde_json::json!(1)).unwrap_err();
    assert!(matches!(err, Error::InvalidMetadataKey { .. }));
}

// ============================================================================
// Protocol detection
// ============================================================================

#[tokio::test]
async fn test_unreachable_host_fails_type_determination() {
    let (registry, _ssh) = registry();

    // TEST-NET-3: guaranteed unrouted, so neither well-known port answers.
    let err = registry
        .connect("203.0.113.1", ConnectOptions::new())
        .await
        .unwrap_err();

    match err {
        Error::HostTypeDetermination { host } => assert_eq!(host, "203.0.113.1"),
        other => panic!("expected HostTypeDetermination, got {other:?}"),
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_explicit_port_overrides_the_well_known_default() {
    let (registry, ssh) = registry();

    let pool = registry
        .connect("web01", ssh_options().port(2222))
        .await
        .unwrap();
    assert_eq!(pool.port(), 2222);

    pool.with(|conn| async move { conn.run("true", &[], &RunOptions::new()).await })
        .await
        .unwrap();
    assert_eq!(ssh.opens()[0].port, 2222);
}
