//! Process-wide singleton wiring: registry installation and the shared
//! credential cache. Serialized because they touch global state.

use std::sync::Arc;

use muster::auth::Auth;
use muster::credential::Credential;
use muster::pool::Pool;
use muster::transport::mock::{MockSshTransport, MockWinRmTransport};
use muster::transport::Transports;
use serial_test::serial;

fn transports() -> Transports {
    Transports::new(
        Arc::new(MockSshTransport::new()),
        Arc::new(MockWinRmTransport::new()),
    )
}

#[tokio::test]
#[serial]
async fn test_global_registry_first_install_wins() {
    let first = Pool::init_global(transports());
    let again = Pool::init_global(transports());
    assert!(std::ptr::eq(first, again));
    assert!(Pool::global().is_some());
}

#[tokio::test]
#[serial]
async fn test_global_auth_cache_is_shared_and_clearable() {
    let auth = Auth::global();
    auth.assign("global-host", Credential::new("ops"));
    assert_eq!(
        Auth::global().cached("global-host").map(|c| c.user().to_string()),
        Some("ops".to_string())
    );

    Auth::global().evict("global-host");
    assert!(Auth::global().cached("global-host").is_none());
}
