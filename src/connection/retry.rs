//! Retry wrapper around one logical command or transfer.
//!
//! Two failure classes are retried, each with its own recovery:
//!
//! - authentication failures evict the target's cached credential and
//!   retry immediately, so the next attempt re-resolves through the store
//!   chain;
//! - closed-stream transport errors tear the connection down and retry
//!   after exponential backoff (1s, 2s, 4s, ...), so the next attempt
//!   rebuilds the session.
//!
//! Everything else propagates on the first occurrence. Exhausting the
//! attempt budget re-raises the last underlying error.

use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::auth::Auth;
use crate::error::Result;

/// Base delay for closed-stream backoff.
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Run `operation` with up to `attempts` tries under the policy above.
/// `teardown` is invoked before a closed-stream retry to force a full
/// session rebuild.
pub(crate) async fn with_retries<'a, T>(
    target: &str,
    auth: &Auth,
    attempts: u32,
    mut operation: impl FnMut() -> BoxFuture<'a, Result<T>>,
    teardown: impl Fn() -> BoxFuture<'a, ()>,
) -> Result<T> {
    let mut delay = BACKOFF_BASE;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.is_auth_failure() {
            if attempt >= attempts {
                warn!(target = %target, attempts = %attempt, "Authentication retries exhausted");
                return Err(err);
            }
            debug!(target = %target, attempt = %attempt, "Authentication failed, evicting cached credential");
            auth.evict(target);
        } else if err.is_closed_stream() {
            if attempt >= attempts {
                warn!(target = %target, attempts = %attempt, "Closed-stream retries exhausted");
                return Err(err);
            }
            debug!(
                target = %target,
                attempt = %attempt,
                delay_secs = %delay.as_secs(),
                "Stream closed, rebuilding connection after backoff"
            );
            teardown().await;
            tokio::time::sleep(delay).await;
            delay *= 2;
        } else {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures::FutureExt;

    use crate::error::Error;

    #[tokio::test]
    async fn test_first_success_returns_immediately() {
        let auth = Auth::new();
        let calls = AtomicUsize::new(0);
        let value = with_retries(
            "web01",
            &auth,
            8,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }.boxed()
            },
            || async {}.boxed(),
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_evicts_and_retries_immediately() {
        let auth = Auth::new();
        auth.assign("web01", crate::credential::Credential::new("stale"));
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_op = calls.clone();
        let result: Result<()> = with_retries(
            "web01",
            &auth,
            3,
            move || {
                calls_op.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::authentication("web01", "rejected")) }.boxed()
            },
            || async {}.boxed(),
        )
        .await;

        assert!(matches!(result, Err(Error::Authentication { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(auth.cached("web01").is_none());
    }

    #[tokio::test]
    async fn test_closed_stream_tears_down_and_backs_off() {
        tokio::time::pause();
        let auth = Auth::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let teardowns = Arc::new(AtomicUsize::new(0));

        let calls_op = calls.clone();
        let teardowns_cl = teardowns.clone();
        let value = with_retries(
            "web01",
            &auth,
            8,
            move || {
                let n = calls_op.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::ClosedStream("mid-transfer".into()))
                    } else {
                        Ok("done")
                    }
                }
                .boxed()
            },
            move || {
                teardowns_cl.fetch_add(1, Ordering::SeqCst);
                async {}.boxed()
            },
        )
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(teardowns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_propagate_without_retry() {
        let auth = Auth::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_op = calls.clone();

        let result: Result<()> = with_retries(
            "web01",
            &auth,
            8,
            move || {
                calls_op.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Transport("connection refused".into())) }.boxed()
            },
            || async {}.boxed(),
        )
        .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
