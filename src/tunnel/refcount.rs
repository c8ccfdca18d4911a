//! Reference-counted lifecycle of the shared tunnel.
//!
//! The controller tracks how many consumers currently depend on the tunnel.
//! It opens the tunnel on the 0 -> 1 transition and closes it on 1 -> 0:
//!
//! ```text
//!            acquire (establish ok)             acquire
//!   Closed ---------------------------> Open ----------> Open (count + 1)
//!   count 0 <--------------------------  count 1   <----  count n > 1
//!            release (destroy)                   release
//! ```
//!
//! # Thread Safety
//!
//! The [`TunnelSession`] sits behind a `tokio::sync::Mutex` that is held for
//! the whole "read count, decide, establish/destroy, write count" sequence, so
//! concurrent acquires while Closed trigger a single establish: later callers
//! queue on the lock and find the count already raised. The count itself is
//! an atomic written only under that lock, which keeps
//! [`get_count`](TunnelRefCounter::get_count) a plain non-blocking read.
//!
//! A failed establish leaves the count at 0, so the next queued acquirer makes
//! its own attempt.
//!
//! Both paths stay consistent when their future is dropped: nothing is stored
//! until establish returns, and the last release zeroes the count and detaches
//! the handle before awaiting the close.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::error::TunnelError;
use super::key::resolve_private_key;
use super::session::{TunnelSession, Tunneler};
use super::types::{ConnectionParams, TunnelConfig, TunnelInfo};
use super::validate;

/// Counts the consumers of the shared tunnel and opens/closes it on 0 <-> 1.
pub struct TunnelRefCounter<T: Tunneler> {
    session: Mutex<TunnelSession<T>>,
    count: AtomicUsize,
}

impl<T: Tunneler> TunnelRefCounter<T> {
    pub fn new(tunneler: T) -> Self {
        Self::from_session(TunnelSession::new(tunneler))
    }

    /// Controller over a pre-configured session (e.g. with an establish timeout).
    pub fn from_session(session: TunnelSession<T>) -> Self {
        Self {
            session: Mutex::new(session),
            count: AtomicUsize::new(0),
        }
    }

    /// See [`validate::verify`].
    pub fn verify(config: &Value) -> bool {
        validate::verify(config)
    }

    /// Register a consumer, opening the tunnel if it is the first one.
    ///
    /// Fails with [`TunnelError::Configuration`] for a malformed config,
    /// [`TunnelError::KeyResolution`] if the key file cannot be read, or
    /// [`TunnelError::Establishment`] if the collaborator fails. The count is
    /// only incremented on success.
    pub async fn acquire(&self, config: &Value) -> Result<(), TunnelError> {
        let tunnel_config = validate::parse(config).map_err(|reason| {
            error!("{}", reason);
            TunnelError::Configuration(reason)
        })?;

        let mut session = self.session.lock().await;

        if self.count.load(Ordering::SeqCst) == 0 {
            let private_key = resolve_private_key(&tunnel_config.jmp.auth)?;
            let params = ConnectionParams::from_config(&tunnel_config, private_key);
            debug!(
                "establishing tunnel from {} to {} via {} for {}",
                params.local.host, params.remote.host, params.jump.host, params.local.port
            );
            session.establish(params).await?;
        } else if let Some(info) = session.info() {
            warn_on_mismatch(info, &tunnel_config);
        }

        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Tunnel acquired, {} active connection(s)", count);
        Ok(())
    }

    /// Unregister a consumer, closing the tunnel if it was the last one.
    ///
    /// Releasing at zero does nothing. Teardown errors are logged, never returned.
    pub async fn release(&self) {
        let mut session = self.session.lock().await;

        match self.count.load(Ordering::SeqCst) {
            0 => debug!("Tunnel release with no active connections ignored"),
            1 => {
                self.count.store(0, Ordering::SeqCst);
                debug!("Tunnel released, no active connections left");
                session.destroy().await;
            }
            n => {
                self.count.store(n - 1, Ordering::SeqCst);
                debug!("Tunnel released, {} active connection(s)", n - 1);
            }
        }
    }

    /// Number of consumers currently holding the tunnel.
    pub fn get_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Metadata of the live tunnel; `None` while Closed.
    ///
    /// Waits for any in-flight establish or teardown.
    pub async fn tunnel_info(&self) -> Option<TunnelInfo> {
        self.session.lock().await.info().cloned()
    }
}

// The tunnel is shared by every consumer; a different target is not reopened
fn warn_on_mismatch(info: &TunnelInfo, config: &TunnelConfig) {
    if info.local != config.src || info.remote != config.dst || info.jump != config.jmp.endpoint() {
        warn!(
            "Reusing tunnel {} ({} -> {} via {}) for a consumer configured with {} -> {} via {}",
            info.tunnel_id,
            info.local,
            info.remote,
            info.jump,
            config.src,
            config.dst,
            config.jmp.endpoint()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::session::TunnelHandle;
    use async_trait::async_trait;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Calls {
        establishes: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeHandle {
        calls: Arc<Calls>,
        close_delay: Duration,
    }

    #[async_trait]
    impl TunnelHandle for FakeHandle {
        async fn close(&mut self) -> Result<(), TunnelError> {
            tokio::time::sleep(self.close_delay).await;
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeTunneler {
        calls: Arc<Calls>,
        delay: Duration,
        close_delay: Duration,
        failures_left: AtomicUsize,
    }

    impl FakeTunneler {
        fn new(calls: Arc<Calls>) -> Self {
            Self {
                calls,
                delay: Duration::ZERO,
                close_delay: Duration::ZERO,
                failures_left: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn slow_close(mut self, delay: Duration) -> Self {
            self.close_delay = delay;
            self
        }

        fn failing(self, times: usize) -> Self {
            self.failures_left.store(times, Ordering::SeqCst);
            self
        }
    }

    #[async_trait]
    impl Tunneler for FakeTunneler {
        type Handle = FakeHandle;

        async fn establish(&self, _params: &ConnectionParams) -> Result<FakeHandle, TunnelError> {
            self.calls.establishes.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(TunnelError::Establishment("internal error".to_string()));
            }
            Ok(FakeHandle {
                calls: self.calls.clone(),
                close_delay: self.close_delay,
            })
        }

        fn name(&self) -> &'static str {
            "fake"
        }
    }

    fn valid_config() -> Value {
        json!({
            "tunnelConfig": {
                "src": { "host": "127.0.0.1", "port": 3307 },
                "dst": { "host": "db.internal", "port": 3306 },
                "jmp": {
                    "host": "bastion.example.com",
                    "port": 22,
                    "auth": { "user": "deploy", "keyStr": "  KEY  " }
                }
            }
        })
    }

    fn controller() -> (TunnelRefCounter<FakeTunneler>, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (TunnelRefCounter::new(FakeTunneler::new(calls.clone())), calls)
    }

    mod acquire {
        use super::*;

        #[tokio::test]
        async fn test_starts_closed() {
            let (controller, calls) = controller();
            assert_eq!(controller.get_count(), 0);
            assert!(controller.tunnel_info().await.is_none());
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_sequential_acquires_establish_once() {
            let (controller, calls) = controller();
            for _ in 0..3 {
                controller.acquire(&valid_config()).await.unwrap();
            }
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 1);
            assert_eq!(controller.get_count(), 3);
            assert!(controller.tunnel_info().await.is_some());
        }

        #[tokio::test]
        async fn test_concurrent_acquires_establish_once() {
            let calls = Arc::new(Calls::default());
            let controller = TunnelRefCounter::new(
                FakeTunneler::new(calls.clone()).slow(Duration::from_millis(30)),
            );
            let config = valid_config();

            let results = join_all((0..8).map(|_| controller.acquire(&config))).await;

            assert!(results.iter().all(Result::is_ok));
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 1);
            assert_eq!(controller.get_count(), 8);
        }

        #[tokio::test]
        async fn test_invalid_config_rejected_without_establish() {
            let (controller, calls) = controller();
            let err = controller
                .acquire(&json!({ "tunnelConfig": {} }))
                .await
                .unwrap_err();
            assert!(err.is_configuration());
            assert_eq!(controller.get_count(), 0);
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_invalid_config_rejected_while_open() {
            let (controller, _calls) = controller();
            controller.acquire(&valid_config()).await.unwrap();
            assert!(controller.acquire(&json!(null)).await.is_err());
            assert_eq!(controller.get_count(), 1);
        }

        #[tokio::test]
        async fn test_establish_failure_leaves_count() {
            let calls = Arc::new(Calls::default());
            let controller = TunnelRefCounter::new(FakeTunneler::new(calls.clone()).failing(1));

            let err = controller.acquire(&valid_config()).await.unwrap_err();
            assert_eq!(err.to_string(), "tunnel establishment failed: internal error");
            assert_eq!(controller.get_count(), 0);
            assert!(controller.tunnel_info().await.is_none());

            // The next acquire gets a fresh attempt
            controller.acquire(&valid_config()).await.unwrap();
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 2);
            assert_eq!(controller.get_count(), 1);
        }

        #[tokio::test]
        async fn test_concurrent_acquire_after_failed_establish() {
            let calls = Arc::new(Calls::default());
            let controller = TunnelRefCounter::new(
                FakeTunneler::new(calls.clone())
                    .slow(Duration::from_millis(10))
                    .failing(1),
            );
            let config = valid_config();

            let results = join_all((0..3).map(|_| controller.acquire(&config))).await;

            assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 2);
            assert_eq!(controller.get_count(), 2);
        }

        #[tokio::test]
        async fn test_unreadable_key_file_is_key_error() {
            let (controller, calls) = controller();
            let mut config = valid_config();
            config["tunnelConfig"]["jmp"]["auth"]["keyFile"] = json!("/definitely/not/here/id_rsa");

            let err = controller.acquire(&config).await.unwrap_err();
            assert!(matches!(err, TunnelError::KeyResolution { .. }));
            assert_eq!(controller.get_count(), 0);
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_establish_timeout_leaves_count() {
            let calls = Arc::new(Calls::default());
            let session =
                TunnelSession::new(FakeTunneler::new(calls).slow(Duration::from_secs(60)))
                    .with_establish_timeout(Some(Duration::from_millis(10)));
            let controller = TunnelRefCounter::from_session(session);

            let err = controller.acquire(&valid_config()).await.unwrap_err();
            assert!(err.is_establishment());
            assert_eq!(controller.get_count(), 0);
        }
    }

    mod release {
        use super::*;

        #[tokio::test]
        async fn test_release_above_one_keeps_tunnel() {
            let (controller, calls) = controller();
            controller.acquire(&valid_config()).await.unwrap();
            controller.acquire(&valid_config()).await.unwrap();

            controller.release().await;

            assert_eq!(controller.get_count(), 1);
            assert_eq!(calls.closes.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_last_release_destroys() {
            let (controller, calls) = controller();
            controller.acquire(&valid_config()).await.unwrap();

            controller.release().await;

            assert_eq!(controller.get_count(), 0);
            assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
            assert!(controller.tunnel_info().await.is_none());
        }

        #[tokio::test]
        async fn test_release_at_zero_is_noop() {
            let (controller, calls) = controller();
            controller.release().await;
            controller.release().await;
            assert_eq!(controller.get_count(), 0);
            assert_eq!(calls.closes.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_concurrent_releases_destroy_once() {
            let (controller, calls) = controller();
            for _ in 0..4 {
                controller.acquire(&valid_config()).await.unwrap();
            }

            join_all((0..6).map(|_| controller.release())).await;

            assert_eq!(controller.get_count(), 0);
            assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_reopens_after_full_release() {
            let (controller, calls) = controller();
            controller.acquire(&valid_config()).await.unwrap();
            controller.release().await;
            controller.acquire(&valid_config()).await.unwrap();

            assert_eq!(calls.establishes.load(Ordering::SeqCst), 2);
            assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
            assert_eq!(controller.get_count(), 1);
        }
    }

    mod cancellation {
        use super::*;

        #[tokio::test]
        async fn test_cancelled_release_closes_tunnel() {
            let calls = Arc::new(Calls::default());
            let controller = TunnelRefCounter::new(
                FakeTunneler::new(calls.clone()).slow_close(Duration::from_millis(200)),
            );
            controller.acquire(&valid_config()).await.unwrap();

            let timed_out =
                tokio::time::timeout(Duration::from_millis(10), controller.release()).await;
            assert!(timed_out.is_err());

            assert_eq!(controller.get_count(), 0);
            assert!(controller.tunnel_info().await.is_none());

            // The next acquire reopens instead of piggybacking on a dead tunnel
            controller.acquire(&valid_config()).await.unwrap();
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 2);
            assert_eq!(controller.get_count(), 1);
            assert!(controller.tunnel_info().await.is_some());

            tokio::time::sleep(Duration::from_millis(300)).await;
            assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_cancelled_acquire_leaves_tunnel_closed() {
            let calls = Arc::new(Calls::default());
            let controller = TunnelRefCounter::new(
                FakeTunneler::new(calls.clone()).slow(Duration::from_millis(200)),
            );

            let timed_out = tokio::time::timeout(
                Duration::from_millis(10),
                controller.acquire(&valid_config()),
            )
            .await;
            assert!(timed_out.is_err());

            assert_eq!(controller.get_count(), 0);
            assert!(controller.tunnel_info().await.is_none());
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn test_cancelled_waiter_does_not_disturb_first_acquirer() {
            let calls = Arc::new(Calls::default());
            let controller = TunnelRefCounter::new(
                FakeTunneler::new(calls.clone()).slow(Duration::from_millis(50)),
            );
            let config = valid_config();

            let (first, second) = tokio::join!(
                controller.acquire(&config),
                tokio::time::timeout(Duration::from_millis(10), controller.acquire(&config)),
            );

            assert!(first.is_ok());
            assert!(second.is_err());
            assert_eq!(controller.get_count(), 1);
            assert_eq!(calls.establishes.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_verify_delegates_to_validator() {
        assert!(TunnelRefCounter::<FakeTunneler>::verify(&valid_config()));
        assert!(!TunnelRefCounter::<FakeTunneler>::verify(&json!({})));
    }
}
