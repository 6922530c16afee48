use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::sync::watch;

use crate::fortunnels::config::RuntimeSettings;
use crate::fortunnels::dataplane::transport::{DialOptions, Transport, TransportSession};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Terminal: the manager was closed; no further sessions will be made.
    #[error("stopped")]
    Stopped,
}

/// Reconnectable session manager: guarantees there is a live data-plane
/// session and re-dials with exponential backoff on failures.
///
/// At most one session is alive at a time. All session-slot access happens
/// under one lock; `close` is observed between backoff sleeps, so `ensure`
/// returns the terminal error within one backoff interval of a close.
pub struct Manager {
    transport: Arc<dyn Transport>,
    server_url: String,
    opts: DialOptions,
    bo_init: Duration,
    bo_max: Duration,
    stop: watch::Sender<bool>,
    state: tokio::sync::Mutex<Option<Arc<dyn TransportSession>>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager").finish_non_exhaustive()
    }
}

impl Manager {
    pub fn new(
        transport: Arc<dyn Transport>,
        server_url: &str,
        tunnel_id: &str,
        bo_init: Duration,
        bo_max: Duration,
        settings: RuntimeSettings,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            transport,
            server_url: server_url.to_string(),
            opts: DialOptions {
                tunnel_id: tunnel_id.to_string(),
                settings,
            },
            bo_init,
            bo_max,
            stop,
            state: tokio::sync::Mutex::new(None),
        }
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Return the current session if alive, otherwise dial until one comes
    /// up, sleeping the doubling backoff between failures. Callers may block
    /// here; a concurrent `close` turns the next check into `Stopped`.
    pub async fn ensure(&self) -> Result<Arc<dyn TransportSession>, SessionError> {
        if self.stopped() {
            return Err(SessionError::Stopped);
        }
        let mut state = self.state.lock().await;
        if self.stopped() {
            return Err(SessionError::Stopped);
        }
        if let Some(sess) = state.as_ref() {
            if !sess.is_closed() {
                return Ok(sess.clone());
            }
        }

        let mut stop_rx = self.stop.subscribe();
        let mut backoff = self.bo_init;
        loop {
            if self.stopped() {
                return Err(SessionError::Stopped);
            }
            match self.transport.dial(&self.server_url, &self.opts).await {
                Ok(sess) => {
                    tracing::info!(
                        transport = %self.transport.name(),
                        server = %self.server_url,
                        "session: connected"
                    );
                    *state = Some(sess.clone());
                    return Ok(sess);
                }
                Err(err) => {
                    tracing::warn!(
                        transport = %self.transport.name(),
                        server = %self.server_url,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "session: dial failed; retrying"
                    );
                }
            }

            tokio::select! {
                _ = stop_rx.changed() => {
                    if self.stopped() {
                        return Err(SessionError::Stopped);
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = next_backoff(backoff, self.bo_max);
        }
    }

    /// Idempotent. Marks the manager stopped and terminates the current
    /// session if any; every later `ensure` returns `Stopped`.
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        let mut state = self.state.lock().await;
        if let Some(sess) = state.take() {
            sess.close().await;
        }
    }
}

pub fn next_backoff(current: Duration, limit: Duration) -> Duration {
    (current * 2).min(limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::fortunnels::dataplane::transport::BoxedStream;

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            mux_keepalive_interval: Duration::from_secs(25),
            mux_keepalive_timeout: Duration::from_secs(60),
            watch_interval: Duration::from_secs(10),
        }
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let max = Duration::from_secs(10);
        let mut b = Duration::from_secs(1);
        let mut seen = Vec::new();
        for _ in 0..6 {
            b = next_backoff(b, max);
            seen.push(b.as_secs());
        }
        assert_eq!(seen, [2, 4, 8, 10, 10, 10]);
    }

    struct NeverDials {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for NeverDials {
        fn name(&self) -> &'static str {
            "test"
        }
        async fn dial(
            &self,
            _server_url: &str,
            _opts: &DialOptions,
        ) -> anyhow::Result<Arc<dyn TransportSession>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("nope")
        }
    }

    struct FakeSession {
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl TransportSession for FakeSession {
        async fn open_stream(&self) -> anyhow::Result<BoxedStream> {
            anyhow::bail!("not implemented")
        }
        async fn accept_stream(&self) -> anyhow::Result<BoxedStream> {
            anyhow::bail!("not implemented")
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Dials fail `fail_first` times, then succeed.
    struct FlakyTransport {
        attempts: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        fn name(&self) -> &'static str {
            "test"
        }
        async fn dial(
            &self,
            _server_url: &str,
            _opts: &DialOptions,
        ) -> anyhow::Result<Arc<dyn TransportSession>> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient");
            }
            Ok(Arc::new(FakeSession {
                closed: std::sync::atomic::AtomicBool::new(false),
            }))
        }
    }

    fn manager(transport: Arc<dyn Transport>) -> Manager {
        Manager::new(
            transport,
            "http://127.0.0.1:1",
            "tun-1",
            Duration::from_millis(20),
            Duration::from_millis(80),
            settings(),
        )
    }

    #[tokio::test]
    async fn ensure_after_close_is_terminal() {
        let mgr = manager(Arc::new(NeverDials {
            attempts: AtomicUsize::new(0),
        }));
        mgr.close().await;
        assert!(matches!(mgr.ensure().await, Err(SessionError::Stopped)));
        // Idempotent.
        mgr.close().await;
        assert!(matches!(mgr.ensure().await, Err(SessionError::Stopped)));
    }

    #[tokio::test]
    async fn close_during_backoff_unblocks_ensure() {
        let transport = Arc::new(NeverDials {
            attempts: AtomicUsize::new(0),
        });
        let mgr = Arc::new(manager(transport.clone()));

        let m = mgr.clone();
        let task = tokio::spawn(async move { m.ensure().await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.close().await;

        let res = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("ensure must unblock after close")
            .unwrap();
        assert!(matches!(res, Err(SessionError::Stopped)));
        // No dials may happen after close.
        let dialed = transport.attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.attempts.load(Ordering::SeqCst), dialed);
    }

    #[tokio::test]
    async fn ensure_retries_until_dial_succeeds() {
        let transport = Arc::new(FlakyTransport {
            attempts: AtomicUsize::new(0),
            fail_first: 2,
        });
        let mgr = manager(transport.clone());

        let sess = mgr.ensure().await.unwrap();
        assert!(!sess.is_closed());
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);

        // Alive session is reused without another dial.
        let again = mgr.ensure().await.unwrap();
        assert!(Arc::ptr_eq(&sess, &again));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dead_session_triggers_redial() {
        let transport = Arc::new(FlakyTransport {
            attempts: AtomicUsize::new(0),
            fail_first: 0,
        });
        let mgr = manager(transport.clone());

        let sess = mgr.ensure().await.unwrap();
        sess.close().await;
        let fresh = mgr.ensure().await.unwrap();
        assert!(!Arc::ptr_eq(&sess, &fresh));
        assert_eq!(transport.attempts.load(Ordering::SeqCst), 2);
    }
}
