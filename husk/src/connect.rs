//! Waiting for a freshly booted VM to accept transport connections.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::transport::{Credentials, Dialer};
use crate::{Error, Result};

/// Bound on one dial plus handshake.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between failed attempts.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retries a [`Dialer`] until it succeeds or the caller gives up.
///
/// Attempts are unlimited by default; only cancellation (or the optional
/// overall deadline) ends the wait.
#[derive(Debug, Clone)]
pub struct ConnectionWaiter<D> {
    /// Transport used for each attempt.
    dialer: D,
    /// Bound on each attempt.
    attempt_timeout: Duration,
    /// Fixed pause between attempts.
    retry_delay: Duration,
    /// Optional bound on the whole wait.
    overall: Option<Duration>,
}

impl<D: Dialer> ConnectionWaiter<D> {
    /// Creates a waiter with 1 s attempts, 1 s delay and no overall bound.
    pub const fn new(dialer: D) -> Self {
        Self {
            dialer,
            attempt_timeout: ATTEMPT_TIMEOUT,
            retry_delay: RETRY_DELAY,
            overall: None,
        }
    }

    /// Sets the per-attempt bound.
    #[must_use]
    pub const fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Sets the pause between attempts.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Bounds the whole wait. When it elapses the last failure is returned.
    #[must_use]
    pub const fn overall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.overall = timeout;
        self
    }

    /// Returns the underlying dialer.
    pub const fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Dials `addr` until a connection is established.
    ///
    /// Returns [`Error::Cancelled`] once `cancel` fires, within one retry
    /// delay, and [`Error::ConnectionUnavailable`] if the overall bound
    /// elapses first.
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        addr: SocketAddr,
        creds: &Credentials,
    ) -> Result<D::Connection> {
        let deadline = self.overall.map(|d| Instant::now() + d);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt = tokio::time::timeout(
                self.attempt_timeout,
                self.dialer.dial(addr, creds, self.attempt_timeout),
            );
            let err = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                res = attempt => match res {
                    Ok(Ok(conn)) => {
                        tracing::info!(%addr, attempts, "transport connected");
                        return Ok(conn);
                    }
                    Ok(Err(e)) => e,
                    Err(_) => io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection attempt timed out",
                    ),
                },
            };
            tracing::debug!(%addr, attempt = attempts, error = %err, "connection attempt failed");

            if deadline.is_some_and(|d| Instant::now() + self.retry_delay >= d) {
                return Err(Error::ConnectionUnavailable {
                    addr,
                    attempts,
                    source: err,
                });
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeDialer;

    fn addr() -> SocketAddr {
        "192.168.64.7:22".parse().unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("admin", "admin")
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let waiter = ConnectionWaiter::new(FakeDialer::failing(3));
        let started = Instant::now();
        waiter
            .connect(&CancellationToken::new(), addr(), &creds())
            .await
            .unwrap();
        assert_eq!(waiter.dialer().attempts(), 4);
        assert_eq!(started.elapsed(), RETRY_DELAY * 3);
        assert_eq!(waiter.dialer().log(), ["dial admin@192.168.64.7:22"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_within_one_delay() {
        let waiter = ConnectionWaiter::new(FakeDialer::failing(u32::MAX));
        let cancel = CancellationToken::new();
        let trigger = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(4500)).await;
                cancel.cancel();
            })
        };
        let started = Instant::now();
        let err = waiter.connect(&cancel, addr(), &creds()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err:?}");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4500));
        assert!(elapsed <= Duration::from_millis(4500) + RETRY_DELAY);
        trigger.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn overall_bound_reports_last_error() {
        let waiter = ConnectionWaiter::new(FakeDialer::failing(u32::MAX))
            .overall_timeout(Some(Duration::from_secs(3)));
        let err = waiter
            .connect(&CancellationToken::new(), addr(), &creds())
            .await
            .unwrap_err();
        match err {
            Error::ConnectionUnavailable {
                addr: a,
                attempts,
                source,
            } => {
                assert_eq!(a, addr());
                assert_eq!(attempts, 3);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("expected ConnectionUnavailable, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_makes_no_progress() {
        let waiter = ConnectionWaiter::new(FakeDialer::failing(u32::MAX));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = waiter.connect(&cancel, addr(), &creds()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
