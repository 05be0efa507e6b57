use super::transport::Transport;
use crate::error::ConnectError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Floor applied to every retry pause.
pub const MIN_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Everything needed to open one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub user: String,
    pub password: String,
    /// Consumer dispatch concurrency; 0 selects the transport default.
    pub concurrency: usize,
}

/// Opens raw broker sessions.
pub trait Opener: Send + Sync {
    fn open<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Transport>, ConnectError>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts; zero or negative retries forever.
    pub max_retries: i32,
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: i32, pause: Duration) -> Self {
        Self { max_retries, pause }
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_retries <= 0
    }

    pub fn effective_pause(&self) -> Duration {
        self.pause.max(MIN_RETRY_PAUSE)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// Opener wrapper with bounded (or unbounded) retry behavior.
pub struct RetryingOpener<O> {
    inner: O,
    policy: RetryPolicy,
    shutdown: CancellationToken,
}

impl<O: Opener> RetryingOpener<O> {
    pub fn new(inner: O, policy: RetryPolicy, shutdown: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            shutdown,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

impl<O: Opener> Opener for RetryingOpener<O> {
    fn open<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Transport>, ConnectError>> + Send + 'a>> {
        Box::pin(async move {
            let pause = self.policy.effective_pause();
            let mut attempt: u32 = 0;

            loop {
                attempt = attempt.saturating_add(1);
                let err = match self.inner.open(params).await {
                    Ok(transport) => {
                        if attempt > 1 {
                            tracing::info!(host = params.host.as_str(), attempt, "Broker connection recovered after retries");
                        }
                        return Ok(transport);
                    }
                    Err(err) => err,
                };

                let exhausted = !self.policy.is_unlimited()
                    && i64::from(attempt) >= i64::from(self.policy.max_retries);
                if exhausted {
                    tracing::error!(
                        host = params.host.as_str(),
                        attempts = attempt,
                        "Broker connection failed, giving up: {err}"
                    );
                    return Err(ConnectError::RetriesExhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }

                tracing::warn!(
                    host = params.host.as_str(),
                    attempt,
                    max_retries = self.policy.max_retries,
                    pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX),
                    "Broker connection failed, retrying: {err}"
                );

                tokio::select! {
                    () = self.shutdown.cancelled() => {
                        tracing::info!(host = params.host.as_str(), "Connection retry interrupted by shutdown");
                        return Err(ConnectError::Interrupted);
                    }
                    () = tokio::time::sleep(pause) => {}
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Owns the single broker session of a broker process.
///
/// Constructed by the composition root and shared by reference with every
/// sender and consumer.
pub struct ConnectionManager {
    opener: Arc<dyn Opener>,
    params: ConnectParams,
    session: RwLock<Option<Arc<dyn Transport>>>,
}

impl ConnectionManager {
    pub fn new(opener: Arc<dyn Opener>, params: ConnectParams) -> Self {
        Self {
            opener,
            params,
            session: RwLock::new(None),
        }
    }

    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    /// Opens the session unless one is already open.
    ///
    /// Returns `Closed` without error when the attempt was interrupted by a
    /// shutdown request.
    pub async fn open(&self) -> Result<ConnectionState, ConnectError> {
        if self.state() == ConnectionState::Open {
            return Ok(ConnectionState::Open);
        }

        match self.opener.open(&self.params).await {
            Ok(transport) => {
                tracing::info!(
                    host = self.params.host.as_str(),
                    transport = transport.name(),
                    "Broker connection open"
                );
                *self.write_session() = Some(transport);
                Ok(ConnectionState::Open)
            }
            Err(ConnectError::Interrupted) => Ok(ConnectionState::Closed),
            Err(err) => Err(err),
        }
    }

    /// Closes the session. Calling this on a closed manager is a no-op.
    pub async fn close(&self) {
        let Some(transport) = self.write_session().take() else {
            return;
        };
        if let Err(e) = transport.close().await {
            tracing::warn!(host = self.params.host.as_str(), "Broker close failed: {e}");
        } else {
            tracing::info!(host = self.params.host.as_str(), "Broker connection closed");
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.transport().is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The open session, if any. A session that reports a fatal I/O error
    /// is dropped here and the manager transitions to `Closed`.
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        let current = self
            .session
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()?;
        if current.is_open() {
            return Some(current);
        }

        let mut session = self.write_session();
        if session
            .as_ref()
            .is_some_and(|held| Arc::ptr_eq(held, &current))
        {
            tracing::warn!(host = self.params.host.as_str(), "Broker session lost");
            *session = None;
        }
        None
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<dyn Transport>>> {
        self.session
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{InMemoryBroker, InMemoryOpener};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    struct FlakyOpener {
        broker: InMemoryBroker,
        failures_before_success: u32,
        calls: Arc<AtomicU32>,
        attempt_times: Arc<std::sync::Mutex<Vec<Instant>>>,
    }

    impl FlakyOpener {
        fn new(failures_before_success: u32) -> Self {
            Self {
                broker: InMemoryBroker::new(),
                failures_before_success,
                calls: Arc::new(AtomicU32::new(0)),
                attempt_times: Arc::new(std::sync::Mutex::new(Vec::new())),
            }
        }
    }

    impl Opener for FlakyOpener {
        fn open<'a>(
            &'a self,
            params: &'a ConnectParams,
        ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn Transport>, ConnectError>> + Send + 'a>>
        {
            Box::pin(async move {
                self.attempt_times.lock().unwrap().push(Instant::now());
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.failures_before_success {
                    return Err(ConnectError::Failed {
                        host: params.host.clone(),
                        message: "connection refused".into(),
                    });
                }
                InMemoryOpener::new(self.broker.clone()).open(params).await
            })
        }
    }

    fn params() -> ConnectParams {
        ConnectParams {
            host: "localhost".into(),
            user: "guest".into(),
            password: "guest".into(),
            concurrency: 0,
        }
    }

    #[test]
    fn pause_has_floor() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        assert_eq!(policy.effective_pause(), MIN_RETRY_PAUSE);
        let policy = RetryPolicy::new(3, Duration::from_millis(750));
        assert_eq!(policy.effective_pause(), Duration::from_millis(750));
    }

    #[test]
    fn non_positive_retries_are_unlimited() {
        assert!(RetryPolicy::new(0, Duration::ZERO).is_unlimited());
        assert!(RetryPolicy::new(-1, Duration::ZERO).is_unlimited());
        assert!(!RetryPolicy::new(1, Duration::ZERO).is_unlimited());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_at_least_the_floor() {
        let opener = FlakyOpener::new(2);
        let times = Arc::clone(&opener.attempt_times);
        let retrying = RetryingOpener::new(
            opener,
            RetryPolicy::new(5, Duration::from_millis(10)),
            CancellationToken::new(),
        );

        assert!(retrying.open(&params()).await.is_ok());

        let times = times.lock().unwrap();
        assert_eq!(times.len(), 3);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= MIN_RETRY_PAUSE);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_is_fatal() {
        let opener = FlakyOpener::new(u32::MAX);
        let calls = Arc::clone(&opener.calls);
        let retrying = RetryingOpener::new(
            opener,
            RetryPolicy::new(3, Duration::from_millis(100)),
            CancellationToken::new(),
        );

        let err = retrying.open(&params()).await.err().unwrap();
        assert!(matches!(err, ConnectError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_retries_keep_going_until_success() {
        let opener = FlakyOpener::new(20);
        let calls = Arc::clone(&opener.calls);
        let retrying = RetryingOpener::new(
            opener,
            RetryPolicy::new(0, Duration::from_millis(100)),
            CancellationToken::new(),
        );

        assert!(retrying.open(&params()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 21);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_retry_without_error() {
        let token = CancellationToken::new();
        let retrying = RetryingOpener::new(
            FlakyOpener::new(u32::MAX),
            RetryPolicy::new(0, Duration::from_secs(60)),
            token.clone(),
        );
        let manager = ConnectionManager::new(Arc::new(retrying), params());

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let state = manager.open().await.unwrap();
        assert_eq!(state, ConnectionState::Closed);
        assert!(!manager.is_open());
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = InMemoryBroker::new();
        let manager = ConnectionManager::new(Arc::new(InMemoryOpener::new(broker)), params());

        assert_eq!(manager.open().await.unwrap(), ConnectionState::Open);
        assert!(manager.is_open());
        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn lost_session_transitions_to_closed() {
        let broker = InMemoryBroker::new();
        let manager =
            ConnectionManager::new(Arc::new(InMemoryOpener::new(broker.clone())), params());
        manager.open().await.unwrap();

        broker.sever_sessions();
        assert!(manager.transport().is_none());
        assert_eq!(manager.state(), ConnectionState::Closed);

        assert_eq!(manager.open().await.unwrap(), ConnectionState::Open);
    }
}
