//! Orchestrated shutdown.
//!
//! On a termination request the orchestrator:
//!
//! 1. cancels the shared lifetime token, which ends the poller's loop and any
//!    other lifetime-scoped task;
//! 2. drains every registered endpoint concurrently, each bounded by the drain
//!    timeout;
//! 3. waits for all drains, whatever their outcome;
//! 4. goes `Offline` and only then stops the attached [`Poller`].
//!
//! ```text
//!   Active ──signal──▶ Draining ──all drains done──▶ Offline ──▶ poller.stop()
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::DrainError;
use crate::poller::Poller;

/// Default time an endpoint gets to finish in-flight requests.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Extra time granted on top of the drain timeout before the orchestrator
/// gives up on an endpoint that does not honour its deadline.
const DRAIN_SLACK: Duration = Duration::from_secs(1);

/// Phase of the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownPhase {
    /// Serving normally.
    Active,
    /// Lifetime cancelled, endpoints draining.
    Draining,
    /// All endpoints drained or timed out.
    Offline,
}

/// A serving endpoint that can be shut down gracefully.
#[async_trait]
pub trait Drain: Send + Sync {
    /// Name used in log messages, e.g. the listen address.
    fn name(&self) -> String;

    /// Stop accepting new work, let in-flight work finish, and force-close
    /// whatever is left once `timeout` has elapsed.
    async fn drain(&self, timeout: Duration) -> Result<(), DrainError>;
}

impl std::fmt::Debug for dyn Drain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Drain").field(&self.name()).finish()
    }
}

/// Drives the shutdown sequence described in the [module docs](self).
///
/// # Example
///
/// ```rust,no_run
/// use dhtwatch_sdk::{termination_signal, Poller, ShutdownOrchestrator, SimulatedSampler};
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let lifetime = CancellationToken::new();
///     let poller = Poller::builder(SimulatedSampler::new())
///         .lifetime(lifetime.clone())
///         .build();
///     poller.start();
///
///     let orchestrator = ShutdownOrchestrator::builder(lifetime)
///         .poller(poller)
///         .build();
///
///     // Returns once everything is drained and the poller has stopped
///     orchestrator.run_until(termination_signal()).await;
/// }
/// ```
#[derive(Debug)]
pub struct ShutdownOrchestrator {
    lifetime: CancellationToken,
    drain_timeout: Duration,
    endpoints: Vec<Arc<dyn Drain>>,
    poller: Option<Poller>,
    phase: watch::Sender<ShutdownPhase>,
    finished: CancellationToken,
}

/// Hands the sequence back to the next caller if the running one is dropped.
struct SequenceGuard<'a> {
    phase: &'a watch::Sender<ShutdownPhase>,
    armed: bool,
}

impl Drop for SequenceGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("shutdown sequence abandoned before completion");
            self.phase.send_replace(ShutdownPhase::Active);
        }
    }
}

impl ShutdownOrchestrator {
    /// Create an orchestrator with the default drain timeout and nothing
    /// registered.
    pub fn new(lifetime: CancellationToken) -> Self {
        Self::builder(lifetime).build()
    }

    /// Create a builder for configuring the orchestrator.
    pub fn builder(lifetime: CancellationToken) -> ShutdownOrchestratorBuilder {
        ShutdownOrchestratorBuilder::new(lifetime)
    }

    /// Register an endpoint to drain on shutdown.
    pub fn register(&mut self, endpoint: impl Drain + 'static) {
        self.endpoints.push(Arc::new(endpoint));
    }

    /// Attach the poller to stop once the orchestrator is offline.
    pub fn attach_poller(&mut self, poller: Poller) {
        self.poller = Some(poller);
    }

    /// Current phase.
    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Watch phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Wait for `trigger`, then run the shutdown sequence.
    pub async fn run_until<F>(&self, trigger: F)
    where
        F: Future<Output = ()>,
    {
        trigger.await;
        self.shutdown().await;
    }

    /// Run the shutdown sequence.
    ///
    /// Only the first call does the work; later or concurrent calls wait until
    /// the whole sequence, including stopping the poller, has finished. If the
    /// call running the sequence is dropped part way, the orchestrator goes
    /// back to `Active` and a waiting or later call runs it again.
    pub async fn shutdown(&self) {
        loop {
            let first = self.phase.send_if_modified(|phase| {
                if *phase == ShutdownPhase::Active {
                    *phase = ShutdownPhase::Draining;
                    true
                } else {
                    false
                }
            });
            if first {
                break;
            }

            let mut phase = self.phase.subscribe();
            tokio::select! {
                _ = self.finished.cancelled() => return,
                _ = phase.wait_for(|p| *p == ShutdownPhase::Active) => {}
            }
        }

        let mut guard = SequenceGuard {
            phase: &self.phase,
            armed: true,
        };

        info!("shutdown signal received");
        self.lifetime.cancel();

        self.drain_all().await;

        self.phase.send_replace(ShutdownPhase::Offline);
        info!("sensor data server offline");

        if let Some(poller) = &self.poller {
            poller.stop().await;
            info!("sensor data server stopped sensing");
        }

        guard.armed = false;
        self.finished.cancel();
    }

    async fn drain_all(&self) {
        let mut drains = JoinSet::new();
        let timeout = self.drain_timeout;

        for endpoint in &self.endpoints {
            let endpoint = endpoint.clone();
            drains.spawn(async move {
                let name = endpoint.name();
                let result =
                    match tokio::time::timeout(timeout + DRAIN_SLACK, endpoint.drain(timeout))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(DrainError::Timeout(timeout)),
                    };
                (name, result)
            });
        }

        while let Some(joined) = drains.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(endpoint = %name, "endpoint drained"),
                Ok((name, Err(e))) => {
                    warn!(endpoint = %name, error = %e, "error while shutting down endpoint")
                }
                Err(e) => warn!(error = %e, "drain task failed"),
            }
        }
    }
}

/// Builder for configuring a ShutdownOrchestrator.
#[derive(Debug)]
pub struct ShutdownOrchestratorBuilder {
    lifetime: CancellationToken,
    drain_timeout: Option<Duration>,
    endpoints: Vec<Arc<dyn Drain>>,
    poller: Option<Poller>,
}

impl ShutdownOrchestratorBuilder {
    /// Create a new builder.
    pub fn new(lifetime: CancellationToken) -> Self {
        Self {
            lifetime,
            drain_timeout: None,
            endpoints: Vec::new(),
            poller: None,
        }
    }

    /// Set the per-endpoint drain timeout.
    ///
    /// Defaults to 15 seconds if not specified.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = Some(timeout);
        self
    }

    /// Add an endpoint to drain on shutdown.
    pub fn endpoint(mut self, endpoint: impl Drain + 'static) -> Self {
        self.endpoints.push(Arc::new(endpoint));
        self
    }

    /// Set the poller to stop once offline.
    pub fn poller(mut self, poller: Poller) -> Self {
        self.poller = Some(poller);
        self
    }

    /// Build the orchestrator.
    pub fn build(self) -> ShutdownOrchestrator {
        let (phase, _) = watch::channel(ShutdownPhase::Active);
        ShutdownOrchestrator {
            lifetime: self.lifetime,
            drain_timeout: self.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT),
            endpoints: self.endpoints,
            poller: self.poller,
            phase,
            finished: CancellationToken::new(),
        }
    }
}

/// Completes when the process receives SIGINT (interactive interrupt) or
/// SIGTERM (supervisor termination).
///
/// If a handler cannot be installed it is logged and that signal is ignored.
pub async fn termination_signal() {
    let interrupt = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT"),
            Err(e) => {
                warn!(error = %e, "failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dhtwatch_types::Snapshot;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use crate::error::SampleError;
    use crate::poller::PollerState;
    use crate::sampler::Sampler;

    type Events = Arc<Mutex<Vec<String>>>;

    /// Endpoint that takes `delay` to drain and records what it saw.
    struct RecordingEndpoint {
        name: &'static str,
        delay: Duration,
        events: Events,
        lifetime: CancellationToken,
        drains: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Drain for RecordingEndpoint {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn drain(&self, _timeout: Duration) -> Result<(), DrainError> {
            self.drains.fetch_add(1, Ordering::SeqCst);
            self.events.lock().push(format!(
                "{} drain start (lifetime cancelled: {})",
                self.name,
                self.lifetime.is_cancelled()
            ));
            tokio::time::sleep(self.delay).await;
            self.events.lock().push(format!("{} drain end", self.name));
            Ok(())
        }
    }

    /// Endpoint that ignores its deadline.
    struct StuckEndpoint;

    #[async_trait]
    impl Drain for StuckEndpoint {
        fn name(&self) -> String {
            "stuck".to_string()
        }

        async fn drain(&self, _timeout: Duration) -> Result<(), DrainError> {
            std::future::pending().await
        }
    }

    /// Endpoint that reports a drain failure.
    struct FailingEndpoint;

    #[async_trait]
    impl Drain for FailingEndpoint {
        fn name(&self) -> String {
            "failing".to_string()
        }

        async fn drain(&self, timeout: Duration) -> Result<(), DrainError> {
            Err(DrainError::Timeout(timeout))
        }
    }

    /// Sampler whose single sample takes `latency` and is recorded when done.
    #[derive(Debug)]
    struct SlowSampler {
        latency: Duration,
        events: Events,
    }

    #[async_trait]
    impl Sampler for SlowSampler {
        async fn sample(&self) -> Result<Snapshot, SampleError> {
            tokio::time::sleep(self.latency).await;
            self.events.lock().push("sample done".to_string());
            Ok(Snapshot::builder().temperature(21.5).humidity(40.0).build())
        }
    }

    fn recording(
        name: &'static str,
        delay: Duration,
        events: &Events,
        lifetime: &CancellationToken,
    ) -> (RecordingEndpoint, Arc<AtomicUsize>) {
        let drains = Arc::new(AtomicUsize::new(0));
        let endpoint = RecordingEndpoint {
            name,
            delay,
            events: events.clone(),
            lifetime: lifetime.clone(),
            drains: drains.clone(),
        };
        (endpoint, drains)
    }

    #[test]
    fn builder_defaults() {
        let orchestrator = ShutdownOrchestrator::new(CancellationToken::new());
        assert_eq!(orchestrator.drain_timeout, DEFAULT_DRAIN_TIMEOUT);
        assert!(orchestrator.endpoints.is_empty());
        assert!(orchestrator.poller.is_none());
        assert_eq!(orchestrator.phase(), ShutdownPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_endpoints_goes_offline() {
        let lifetime = CancellationToken::new();
        let orchestrator = ShutdownOrchestrator::new(lifetime.clone());

        orchestrator.shutdown().await;

        assert!(lifetime.is_cancelled());
        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_is_stopped_only_after_drains_complete() {
        let lifetime = CancellationToken::new();
        let events: Events = Arc::default();

        let poller = Poller::builder(SlowSampler {
            latency: Duration::from_secs(5),
            events: events.clone(),
        })
        .interval(Duration::from_secs(60))
        .lifetime(lifetime.clone())
        .build();
        poller.start();

        let (endpoint, _) = recording("http", Duration::from_secs(1), &events, &lifetime);
        let orchestrator = ShutdownOrchestrator::builder(lifetime.clone())
            .endpoint(endpoint)
            .poller(poller.clone())
            .build();

        let mut phase = orchestrator.subscribe();
        let offline_events = events.clone();
        let watcher = tokio::spawn(async move {
            let _ = phase.wait_for(|p| *p == ShutdownPhase::Offline).await;
            offline_events.lock().push("offline".to_string());
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.shutdown().await;
        watcher.await.unwrap();

        assert_eq!(
            *events.lock(),
            vec![
                "http drain start (lifetime cancelled: true)".to_string(),
                "http drain end".to_string(),
                "offline".to_string(),
                "sample done".to_string(),
            ]
        );
        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
        assert_eq!(poller.state(), PollerState::Idle);
        assert!(poller.latest().valid);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoints_drain_concurrently() {
        let lifetime = CancellationToken::new();
        let events: Events = Arc::default();
        let (a, _) = recording("a", Duration::from_secs(3), &events, &lifetime);
        let (b, _) = recording("b", Duration::from_secs(3), &events, &lifetime);

        let orchestrator = ShutdownOrchestrator::builder(lifetime)
            .endpoint(a)
            .endpoint(b)
            .build();

        let started = tokio::time::Instant::now();
        orchestrator.shutdown().await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(events.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn stuck_endpoint_does_not_block_shutdown() {
        let lifetime = CancellationToken::new();
        let orchestrator = ShutdownOrchestrator::builder(lifetime)
            .drain_timeout(Duration::from_secs(2))
            .endpoint(StuckEndpoint)
            .build();

        let started = tokio::time::Instant::now();
        orchestrator.shutdown().await;

        assert!(started.elapsed() <= Duration::from_secs(2) + DRAIN_SLACK);
        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
        assert!(logs_contain("error while shutting down endpoint"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn drain_failure_is_logged_and_shutdown_proceeds() {
        let lifetime = CancellationToken::new();
        let events: Events = Arc::default();
        let (ok, _) = recording("ok", Duration::from_millis(10), &events, &lifetime);

        let mut orchestrator = ShutdownOrchestrator::new(lifetime);
        orchestrator.register(FailingEndpoint);
        orchestrator.register(ok);

        orchestrator.shutdown().await;

        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
        assert_eq!(events.lock().len(), 2);
        assert!(logs_contain("failing"));
        assert!(logs_contain("drain did not complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_idempotent() {
        let lifetime = CancellationToken::new();
        let events: Events = Arc::default();
        let (endpoint, drains) = recording("http", Duration::from_secs(1), &events, &lifetime);

        let orchestrator = ShutdownOrchestrator::builder(lifetime)
            .endpoint(endpoint)
            .build();

        tokio::join!(orchestrator.shutdown(), orchestrator.shutdown());
        orchestrator.shutdown().await;

        assert_eq!(drains.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_caller_waits_for_poller_stop() {
        let lifetime = CancellationToken::new();
        let events: Events = Arc::default();

        let poller = Poller::builder(SlowSampler {
            latency: Duration::from_secs(5),
            events: events.clone(),
        })
        .interval(Duration::from_secs(60))
        .lifetime(lifetime.clone())
        .build();
        poller.start();

        let orchestrator = Arc::new(
            ShutdownOrchestrator::builder(lifetime)
                .poller(poller.clone())
                .build(),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        orchestrator.shutdown().await;

        assert_eq!(poller.state(), PollerState::Idle);
        assert_eq!(*events.lock(), vec!["sample done".to_string()]);
        first.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn abandoned_sequence_is_taken_over_by_waiting_caller() {
        let lifetime = CancellationToken::new();
        let orchestrator = Arc::new(
            ShutdownOrchestrator::builder(lifetime)
                .drain_timeout(Duration::from_secs(2))
                .endpoint(StuckEndpoint)
                .build(),
        );

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.phase(), ShutdownPhase::Draining);

        let waiting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        waiting.await.unwrap();
        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
        assert!(logs_contain("shutdown sequence abandoned"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_until_waits_for_trigger() {
        let lifetime = CancellationToken::new();
        let orchestrator = Arc::new(ShutdownOrchestrator::new(lifetime.clone()));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let running = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .run_until(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(orchestrator.phase(), ShutdownPhase::Active);
        assert!(!lifetime.is_cancelled());

        tx.send(()).unwrap();
        running.await.unwrap();

        assert_eq!(orchestrator.phase(), ShutdownPhase::Offline);
        assert!(lifetime.is_cancelled());
    }
}
