//! The sampling poller and its latest-value cache.

use std::sync::Arc;
use std::time::Duration;

use dhtwatch_types::Snapshot;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sampler::Sampler;

/// Read side of the latest-value cache, as consumed by the serving layer.
pub trait SnapshotSource: Send + Sync + 'static {
    /// The most recently published snapshot. Must not block on sampling.
    fn latest(&self) -> Snapshot;
}

/// Lifecycle state of a [`Poller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollerState {
    /// No sampling loop is running. Initial and terminal state.
    Idle,
    /// A sampling loop is active.
    Running,
}

/// Default time between the end of one sample and the start of the next.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically samples a sensor and caches the latest good reading.
///
/// `Poller` is a cheap handle; clones share the same loop and cache.
///
/// # Example
///
/// ```rust,no_run
/// use dhtwatch_sdk::{Poller, SimulatedSampler};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() {
///     let lifetime = CancellationToken::new();
///     let poller = Poller::builder(SimulatedSampler::new())
///         .interval(Duration::from_secs(5))
///         .lifetime(lifetime.clone())
///         .build();
///
///     // Samples once right away, then every interval
///     poller.start();
///
///     tokio::time::sleep(Duration::from_secs(1)).await;
///     println!("{:?}", poller.latest());
///
///     poller.stop().await;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Poller {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    sampler: Arc<dyn Sampler>,
    interval: Duration,
    lifetime: CancellationToken,
    shared: RwLock<Shared>,
}

/// Everything guarded by the poller's single lock.
#[derive(Debug)]
struct Shared {
    state: PollerState,
    latest: Snapshot,
    run: Option<RunControl>,
}

/// Signals for one run of the sampling loop.
#[derive(Debug, Clone, Default)]
struct RunControl {
    /// Asks the loop to exit.
    stop: CancellationToken,
    /// Cancelled by the loop once it has returned to `Idle`.
    done: CancellationToken,
}

impl Poller {
    /// Create a builder for configuring the poller.
    pub fn builder(sampler: impl Sampler + 'static) -> PollerBuilder {
        PollerBuilder::new(sampler)
    }

    /// Start the sampling loop.
    ///
    /// Samples once immediately, then once per interval until [`stop`] is
    /// called or the lifetime signal is cancelled. Returns `false` without
    /// doing anything if a loop is already running.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`stop`]: Poller::stop
    pub fn start(&self) -> bool {
        let run = {
            let mut shared = self.inner.shared.write();
            if shared.state == PollerState::Running {
                return false;
            }

            let run = RunControl::default();
            shared.state = PollerState::Running;
            shared.run = Some(run.clone());
            run
        };

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_loop(run).await });

        true
    }

    /// Stop the sampling loop and wait until it has exited.
    ///
    /// A sample already in progress is allowed to finish (and is published if
    /// it succeeds). Does nothing if the poller is idle, including when the
    /// lifetime signal already ended the loop.
    pub async fn stop(&self) {
        let done = {
            let shared = self.inner.shared.write();
            let Some(run) = shared.run.as_ref() else {
                return;
            };
            if shared.state == PollerState::Idle {
                return;
            }

            run.stop.cancel();
            run.done.clone()
        };

        done.cancelled().await;
    }

    /// The most recently published snapshot.
    ///
    /// Returns the default (invalid) snapshot until a sample succeeds.
    pub fn latest(&self) -> Snapshot {
        self.inner.shared.read().latest.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PollerState {
        self.inner.shared.read().state
    }

    /// Returns `true` while a sampling loop is active.
    pub fn is_running(&self) -> bool {
        self.state() == PollerState::Running
    }

    /// The configured sampling interval.
    pub fn interval(&self) -> Duration {
        self.inner.interval
    }
}

impl SnapshotSource for Poller {
    fn latest(&self) -> Snapshot {
        Poller::latest(self)
    }
}

impl Inner {
    async fn run_loop(&self, run: RunControl) {
        let _guard = LoopGuard {
            shared: &self.shared,
            done: run.done.clone(),
        };

        info!(interval = ?self.interval, "sensor poller started");

        self.sample_and_publish().await;

        loop {
            // Fresh timer each cycle: the wait starts after the sample finished.
            tokio::select! {
                biased;

                _ = self.lifetime.cancelled() => {
                    debug!("lifetime cancelled, sensor poller exiting");
                    break;
                }
                _ = run.stop.cancelled() => {
                    debug!("stop requested, sensor poller exiting");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sample_and_publish().await;
                }
            }
        }

        info!("sensor poller stopped");
    }

    async fn sample_and_publish(&self) {
        match self.sampler.sample().await {
            Ok(snapshot) => {
                info!(
                    temperature = snapshot.temperature,
                    humidity = snapshot.humidity,
                    timestamp = %snapshot.timestamp,
                    "successful sensor reading"
                );
                self.shared.write().latest = snapshot;
            }
            Err(e) => {
                warn!(error = %e, "failed to read sensor, will try again after interval");
            }
        }
    }
}

/// Returns the poller to `Idle` and releases `stop()` waiters when the loop
/// ends, including by panic or runtime shutdown.
struct LoopGuard<'a> {
    shared: &'a RwLock<Shared>,
    done: CancellationToken,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        {
            let mut shared = self.shared.write();
            shared.state = PollerState::Idle;
            shared.run = None;
        }
        self.done.cancel();
    }
}

/// Builder for configuring a Poller.
#[derive(Debug)]
pub struct PollerBuilder {
    sampler: Arc<dyn Sampler>,
    interval: Option<Duration>,
    lifetime: Option<CancellationToken>,
}

impl PollerBuilder {
    /// Create a new builder around a sampler.
    pub fn new(sampler: impl Sampler + 'static) -> Self {
        Self {
            sampler: Arc::new(sampler),
            interval: None,
            lifetime: None,
        }
    }

    /// Set the sampling interval.
    ///
    /// Defaults to 5 seconds if not specified.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Set the process lifetime signal. Cancelling it ends the loop.
    ///
    /// Defaults to a token that is never cancelled.
    pub fn lifetime(mut self, lifetime: CancellationToken) -> Self {
        self.lifetime = Some(lifetime);
        self
    }

    /// Build the poller. The loop is not started.
    pub fn build(self) -> Poller {
        Poller {
            inner: Arc::new(Inner {
                sampler: self.sampler,
                interval: self.interval.unwrap_or(DEFAULT_INTERVAL),
                lifetime: self.lifetime.unwrap_or_default(),
                shared: RwLock::new(Shared {
                    state: PollerState::Idle,
                    latest: Snapshot::default(),
                    run: None,
                }),
            }),
        }
    }
}
