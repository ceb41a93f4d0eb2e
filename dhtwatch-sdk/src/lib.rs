//! # dhtwatch-sdk
//!
//! Periodic DHT sensor sampling with a cached latest reading, served over HTTP.
//!
//! A [`Poller`] runs a [`Sampler`] on a fixed interval and keeps the most
//! recent successful reading. A [`DataServer`] exposes that reading as JSON,
//! and a [`ShutdownOrchestrator`] takes both down cleanly on a signal.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dhtwatch_sdk::{
//!     termination_signal, CommandSampler, DataServer, Poller, ServerConfig,
//!     ShutdownOrchestrator,
//! };
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let lifetime = CancellationToken::new();
//!
//!     // Read channel 5 through the sensor script every five seconds
//!     let poller = Poller::builder(CommandSampler::new("rpi.py", 5))
//!         .interval(Duration::from_secs(5))
//!         .lifetime(lifetime.clone())
//!         .build();
//!     poller.start();
//!
//!     // Serve the latest reading on GET /data
//!     let server = DataServer::bind(ServerConfig::default())
//!         .await?
//!         .serve(poller.clone());
//!
//!     // Drain the server, then stop the poller, on SIGINT or SIGTERM
//!     ShutdownOrchestrator::builder(lifetime)
//!         .endpoint(server)
//!         .poller(poller)
//!         .build()
//!         .run_until(termination_signal())
//!         .await;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Non-blocking reads**: `latest()` never waits on a sample in progress
//! - **Failure tolerant**: a failed sample keeps the previous reading
//! - **Bounded samples**: a hung sensor program is killed after a timeout
//! - **Ordered shutdown**: endpoints drain before sampling stops

mod error;
mod poller;
mod sampler;
pub mod server;
mod shutdown;

pub use error::{DrainError, SampleError, ServerError};
pub use poller::{Poller, PollerBuilder, PollerState, SnapshotSource, DEFAULT_INTERVAL};
pub use sampler::{
    local_timestamp, CommandSampler, CommandSamplerBuilder, Sampler, SimulatedSampler,
    DEFAULT_SAMPLE_TIMEOUT,
};
pub use server::{DataServer, ServerConfig, ServerConfigBuilder, ServerHandle};
pub use shutdown::{
    termination_signal, Drain, ShutdownOrchestrator, ShutdownOrchestratorBuilder, ShutdownPhase,
    DEFAULT_DRAIN_TIMEOUT,
};

// Re-export types for convenience
pub use dhtwatch_types::{Reading, SensorFault, Snapshot, TIMESTAMP_FORMAT};
