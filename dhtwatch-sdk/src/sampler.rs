//! Sensor sampling.
//!
//! A [`Sampler`] takes exactly one measurement per call and classifies it:
//! either a valid [`Snapshot`] or a [`SampleError`]. Samplers never retry;
//! the poller decides when to ask again.

use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dhtwatch_types::{Reading, Snapshot, TIMESTAMP_FORMAT};
use tokio::process::Command;

use crate::error::SampleError;

/// A source of sensor measurements.
///
/// Implementations must be stateless with respect to the poller: one call is
/// one attempt.
#[async_trait]
pub trait Sampler: Send + Sync + Debug {
    /// Take one measurement.
    async fn sample(&self) -> Result<Snapshot, SampleError>;
}

#[async_trait]
impl<S: Sampler + ?Sized> Sampler for std::sync::Arc<S> {
    async fn sample(&self) -> Result<Snapshot, SampleError> {
        (**self).sample().await
    }
}

/// Current local time formatted for [`Snapshot::timestamp`].
pub fn local_timestamp() -> String {
    chrono::Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Default time allowed for one run of the sensor program.
pub const DEFAULT_SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Samples by running an external program that prints a [`Reading`] as JSON.
///
/// The program is invoked as `program [args..] <channel>`, where `channel` is
/// the sensor's data pin as a decimal number.
///
/// # Example
///
/// ```rust,no_run
/// use dhtwatch_sdk::{CommandSampler, Sampler};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let sampler = CommandSampler::builder()
///         .program("python3")
///         .arg("rpi.py")
///         .channel(19)
///         .timeout(Duration::from_secs(5))
///         .build();
///
///     match sampler.sample().await {
///         Ok(snapshot) => println!("{:.1}°C", snapshot.temperature),
///         Err(e) => eprintln!("{}", e),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CommandSampler {
    program: PathBuf,
    args: Vec<String>,
    channel: u32,
    timeout: Option<Duration>,
}

impl CommandSampler {
    /// Create a sampler running `program <channel>` with the default timeout.
    pub fn new(program: impl Into<PathBuf>, channel: u32) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            channel,
            timeout: Some(DEFAULT_SAMPLE_TIMEOUT),
        }
    }

    /// Create a builder for configuring the sampler.
    pub fn builder() -> CommandSamplerBuilder {
        CommandSamplerBuilder::default()
    }

    /// The sensor channel passed as the last argument.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run the program once and return its standard output.
    async fn run(&self) -> Result<Vec<u8>, SampleError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(self.channel.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, command.output())
                .await
                .map_err(|_| SampleError::Timeout {
                    program: self.program_name(),
                    timeout,
                })?,
            None => command.output().await,
        }
        .map_err(|source| SampleError::Spawn {
            program: self.program_name(),
            source,
        })?;

        if !output.status.success() {
            return Err(SampleError::Exit {
                program: self.program_name(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl Sampler for CommandSampler {
    async fn sample(&self) -> Result<Snapshot, SampleError> {
        // Stamped before the call so the program's runtime is not included.
        let timestamp = local_timestamp();

        let stdout = self.run().await?;
        let reading: Reading = serde_json::from_slice(&stdout)?;

        Ok(reading.into_snapshot(timestamp)?)
    }
}

/// Builder for CommandSampler.
#[derive(Debug, Default)]
pub struct CommandSamplerBuilder {
    program: Option<PathBuf>,
    args: Vec<String>,
    channel: Option<u32>,
    timeout: Option<Option<Duration>>,
}

impl CommandSamplerBuilder {
    /// Set the program to run.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Add an argument placed before the channel.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments placed before the channel.
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the sensor channel (GPIO pin).
    pub fn channel(mut self, channel: u32) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Kill the program if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Some(timeout));
        self
    }

    /// Let the program run for as long as it takes.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = Some(None);
        self
    }

    /// Build the sampler.
    ///
    /// Defaults to `rpi.py` on channel 5 with a 10 second timeout.
    pub fn build(self) -> CommandSampler {
        CommandSampler {
            program: self.program.unwrap_or_else(|| PathBuf::from("rpi.py")),
            args: self.args,
            channel: self.channel.unwrap_or(5),
            timeout: self.timeout.unwrap_or(Some(DEFAULT_SAMPLE_TIMEOUT)),
        }
    }
}

/// A stand-in for the hardware used during development.
///
/// Reports a fixed 20.8°C / 41.3% and fails every tenth reading with sensor
/// error code 2, so the stale-cache path is exercised too.
#[derive(Debug, Default)]
pub struct SimulatedSampler {
    samples: AtomicU64,
}

impl SimulatedSampler {
    /// Every n-th sample fails.
    pub const FAILURE_PERIOD: u64 = 10;

    /// Create a new simulated sensor.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sampler for SimulatedSampler {
    async fn sample(&self) -> Result<Snapshot, SampleError> {
        let timestamp = local_timestamp();
        let n = self.samples.fetch_add(1, Ordering::Relaxed) + 1;

        let reading = if n % Self::FAILURE_PERIOD == 0 {
            Reading {
                temperature: -9999.0,
                humidity: -9999.0,
                error: true,
                error_code: 2,
            }
        } else {
            Reading {
                temperature: 20.8,
                humidity: 41.3,
                error: false,
                error_code: -9999,
            }
        };

        Ok(reading.into_snapshot(timestamp)?)
    }
}
