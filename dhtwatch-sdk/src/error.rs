//! Error types for sampling, serving and draining.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while taking one sample.
///
/// None of these are fatal: the poller logs them and keeps serving the
/// previous snapshot until the next tick.
#[derive(Debug, Error)]
pub enum SampleError {
    /// The sensor program could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The sensor program exited unsuccessfully.
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    /// The sensor program did not finish in time and was killed.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// The program's output was not a well-formed reading.
    #[error("failed to parse sensor output: {0}")]
    Parse(#[from] serde_json::Error),

    /// The reading was well-formed but flagged a sensor failure.
    #[error("error during read: {code}")]
    Sensor { code: i64 },
}

impl From<dhtwatch_types::SensorFault> for SampleError {
    fn from(fault: dhtwatch_types::SensorFault) -> Self {
        SampleError::Sensor { code: fault.code }
    }
}

/// Errors that can occur when starting the data server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured listen address is not a valid socket address.
    #[error("invalid listen address {addr}: {source}")]
    Address {
        addr: String,
        #[source]
        source: std::net::AddrParseError,
    },

    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Other socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors reported by a serving endpoint while draining.
#[derive(Debug, Error)]
pub enum DrainError {
    /// Connections were still open when the deadline passed; they have been
    /// force-closed.
    #[error("drain did not complete within {0:?}")]
    Timeout(Duration),

    /// The serving task ended abnormally.
    #[error("serving task aborted: {0}")]
    Aborted(String),
}
