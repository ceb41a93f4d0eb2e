//! Snapshot - the latest sensor measurement as served to readers.

/// A point-in-time measurement published by the poller.
///
/// Snapshots are replaced wholesale; a reader always sees either the default
/// (invalid) snapshot or one that was produced by a complete, successful
/// sample.
///
/// # Example
///
/// ```rust
/// use dhtwatch_types::Snapshot;
///
/// let snapshot = Snapshot::builder()
///     .temperature(21.5)
///     .humidity(40.0)
///     .timestamp("17 Oct 26 14:05 +0200")
///     .build();
///
/// assert!(snapshot.valid);
///
/// // Serialize with serde (requires "serde" feature)
/// // let json = serde_json::to_string(&snapshot)?;
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Snapshot {
    /// Temperature in degrees Celsius.
    pub temperature: f64,

    /// Relative humidity in percent.
    pub humidity: f64,

    /// Local wall-clock time at which sampling started, formatted with
    /// [`TIMESTAMP_FORMAT`](crate::TIMESTAMP_FORMAT). Empty until the first
    /// successful sample.
    pub timestamp: String,

    /// Whether this snapshot came from a successful sample.
    pub valid: bool,
}

impl Snapshot {
    /// Create a builder for a valid snapshot.
    pub fn builder() -> SnapshotBuilder {
        SnapshotBuilder::new()
    }
}

/// Builder for constructing valid `Snapshot` instances.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    temperature: f64,
    humidity: f64,
    timestamp: String,
}

impl SnapshotBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the temperature in degrees Celsius.
    pub fn temperature(mut self, celsius: f64) -> Self {
        self.temperature = celsius;
        self
    }

    /// Set the relative humidity in percent.
    pub fn humidity(mut self, percent: f64) -> Self {
        self.humidity = percent;
        self
    }

    /// Set the preformatted timestamp.
    pub fn timestamp(mut self, ts: impl Into<String>) -> Self {
        self.timestamp = ts.into();
        self
    }

    /// Build the snapshot. Built snapshots are always marked valid.
    pub fn build(self) -> Snapshot {
        Snapshot {
            temperature: self.temperature,
            humidity: self.humidity,
            timestamp: self.timestamp,
            valid: true,
        }
    }
}
