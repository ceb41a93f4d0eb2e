//! Reading - the payload printed by the external sensor program.

use core::fmt;

use crate::Snapshot;

/// One raw reading as reported by the sensor program on standard output.
///
/// The program prints a JSON object such as:
///
/// ```json
/// {"error": false, "error_code": -9999, "temperature": 21.5, "humidity": 40.0}
/// ```
///
/// When the sensor could not be read, `error` is `true` and `error_code`
/// carries the driver's code; the measurement fields are then meaningless.
/// Absent keys decode as zero / `false`. Anything other than a JSON object,
/// including an array, is rejected.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Reading {
    /// Temperature in degrees Celsius.
    pub temperature: f64,

    /// Relative humidity in percent.
    pub humidity: f64,

    /// Set by the program when the sensor reported a failure.
    pub error: bool,

    /// Driver error code, only meaningful when `error` is set.
    pub error_code: i64,
}

impl Reading {
    /// Classify this reading.
    ///
    /// Returns a valid [`Snapshot`] stamped with `timestamp`, or the embedded
    /// sensor fault if the program flagged one.
    pub fn into_snapshot(self, timestamp: impl Into<String>) -> Result<Snapshot, SensorFault> {
        if self.error {
            return Err(SensorFault {
                code: self.error_code,
            });
        }

        Ok(Snapshot {
            temperature: self.temperature,
            humidity: self.humidity,
            timestamp: timestamp.into(),
            valid: true,
        })
    }
}

/// A failure reported by the sensor program inside an otherwise well-formed
/// payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorFault {
    /// Driver error code.
    pub code: i64,
}

impl fmt::Display for SensorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sensor reported error code {}", self.code)
    }
}

impl std::error::Error for SensorFault {}

// Hand-written so that only maps are accepted; a derived impl would also
// take a sequence of fields.
#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Reading {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ReadingVisitor;

        impl<'de> serde::de::Visitor<'de> for ReadingVisitor {
            type Value = Reading;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a sensor reading object")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Reading, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut reading = Reading::default();
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "temperature" => reading.temperature = map.next_value()?,
                        "humidity" => reading.humidity = map.next_value()?,
                        "error" => reading.error = map.next_value()?,
                        "error_code" => reading.error_code = map.next_value()?,
                        _ => {
                            map.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }
                Ok(reading)
            }
        }

        deserializer.deserialize_map(ReadingVisitor)
    }
}
