//! # dhtwatch-types
//!
//! Core types shared by the dhtwatch poller, its HTTP server and anything
//! consuming the served JSON.
//!
//! ## Types
//!
//! - [`Snapshot`]: the latest published measurement plus its validity flag and
//!   the local time at which sampling started. This is what readers see.
//! - [`Reading`]: the payload printed by the external sensor program. It is
//!   transient: the poller classifies it and either publishes a [`Snapshot`]
//!   or drops it.
//!
//! ## Features
//!
//! - `serde`: JSON serialization of both types via serde
//!
//! ## Example
//!
//! ```rust
//! use dhtwatch_types::{Reading, Snapshot};
//!
//! let reading = Reading {
//!     temperature: 21.5,
//!     humidity: 40.0,
//!     error: false,
//!     error_code: -9999,
//! };
//!
//! let snapshot = reading.into_snapshot("17 Oct 26 14:05 +0200").unwrap();
//! assert!(snapshot.valid);
//! assert_eq!(snapshot.temperature, 21.5);
//!
//! assert!(!Snapshot::default().valid);
//! ```

mod reading;
mod snapshot;

pub use reading::*;
pub use snapshot::*;

/// `strftime` pattern for [`Snapshot::timestamp`].
///
/// RFC 822 with a numeric zone, e.g. `17 Oct 26 14:05 +0200`.
pub const TIMESTAMP_FORMAT: &str = "%d %b %y %H:%M %z";
