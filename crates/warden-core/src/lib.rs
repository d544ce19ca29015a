//! Warden Core - domain types shared by the control plane crates.
//!
//! This crate is a leaf: it knows nothing about SQLite, processes or sockets.
//! It provides:
//!
//! - [`Protocol`], the proxy protocol a tunnel is realised with
//! - [`TrafficDelta`], one poll cycle's worth of counters for a single tag
//! - [`format_traffic`], human-readable byte counts for reports
//! - [`now_millis`], the epoch-millisecond clock used for tunnel expiry

pub mod protocol;
pub mod traffic;

pub use protocol::{Protocol, ProtocolParseError};
pub use traffic::{format_traffic, TrafficDelta};

/// Product name used for data directories and log file prefixes.
pub const APP_NAME: &str = "warden";

/// Current wall-clock time as epoch milliseconds.
///
/// Tunnel `expiry_time` values are stored in this unit.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
