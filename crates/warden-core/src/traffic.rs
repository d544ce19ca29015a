//! Traffic counters pulled from the engine.

use serde::{Deserialize, Serialize};

/// Counters for one engine tag over a single poll cycle.
///
/// Produced by the engine's stats interface and consumed exactly once by the
/// accounting task, which folds them into the tunnel's cumulative counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficDelta {
    /// Engine tag the counters belong to.
    pub tag: String,
    /// True for inbound (tunnel) counters, false for outbound.
    pub is_inbound: bool,
    /// Uploaded bytes since the previous poll.
    pub up: i64,
    /// Downloaded bytes since the previous poll.
    pub down: i64,
}

impl TrafficDelta {
    /// Creates an inbound delta.
    pub fn inbound(tag: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            tag: tag.into(),
            is_inbound: true,
            up,
            down,
        }
    }

    /// Creates an outbound delta.
    pub fn outbound(tag: impl Into<String>, up: i64, down: i64) -> Self {
        Self {
            tag: tag.into(),
            is_inbound: false,
            up,
            down,
        }
    }
}

const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

/// Formats a byte count with two decimals in the largest fitting binary unit.
pub fn format_traffic(bytes: i64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2}{}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_traffic_units() {
        assert_eq!(format_traffic(0), "0.00B");
        assert_eq!(format_traffic(1023), "1023.00B");
        assert_eq!(format_traffic(1024), "1.00KB");
        assert_eq!(format_traffic(1536), "1.50KB");
        assert_eq!(format_traffic(5 * 1024 * 1024), "5.00MB");
        assert_eq!(format_traffic(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn format_traffic_caps_at_largest_unit() {
        let huge = 2048_i64 * 1024 * 1024 * 1024 * 1024 * 1024;
        assert_eq!(format_traffic(huge), "2048.00PB");
    }

    #[test]
    fn delta_constructors() {
        let d = TrafficDelta::inbound("inbound-443", 10, 20);
        assert!(d.is_inbound);
        assert_eq!(d.tag, "inbound-443");

        let d = TrafficDelta::outbound("direct", 1, 2);
        assert!(!d.is_inbound);
    }
}
