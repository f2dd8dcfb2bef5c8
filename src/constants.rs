//! Timing budgets and thresholds shared by the transport and session drivers.
//!
//! Values that mirror a wire-format detail (the wraparound thresholds) are kept
//! per channel exactly as the devices report them.

use std::time::Duration;

/// Spacing between byte-availability polls while waiting for a frame
pub const FRAME_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Polls allowed before the length field has to be available
pub const HEADER_POLL_BUDGET: u32 = 50;

/// Polls allowed while accumulating the payload and check region
pub const PAYLOAD_POLL_BUDGET: u32 = 150;

/// Attempts made when opening a serial channel
pub const OPEN_ATTEMPTS: u32 = 3;

/// Per-read timeout handed to the serial channel
pub const CHANNEL_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Snapshot age (seconds) after which telemetry is considered stale
pub const STALE_AFTER_SECS: u64 = 15;

/// Snapshot age (seconds) after which the radio stack is reset
pub const RESET_AFTER_SECS: u64 = 30;

/// Interval (seconds of snapshot age) between link diagnostics while stale
pub const DIAGNOSTIC_INTERVAL_SECS: u64 = 15;

/// Wait after resetting the radio stack and after restarting scraping
pub const RESET_SETTLE: Duration = Duration::from_secs(2);

/// Attempts made while waiting for the link and a first snapshot
pub const CONNECT_ATTEMPTS: u32 = 10;

/// Spacing between connect attempts
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lower bound (exclusive) of a plausible cell voltage
pub const CELL_VOLTAGE_MIN: f64 = 1.0;

/// Upper bound (exclusive) of a plausible cell voltage
pub const CELL_VOLTAGE_MAX: f64 = 5.0;

/// MOSFET temperature above which the overtemperature alarm is raised
pub const MOSFET_ALARM_TEMPERATURE: f64 = 80.0;

/// Wraparound point of the MOSFET temperature register
pub const TEMPERATURE_MOS_WRAP: f64 = 3276.7;

/// Wraparound point of the first auxiliary temperature register
pub const TEMPERATURE_1_WRAP: f64 = 32767.0;

/// Wraparound point of the second auxiliary temperature register
pub const TEMPERATURE_2_WRAP: f64 = 3276.7;

/// Offset subtracted from a wrapped temperature reading
pub const TEMPERATURE_WRAP_OFFSET: f64 = 6553.5;

/// Wraparound point of the balancing current register
pub const BALANCING_CURRENT_WRAP: f64 = 32767.0;

/// Offset subtracted from a wrapped balancing current reading
pub const BALANCING_CURRENT_WRAP_OFFSET: f64 = 65535.0 / 1000.0;

/// Imbalance alarm: fraction of the cell OVP setpoint and its absolute cap
pub const IMBALANCE_ALARM_FACTOR: f64 = 0.05;
pub const IMBALANCE_ALARM_CAP: f64 = 0.400;

/// Imbalance warning: fraction of the cell OVP setpoint and its absolute cap
pub const IMBALANCE_WARNING_FACTOR: f64 = 0.03;
pub const IMBALANCE_WARNING_CAP: f64 = 0.300;

/// Placeholder some firmwares put in the user data field when it was never set
pub const UNSET_PRODUCTION_FIELD: &str = "Input Us";

/// Interval between periodic telemetry summaries in the debug log
pub const SUMMARY_LOG_INTERVAL_SECS: i64 = 60;
