//! Error types for BMS transport, session and curve operations.

use thiserror::Error;

/// Result type alias for BMS operations.
pub type Result<T> = std::result::Result<T, BmsError>;

/// Which part of a frame read ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    /// Waiting for the length field to arrive
    Header,
    /// Accumulating payload and check region
    Payload,
}

impl std::fmt::Display for FrameStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameStage::Header => f.write_str("header"),
            FrameStage::Payload => f.write_str("payload"),
        }
    }
}

/// Error types for BMS communication and evaluation.
#[derive(Error, Debug)]
pub enum BmsError {
    /// Serial port error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough bytes arrived within the polling budget
    #[error("Transport timeout waiting for {stage} [len:{observed}/{expected}] (battery online: {online})")]
    TransportTimeout {
        /// Stage of the frame read that timed out
        stage: FrameStage,
        /// Bytes buffered when the budget ran out
        observed: usize,
        /// Bytes required to complete the stage
        expected: usize,
        /// Whether the battery was online before this exchange
        online: bool,
    },

    /// Frame too short to hold its length field
    #[error("Malformed frame [len:{observed}], need {required} bytes for the length field")]
    MalformedFrame {
        /// Bytes received
        observed: usize,
        /// Bytes needed to decode the length field
        required: usize,
    },

    /// Serial channel could not be opened
    #[error("Channel {port} unavailable after {attempts} attempts")]
    ChannelUnavailable {
        /// Port name
        port: String,
        /// Attempts made
        attempts: u32,
    },

    /// Latest snapshot is too old to be used
    #[error("Stale telemetry: no fresh data since {age_secs} s")]
    StaleTelemetry {
        /// Age of the latest snapshot in seconds
        age_secs: u64,
    },

    /// Degenerate or malformed curve input
    #[error("Domain error: {0}")]
    Domain(String),

    /// Single cell reading outside the plausible window
    #[error("Cell {cell} voltage out of range (1 - 5 V): {voltage}")]
    OutOfRangeReading {
        /// Cell index
        cell: usize,
        /// Reported voltage
        voltage: f64,
    },

    /// Length field width not one of 1, 2 or 4 bytes
    #[error("Invalid length field: {0}")]
    InvalidLengthField(String),

    /// Accumulator has not delivered device settings yet
    #[error("Device settings missing")]
    MissingSettings,

    /// Device reported a different cell count than at session start
    #[error("Cell count changed from {expected} to {actual}")]
    CellCountChanged {
        /// Cell count fixed at the first settings read
        expected: usize,
        /// Newly reported cell count
        actual: usize,
    },

    /// Vendor id not accepted by this driver
    #[error("Unsupported vendor id: {0}")]
    UnsupportedVendor(String),

    /// No snapshot has arrived yet
    #[error("No telemetry available")]
    NoTelemetry,

    /// Link or first snapshot did not show up in time
    #[error("Connect timed out after {attempts} attempts")]
    ConnectTimeout {
        /// Attempts made
        attempts: u32,
    },

    /// Radio stack reset or diagnostics failed
    #[error("Radio stack error: {0}")]
    Radio(String),

    /// Session was explicitly stopped
    #[error("Session stopped")]
    Stopped,
}

impl BmsError {
    pub fn domain(msg: impl Into<String>) -> Self {
        Self::Domain(msg.into())
    }

    pub fn radio(msg: impl Into<String>) -> Self {
        Self::Radio(msg.into())
    }
}
