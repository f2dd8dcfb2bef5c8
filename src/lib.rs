//! # BMS Link
//!
//! Building blocks for battery management system drivers that talk to the
//! device over unreliable links and hand a normalized safety model to a power
//! management supervisor.
//!
//! ## Features
//!
//! - Length-prefixed framed reads over serial channels with bounded polling
//! - BLE session lifecycle with staleness detection and radio stack recovery
//! - Piecewise linear and step control curves for CCL/DCL derivation
//! - Protection severities and cell imbalance evaluation from live telemetry
//!
//! ## Example
//!
//! ```no_run
//! use bms_link::{read_serial_data, FrameSpec, LengthField, SerialPortProvider};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let spec = FrameSpec::new(2, LengthField::U16, 4);
//!     let frame = read_serial_data(
//!         &SerialPortProvider::default(),
//!         "/dev/ttyUSB0",
//!         115_200,
//!         &[0x4E, 0x57, 0x00, 0x13],
//!         &spec,
//!         true,
//!     )?;
//!     println!("{} bytes", frame.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod constants;
pub mod curve;
pub mod error;
pub mod limits;
pub mod protection;
pub mod session;
pub mod snapshot;
pub mod transport;

pub use config::{CurveTable, DriverConfig, LimitsConfig};
pub use curve::{clamp, interpolate_linear, lookup_step, remap, remap_clamped, Curve};
pub use error::{BmsError, Result};
pub use limits::{CurrentCorrection, CurrentLimiter};
pub use protection::{ProtectionLevel, ProtectionState};
pub use session::{
    Accumulator, BleSessionDriver, Cell, Clock, ConnectionState, RadioStack, SystemClock, Telemetry,
};
pub use snapshot::{DeviceSettings, SnapshotSlot, SwitchStates, TelemetrySnapshot, Warnings};
pub use transport::{
    read_serial_data, ChannelProvider, FrameSpec, FramedTransport, LengthField, SerialChannel,
    SerialPortProvider,
};
