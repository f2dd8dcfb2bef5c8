//! Serial Polling Example
//!
//! Sends a status request to a length-prefixed serial BMS and dumps the
//! response frame every few seconds.
//!
//! Usage:
//!   cargo run --example poll_serial                  # Interactive mode
//!   cargo run --example poll_serial -- /dev/ttyUSB0
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=trace cargo run --example poll_serial

use bms_link::transport::{list_ports, unique_identifier};
use bms_link::{read_serial_data, FrameSpec, LengthField, Result, SerialPortProvider};
use inquire::Select;
use log::{info, warn};
use std::time::Duration;

const BAUD: u32 = 115_200;

/// JK RS485 "read all" request
const READ_ALL: [u8; 21] = [
    0x4E, 0x57, 0x00, 0x13, 0x00, 0x00, 0x00, 0x00, 0x06, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x68, 0x00, 0x00, 0x01, 0x29,
];

fn select_port() -> Result<String> {
    let ports = list_ports()?;

    if ports.is_empty() {
        eprintln!("No serial ports found!");
        std::process::exit(1);
    }

    let port_names: Vec<String> = ports.iter().map(|p| p.port_name.clone()).collect();

    Select::new("Select a serial port:", port_names)
        .prompt()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, format!("Selection cancelled: {}", e)).into())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let port_name = std::env::args()
        .nth(1)
        .map(Ok)
        .unwrap_or_else(select_port)?;

    info!("Polling {} ({})", port_name, unique_identifier(&port_name, None));

    // length counts itself and everything after it
    let spec = FrameSpec::new(2, LengthField::U16, 2);
    let provider = SerialPortProvider::default();

    for round in 0.. {
        match read_serial_data(&provider, &port_name, BAUD, &READ_ALL, &spec, round > 0) {
            Ok(frame) => {
                let hex: Vec<String> = frame.iter().map(|b| format!("{b:02X}")).collect();
                info!("{} bytes: {}", frame.len(), hex.join(" "));
            }
            Err(e) => warn!("Read failed: {}", e),
        }
        std::thread::sleep(Duration::from_secs(5));
    }

    Ok(())
}
