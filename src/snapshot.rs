//! Typed telemetry delivered by a vendor accumulator.
//!
//! The accumulator decodes its wire protocol into a [`TelemetrySnapshot`] once
//! and publishes it through a [`SnapshotSlot`]. Temperature and balancing
//! current fields are kept in their wire scaling; the session driver applies
//! the per-channel wraparound correction when it projects a snapshot.

use crate::constants::*;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Warning flags reported by the BMS
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warnings {
    pub cell_overvoltage: bool,
    pub cell_undervoltage: bool,
    pub charge_overcurrent: bool,
    pub discharge_overcurrent: bool,
    pub charge_overtemp: bool,
    pub charge_undertemp: bool,
    pub discharge_overtemp: bool,
}

/// Physical FET states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchStates {
    pub charging: bool,
    pub discharging: bool,
    pub balancing: bool,
}

/// One decoded status record.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySnapshot {
    /// Per-cell voltages in V, one per configured cell
    pub cell_voltages: Vec<f64>,
    /// Pack voltage in V
    pub total_voltage: f64,
    /// Pack current in A, charge positive
    pub current: f64,
    /// State of charge in %
    pub soc: f64,
    /// MOSFET sensor reading, wire scaled
    pub temperature_mos: f64,
    /// First auxiliary sensor reading, wire scaled
    pub temperature_1: f64,
    /// Second auxiliary sensor reading, wire scaled
    pub temperature_2: f64,
    pub balancing_active: bool,
    /// Balancing current, wire scaled
    pub balancing_current: f64,
    pub min_voltage_cell_index: usize,
    pub max_voltage_cell_index: usize,
    /// Spread between highest and lowest cell in V
    pub delta_cell_voltage: f64,
    pub warnings: Warnings,
    pub cycle_count: u32,
    pub switch_states: SwitchStates,
    /// Capture time on the monotonic clock
    pub last_update: Instant,
}

impl TelemetrySnapshot {
    /// MOSFET temperature in °C
    pub fn temperature_mos_celsius(&self) -> f64 {
        unwrap_temperature(self.temperature_mos, TEMPERATURE_MOS_WRAP)
    }

    /// First auxiliary temperature in °C
    pub fn temperature_1_celsius(&self) -> f64 {
        unwrap_temperature(self.temperature_1, TEMPERATURE_1_WRAP)
    }

    /// Second auxiliary temperature in °C
    pub fn temperature_2_celsius(&self) -> f64 {
        unwrap_temperature(self.temperature_2, TEMPERATURE_2_WRAP)
    }

    /// Balancing current in A
    pub fn balancing_current_amps(&self) -> f64 {
        if self.balancing_current < BALANCING_CURRENT_WRAP {
            self.balancing_current
        } else {
            (BALANCING_CURRENT_WRAP_OFFSET - self.balancing_current) * -1.0
        }
    }
}

/// Readings at or above `wrap` encode negative temperatures.
fn unwrap_temperature(raw: f64, wrap: f64) -> f64 {
    if raw < wrap {
        raw
    } else {
        (TEMPERATURE_WRAP_OFFSET - raw) * -1.0
    }
}

/// Settings block read once after connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub cell_count: usize,
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
    /// Cell overvoltage protection setpoint in V
    pub cell_ovp: f64,
    /// Cell overvoltage protection recovery in V
    pub cell_ovpr: f64,
    /// Nominal capacity in Ah
    pub capacity_nominal: f64,
    pub vendor_id: String,
    pub hw_rev: String,
    /// User data field, raw
    #[serde(default)]
    pub production: String,
    /// Manufacturing date as `YYMMDD`
    #[serde(default)]
    pub manufacturing_date: String,
}

impl DeviceSettings {
    /// User data field, `None` when unset or still the factory placeholder.
    pub fn custom_field(&self) -> Option<&str> {
        match self.production.trim() {
            "" | UNSET_PRODUCTION_FIELD => None,
            field => Some(field),
        }
    }

    /// Manufacturing date; the two-digit year is read as 20xx.
    pub fn production_date(&self) -> Option<NaiveDate> {
        let raw = self.manufacturing_date.trim();
        if raw.is_empty() {
            return None;
        }
        NaiveDate::parse_from_str(&format!("20{raw}"), "%Y%m%d").ok()
    }

    /// Human readable hardware description, e.g. `JKBMS 11.XW 16S (2023-04-01)`.
    pub fn hardware_version(&self, model: &str) -> String {
        let mut version = format!("{} {} {}S", model, self.hw_rev, self.cell_count);
        if let Some(date) = self.production_date() {
            version.push_str(&format!(" ({})", date.format("%Y-%m-%d")));
        }
        version
    }
}

/// Latest-value cell shared between the notification listener and the driver.
///
/// The listener overwrites, the driver reads whatever is present. Clones share
/// the same slot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSlot {
    inner: Arc<Mutex<Option<TelemetrySnapshot>>>,
}

impl SnapshotSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot.
    pub fn publish(&self, snapshot: TelemetrySnapshot) {
        let mut slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(snapshot);
    }

    /// Copy of the current snapshot, if any has arrived.
    pub fn latest(&self) -> Option<TelemetrySnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drop the current snapshot.
    pub fn clear(&self) {
        let mut slot = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn settings() -> DeviceSettings {
        DeviceSettings {
            cell_count: 4,
            max_charge_current: 100.0,
            max_discharge_current: 150.0,
            cell_ovp: 3.65,
            cell_ovpr: 3.55,
            capacity_nominal: 280.0,
            vendor_id: "JK_B2A8S20P".to_string(),
            hw_rev: "11.XW".to_string(),
            production: "Input Us".to_string(),
            manufacturing_date: "230401".to_string(),
        }
    }

    fn snapshot(soc: f64) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cell_voltages: vec![3.3; 4],
            total_voltage: 13.2,
            current: 0.0,
            soc,
            temperature_mos: 25.0,
            temperature_1: 24.0,
            temperature_2: 23.0,
            balancing_active: false,
            balancing_current: 0.0,
            min_voltage_cell_index: 0,
            max_voltage_cell_index: 0,
            delta_cell_voltage: 0.0,
            warnings: Warnings::default(),
            cycle_count: 0,
            switch_states: SwitchStates::default(),
            last_update: Instant::now(),
        }
    }

    #[test]
    fn test_temperature_wraparound_per_channel() {
        let mut snap = snapshot(50.0);
        snap.temperature_mos = 6543.5;
        snap.temperature_1 = 6543.5;
        snap.temperature_2 = 3276.7;
        assert!((snap.temperature_mos_celsius() - -10.0).abs() < 1e-9);
        // the first auxiliary register wraps much higher
        assert_eq!(snap.temperature_1_celsius(), 6543.5);
        assert!((snap.temperature_2_celsius() - -3276.8).abs() < 1e-9);

        snap.temperature_mos = 31.5;
        assert_eq!(snap.temperature_mos_celsius(), 31.5);
    }

    #[test]
    fn test_balancing_current_wraparound() {
        let mut snap = snapshot(50.0);
        snap.balancing_current = 0.4;
        assert_eq!(snap.balancing_current_amps(), 0.4);
        snap.balancing_current = 40000.0;
        assert!((snap.balancing_current_amps() - (40000.0 - 65.535)).abs() < 1e-9);
    }

    #[test]
    fn test_custom_field_placeholder() {
        let mut st = settings();
        assert_eq!(st.custom_field(), None);
        st.production = "Shed rack".to_string();
        assert_eq!(st.custom_field(), Some("Shed rack"));
    }

    #[test]
    fn test_hardware_version() {
        let st = settings();
        assert_eq!(st.production_date(), NaiveDate::from_ymd_opt(2023, 4, 1));
        assert_eq!(st.hardware_version("JKBMS"), "JKBMS 11.XW 4S (2023-04-01)");

        let st = DeviceSettings {
            manufacturing_date: "garbage".to_string(),
            ..settings()
        };
        assert_eq!(st.hardware_version("JKBMS"), "JKBMS 11.XW 4S");
    }

    #[test]
    fn test_slot_last_value_wins() {
        let slot = SnapshotSlot::new();
        assert!(slot.latest().is_none());

        let writer = slot.clone();
        thread::spawn(move || {
            writer.publish(snapshot(10.0));
            writer.publish(snapshot(20.0));
        })
        .join()
        .unwrap();

        assert_eq!(slot.latest().map(|s| s.soc), Some(20.0));
        slot.clear();
        assert!(slot.latest().is_none());
    }
}
