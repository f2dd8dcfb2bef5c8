//! Protection severities derived from a snapshot.

use crate::constants::*;
use crate::snapshot::{TelemetrySnapshot, Warnings};
use serde::{Deserialize, Serialize};

/// Ordered severity of a single hazard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionLevel {
    #[default]
    Normal = 0,
    Warning = 1,
    Alarm = 2,
}

impl ProtectionLevel {
    /// `Alarm` when the flag is set.
    pub fn from_flag(flag: bool) -> Self {
        if flag {
            ProtectionLevel::Alarm
        } else {
            ProtectionLevel::Normal
        }
    }
}

impl From<ProtectionLevel> for u8 {
    fn from(level: ProtectionLevel) -> u8 {
        level as u8
    }
}

/// One severity per hazard, recomputed every cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionState {
    pub cell_imbalance: ProtectionLevel,
    pub high_cell_voltage: ProtectionLevel,
    pub low_cell_voltage: ProtectionLevel,
    pub high_charge_current: ProtectionLevel,
    pub mosfet_overtemp: ProtectionLevel,
    pub high_charge_temperature: ProtectionLevel,
    pub low_charge_temperature: ProtectionLevel,
    pub high_discharge_temperature: ProtectionLevel,
}

impl ProtectionState {
    /// Evaluate every hazard of `snapshot`.
    ///
    /// `cell_ovp` is the device's cell overvoltage setpoint; the imbalance
    /// thresholds scale with it.
    pub fn evaluate(snapshot: &TelemetrySnapshot, cell_ovp: f64, mosfet_alarm_temperature: f64) -> Self {
        let Warnings {
            cell_overvoltage,
            cell_undervoltage,
            charge_overcurrent,
            discharge_overcurrent,
            charge_overtemp,
            charge_undertemp,
            discharge_overtemp,
        } = snapshot.warnings;

        Self {
            cell_imbalance: cell_imbalance_level(snapshot.delta_cell_voltage, cell_ovp),
            high_cell_voltage: ProtectionLevel::from_flag(cell_overvoltage),
            low_cell_voltage: ProtectionLevel::from_flag(cell_undervoltage),
            high_charge_current: ProtectionLevel::from_flag(charge_overcurrent || discharge_overcurrent),
            mosfet_overtemp: ProtectionLevel::from_flag(
                snapshot.temperature_mos_celsius() > mosfet_alarm_temperature,
            ),
            high_charge_temperature: ProtectionLevel::from_flag(charge_overtemp),
            low_charge_temperature: ProtectionLevel::from_flag(charge_undertemp),
            high_discharge_temperature: ProtectionLevel::from_flag(discharge_overtemp),
        }
    }

    /// Highest severity across all hazards.
    pub fn worst(&self) -> ProtectionLevel {
        [
            self.cell_imbalance,
            self.high_cell_voltage,
            self.low_cell_voltage,
            self.high_charge_current,
            self.mosfet_overtemp,
            self.high_charge_temperature,
            self.low_charge_temperature,
            self.high_discharge_temperature,
        ]
        .into_iter()
        .max()
        .unwrap_or_default()
    }
}

/// Severity of a cell voltage spread relative to the OVP setpoint.
pub fn cell_imbalance_level(delta_cell_voltage: f64, cell_ovp: f64) -> ProtectionLevel {
    if delta_cell_voltage > (cell_ovp * IMBALANCE_ALARM_FACTOR).min(IMBALANCE_ALARM_CAP) {
        ProtectionLevel::Alarm
    } else if delta_cell_voltage > (cell_ovp * IMBALANCE_WARNING_FACTOR).min(IMBALANCE_WARNING_CAP) {
        ProtectionLevel::Warning
    } else {
        ProtectionLevel::Normal
    }
}
