//! Driver configuration.
//!
//! Every field has a default, so a supervisor only needs to deserialize the
//! values it overrides. Curves are described as setpoints plus fractions of the
//! maximum current and turned into validated [`Curve`](crate::curve::Curve)s
//! by [`DriverConfig::validate`].

use crate::constants::*;
use crate::error::{BmsError, Result};
use crate::limits::{CurrentCorrection, CurrentLimiter};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Setpoints and the fraction of the maximum current allowed at each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveTable {
    pub setpoints: Vec<f64>,
    pub fractions: Vec<f64>,
}

impl CurveTable {
    pub fn new(setpoints: &[f64], fractions: &[f64]) -> Self {
        Self {
            setpoints: setpoints.to_vec(),
            fractions: fractions.to_vec(),
        }
    }
}

/// Charge/discharge current limitation (CCL/DCL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_charge_current: f64,
    pub max_discharge_current: f64,
    /// Interpolate between setpoints instead of stepping
    pub linear: bool,
    pub charge_cell_voltage: Option<CurveTable>,
    pub discharge_cell_voltage: Option<CurveTable>,
    pub charge_temperature: Option<CurveTable>,
    pub discharge_temperature: Option<CurveTable>,
    pub charge_mosfet_temperature: Option<CurveTable>,
    pub discharge_mosfet_temperature: Option<CurveTable>,
    pub charge_soc: Option<CurveTable>,
    pub discharge_soc: Option<CurveTable>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_charge_current: 50.0,
            max_discharge_current: 60.0,
            linear: false,
            charge_cell_voltage: Some(CurveTable::new(
                &[3.55, 3.50, 3.45, 3.30],
                &[0.0, 0.05, 0.5, 1.0],
            )),
            discharge_cell_voltage: Some(CurveTable::new(
                &[2.70, 2.80, 2.90, 3.10],
                &[0.0, 0.1, 0.5, 1.0],
            )),
            charge_temperature: Some(CurveTable::new(
                &[0.0, 2.0, 5.0, 10.0, 15.0, 20.0, 35.0, 40.0, 55.0],
                &[0.0, 0.1, 0.2, 0.4, 0.8, 1.0, 1.0, 0.4, 0.0],
            )),
            discharge_temperature: Some(CurveTable::new(
                &[-20.0, 0.0, 5.0, 10.0, 15.0, 45.0, 55.0],
                &[0.0, 0.2, 0.3, 0.4, 1.0, 1.0, 0.0],
            )),
            charge_mosfet_temperature: Some(CurveTable::new(&[80.0, 85.0, 90.0], &[1.0, 0.5, 0.0])),
            discharge_mosfet_temperature: Some(CurveTable::new(&[80.0, 85.0, 95.0], &[1.0, 0.5, 0.0])),
            charge_soc: None,
            discharge_soc: None,
        }
    }
}

/// Mapping from the current the BMS reports to the current actually measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentCorrectionConfig {
    pub reported_by_bms: Vec<f64>,
    pub measured_by_user: Vec<f64>,
}

/// Session driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub stale_after_secs: u64,
    pub reset_after_secs: u64,
    pub diagnostic_interval_secs: u64,
    pub reset_settle_ms: u64,
    pub connect_attempts: u32,
    pub connect_poll_interval_ms: u64,
    /// Reset the radio stack when telemetry stays stale
    pub force_reset_ble_stack: bool,
    pub mosfet_alarm_temperature: f64,
    pub cell_voltage_min: f64,
    pub cell_voltage_max: f64,
    /// Accepted vendor id prefixes; empty accepts any
    pub vendor_prefixes: Vec<String>,
    /// Model name used in the hardware version string
    pub model_name: String,
    pub current_correction: Option<CurrentCorrectionConfig>,
    pub limits: LimitsConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: STALE_AFTER_SECS,
            reset_after_secs: RESET_AFTER_SECS,
            diagnostic_interval_secs: DIAGNOSTIC_INTERVAL_SECS,
            reset_settle_ms: RESET_SETTLE.as_millis() as u64,
            connect_attempts: CONNECT_ATTEMPTS,
            connect_poll_interval_ms: CONNECT_POLL_INTERVAL.as_millis() as u64,
            force_reset_ble_stack: true,
            mosfet_alarm_temperature: MOSFET_ALARM_TEMPERATURE,
            cell_voltage_min: CELL_VOLTAGE_MIN,
            cell_voltage_max: CELL_VOLTAGE_MAX,
            vendor_prefixes: Vec::new(),
            model_name: "BMS".to_string(),
            current_correction: None,
            limits: LimitsConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn connect_poll_interval(&self) -> Duration {
        Duration::from_millis(self.connect_poll_interval_ms)
    }

    /// Whether `vendor_id` is accepted by the configured prefixes.
    pub fn accepts_vendor(&self, vendor_id: &str) -> bool {
        self.vendor_prefixes.is_empty()
            || self.vendor_prefixes.iter().any(|p| vendor_id.starts_with(p.as_str()))
    }

    /// Check thresholds and build every curve once.
    ///
    /// Any error here is a misconfiguration the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.stale_after_secs == 0 || self.diagnostic_interval_secs == 0 {
            return Err(BmsError::domain("staleness thresholds must be positive"));
        }
        if self.reset_after_secs < self.stale_after_secs {
            return Err(BmsError::domain(format!(
                "reset_after_secs ({}) is below stale_after_secs ({})",
                self.reset_after_secs, self.stale_after_secs
            )));
        }
        if self.connect_attempts == 0 {
            return Err(BmsError::domain("connect_attempts must be at least 1"));
        }
        if self.cell_voltage_min >= self.cell_voltage_max {
            return Err(BmsError::domain(format!(
                "cell voltage window ({}, {}) is empty",
                self.cell_voltage_min, self.cell_voltage_max
            )));
        }
        self.current_limiter()?;
        self.current_correction()?;
        Ok(())
    }

    pub fn current_limiter(&self) -> Result<CurrentLimiter> {
        CurrentLimiter::from_config(&self.limits)
    }

    /// `None` when no correction is configured or both lists are equal.
    pub fn current_correction(&self) -> Result<Option<CurrentCorrection>> {
        match &self.current_correction {
            Some(cfg) if cfg.reported_by_bms != cfg.measured_by_user => {
                CurrentCorrection::new(cfg.reported_by_bms.clone(), cfg.measured_by_user.clone()).map(Some)
            }
            _ => Ok(None),
        }
    }
}
