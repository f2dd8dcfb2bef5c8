//! Charge and discharge current ceilings (CCL/DCL) from control curves.

use crate::config::{CurveTable, LimitsConfig};
use crate::curve::{clamp, Curve};
use crate::error::Result;
use crate::session::Telemetry;

/// Telemetry quantity a curve is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitInput {
    CellVoltage,
    Temperature,
    MosfetTemperature,
    Soc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Charge,
    Discharge,
}

/// How curves are evaluated between setpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurveMode {
    Linear,
    /// Take the more restrictive neighbouring setpoint
    Step,
}

/// Derives CCL/DCL as the minimum over every configured curve.
#[derive(Debug, Clone)]
pub struct CurrentLimiter {
    max_charge_current: f64,
    max_discharge_current: f64,
    mode: CurveMode,
    charge: Vec<(LimitInput, Curve)>,
    discharge: Vec<(LimitInput, Curve)>,
}

impl CurrentLimiter {
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        let build = |pairs: [(LimitInput, &Option<CurveTable>); 4], max: f64| -> Result<Vec<(LimitInput, Curve)>> {
            let mut curves = Vec::new();
            for (input, table) in pairs {
                if let Some(table) = table {
                    curves.push((
                        input,
                        Curve::from_fractions(table.setpoints.clone(), &table.fractions, max)?,
                    ));
                }
            }
            Ok(curves)
        };

        let charge = build(
            [
                (LimitInput::CellVoltage, &config.charge_cell_voltage),
                (LimitInput::Temperature, &config.charge_temperature),
                (LimitInput::MosfetTemperature, &config.charge_mosfet_temperature),
                (LimitInput::Soc, &config.charge_soc),
            ],
            config.max_charge_current,
        )?;
        let discharge = build(
            [
                (LimitInput::CellVoltage, &config.discharge_cell_voltage),
                (LimitInput::Temperature, &config.discharge_temperature),
                (LimitInput::MosfetTemperature, &config.discharge_mosfet_temperature),
                (LimitInput::Soc, &config.discharge_soc),
            ],
            config.max_discharge_current,
        )?;

        Ok(Self {
            max_charge_current: config.max_charge_current,
            max_discharge_current: config.max_discharge_current,
            mode: if config.linear { CurveMode::Linear } else { CurveMode::Step },
            charge,
            discharge,
        })
    }

    pub fn mode(&self) -> CurveMode {
        self.mode
    }

    /// Charge current limit in A.
    pub fn charge_limit(&self, telemetry: &Telemetry) -> Result<f64> {
        self.limit(Direction::Charge, telemetry)
    }

    /// Discharge current limit in A.
    pub fn discharge_limit(&self, telemetry: &Telemetry) -> Result<f64> {
        self.limit(Direction::Discharge, telemetry)
    }

    fn limit(&self, direction: Direction, telemetry: &Telemetry) -> Result<f64> {
        let (max, curves) = match direction {
            Direction::Charge => (self.max_charge_current, &self.charge),
            Direction::Discharge => (self.max_discharge_current, &self.discharge),
        };

        let mut limit = max;
        for (input, curve) in curves {
            for x in inputs(*input, direction, telemetry) {
                let value = self.evaluate(curve, x)?;
                log::trace!("{:?} {:?} at {} -> {:.1} A", direction, input, x, value);
                limit = limit.min(value);
            }
        }
        Ok(clamp(limit, 0.0, max))
    }

    fn evaluate(&self, curve: &Curve, x: f64) -> Result<f64> {
        match self.mode {
            CurveMode::Linear => curve.linear(x),
            CurveMode::Step => Ok(curve.step(x, true)?.min(curve.step(x, false)?)),
        }
    }
}

/// Values `input` takes for `direction`; empty when telemetry lacks them.
fn inputs(input: LimitInput, direction: Direction, telemetry: &Telemetry) -> Vec<f64> {
    let values = match (input, direction) {
        (LimitInput::CellVoltage, Direction::Charge) => vec![telemetry.max_cell_voltage()],
        (LimitInput::CellVoltage, Direction::Discharge) => vec![telemetry.min_cell_voltage()],
        (LimitInput::Temperature, _) => vec![telemetry.min_temperature(), telemetry.max_temperature()],
        (LimitInput::MosfetTemperature, _) => vec![telemetry.temperature_mos],
        (LimitInput::Soc, _) => vec![telemetry.soc],
    };
    values.into_iter().flatten().collect()
}

/// Linear correction of the current reported by the BMS.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentCorrection {
    curve: Curve,
}

impl CurrentCorrection {
    pub fn new(reported: Vec<f64>, measured: Vec<f64>) -> Result<Self> {
        Ok(Self {
            curve: Curve::new(reported, measured)?,
        })
    }

    pub fn apply(&self, current: f64) -> Result<f64> {
        self.curve.linear(current)
    }
}
