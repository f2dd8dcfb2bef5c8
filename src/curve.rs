//! Piecewise control curves.
//!
//! Free functions evaluate setpoint/output tables directly; [`Curve`] is the
//! validated, configuration-owned form used by the current limiter and the
//! current correction. Tables may be ascending or descending. Outside the
//! setpoint range every evaluation returns the nearest edge output, so a
//! curve always yields a bounded value even when telemetry leaves the
//! configured envelope.

use crate::error::{BmsError, Result};

/// Bound `value` to `[lo, hi]`, swapping inverted bounds first.
pub fn clamp(value: f64, lo: f64, hi: f64) -> f64 {
    let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };
    value.max(lo).min(hi)
}

/// Affine map of `value` from `[in_lo, in_hi]` onto `[out_lo, out_hi]`.
///
/// Fails with [`BmsError::Domain`] when the input span is zero.
pub fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> Result<f64> {
    let span = in_hi - in_lo;
    if span == 0.0 || !span.is_finite() {
        return Err(BmsError::domain(format!(
            "degenerate input range [{in_lo}, {in_hi}]"
        )));
    }
    Ok(out_lo + ((value - in_lo) / span) * (out_hi - out_lo))
}

/// [`remap`] bounded to the output range.
pub fn remap_clamped(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> Result<f64> {
    Ok(clamp(remap(value, in_lo, in_hi, out_lo, out_hi)?, out_lo, out_hi))
}

/// Linear interpolation over the table `xs` -> `ys`.
pub fn interpolate_linear(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64> {
    let table = Table::new(xs, ys)?;
    if x.is_nan() {
        return Err(BmsError::domain("cannot evaluate a curve at NaN"));
    }
    if let Some(edge) = table.edge(x) {
        return Ok(edge);
    }

    let idx = table.upper_bound(x);
    remap_clamped(
        x,
        table.x(idx - 1),
        table.x(idx),
        table.y(idx - 1),
        table.y(idx),
    )
}

/// Step lookup over the table `xs` -> `ys`.
///
/// Inside an open interval the output of the upper setpoint is returned, or
/// the lower one when `prefer_lower` is set. An exact setpoint returns its own
/// output either way.
pub fn lookup_step(x: f64, xs: &[f64], ys: &[f64], prefer_lower: bool) -> Result<f64> {
    let table = Table::new(xs, ys)?;
    if x.is_nan() {
        return Err(BmsError::domain("cannot evaluate a curve at NaN"));
    }
    if let Some(edge) = table.edge(x) {
        return Ok(edge);
    }

    let idx = table.upper_bound(x);
    if table.x(idx - 1) == x {
        return Ok(table.y(idx - 1));
    }
    Ok(if prefer_lower {
        table.y(idx - 1)
    } else {
        table.y(idx)
    })
}

/// Ascending view over a caller table, reversing descending input by index.
struct Table<'a> {
    xs: &'a [f64],
    ys: &'a [f64],
    reversed: bool,
}

impl<'a> Table<'a> {
    fn new(xs: &'a [f64], ys: &'a [f64]) -> Result<Self> {
        if xs.len() != ys.len() {
            return Err(BmsError::domain(format!(
                "setpoints ({}) and outputs ({}) differ in length",
                xs.len(),
                ys.len()
            )));
        }
        if xs.len() < 2 {
            return Err(BmsError::domain("a curve needs at least two setpoints"));
        }
        if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
            return Err(BmsError::domain("curve contains a non-finite value"));
        }
        let reversed = xs[0] > xs[xs.len() - 1];
        Ok(Self { xs, ys, reversed })
    }

    fn len(&self) -> usize {
        self.xs.len()
    }

    fn index(&self, i: usize) -> usize {
        if self.reversed {
            self.len() - 1 - i
        } else {
            i
        }
    }

    fn x(&self, i: usize) -> f64 {
        self.xs[self.index(i)]
    }

    fn y(&self, i: usize) -> f64 {
        self.ys[self.index(i)]
    }

    /// Flat extrapolation at both ends.
    fn edge(&self, x: f64) -> Option<f64> {
        if x <= self.x(0) {
            Some(self.y(0))
        } else if x >= self.x(self.len() - 1) {
            Some(self.y(self.len() - 1))
        } else {
            None
        }
    }

    /// Insertion position of `x` after any equal setpoints.
    fn upper_bound(&self, x: f64) -> usize {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.x(mid) <= x {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}

/// A validated setpoint/output table, stored ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    setpoints: Vec<f64>,
    outputs: Vec<f64>,
}

impl Curve {
    /// Build a curve from strictly monotonic setpoints in either direction.
    pub fn new(setpoints: Vec<f64>, outputs: Vec<f64>) -> Result<Self> {
        let mut setpoints = setpoints;
        let mut outputs = outputs;
        Table::new(&setpoints, &outputs)?;

        if setpoints[0] > setpoints[setpoints.len() - 1] {
            setpoints.reverse();
            outputs.reverse();
        }
        if let Some(pair) = setpoints.windows(2).find(|w| w[0] >= w[1]) {
            return Err(BmsError::domain(format!(
                "setpoints are not strictly monotonic at {} -> {}",
                pair[0], pair[1]
            )));
        }

        Ok(Self { setpoints, outputs })
    }

    /// Build a curve whose outputs are fractions of `max`.
    pub fn from_fractions(setpoints: Vec<f64>, fractions: &[f64], max: f64) -> Result<Self> {
        Self::new(setpoints, fractions.iter().map(|f| f * max).collect())
    }

    pub fn setpoints(&self) -> &[f64] {
        &self.setpoints
    }

    pub fn outputs(&self) -> &[f64] {
        &self.outputs
    }

    /// Evaluate by linear interpolation.
    pub fn linear(&self, x: f64) -> Result<f64> {
        interpolate_linear(x, &self.setpoints, &self.outputs)
    }

    /// Evaluate by step lookup.
    pub fn step(&self, x: f64, prefer_lower: bool) -> Result<f64> {
        lookup_step(x, &self.setpoints, &self.outputs, prefer_lower)
    }
}
