//! BLE session driver.
//!
//! Owns one physical BMS connection: starts and stops the notification
//! listener, watches snapshot age, escalates to a radio stack reset when
//! telemetry stays stale, and projects fresh snapshots into [`Telemetry`].
//!
//! ```text
//! Idle -> Connecting -> Connected <-> Stale -> Resetting -> Connecting ...
//!                                   any state -> Stopped (disconnect)
//! ```
//!
//! The driver is polled from a single thread; only the snapshot slot behind
//! the [`Accumulator`] is shared with the listener.

use crate::config::DriverConfig;
use crate::constants::SUMMARY_LOG_INTERVAL_SECS;
use crate::error::{BmsError, Result};
use crate::limits::{CurrentCorrection, CurrentLimiter};
use crate::protection::ProtectionState;
use crate::snapshot::{DeviceSettings, SwitchStates, TelemetrySnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Vendor notification listener and decoder.
pub trait Accumulator {
    /// Start (or restart) scraping notifications in the background.
    fn start_listening(&mut self) -> Result<()>;

    /// Stop the background listener.
    fn stop_listening(&mut self);

    /// Latest decoded snapshot, possibly stale.
    fn latest_snapshot(&self) -> Option<TelemetrySnapshot>;

    /// Settings block, once the device has sent it.
    fn device_settings(&self) -> Option<DeviceSettings>;

    fn is_link_connected(&self) -> bool;
}

/// Host radio integration used for recovery.
pub trait RadioStack {
    /// Restart the radio hardware and its driver. Blocking.
    fn reset_radio_stack(&mut self) -> Result<()>;

    /// Link details (RSSI, pairing, ...) for the log.
    fn query_link_diagnostics(&mut self, identifier: &str) -> Result<String>;
}

/// Monotonic time source.
pub trait Clock {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Stale,
    Resetting,
    Stopped,
}

impl ConnectionState {
    /// Link was established and has not been torn down.
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Stale)
    }
}

/// Whether the current stale episode may still trigger a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetGuard {
    Armed,
    /// A reset was issued; cleared by the next fresh snapshot
    Tripped,
}

/// Overvoltage setpoints as first read from the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OvpSetpoints {
    pub ovp: f64,
    pub ovpr: f64,
}

/// One physical cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Cell {
    /// Last accepted voltage in V
    pub voltage: Option<f64>,
    pub balancing: bool,
}

/// Normalized view of the pack, updated on every fresh refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Telemetry {
    pub cells: Vec<Cell>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub soc: Option<f64>,
    pub temperature_mos: Option<f64>,
    pub temperature_1: Option<f64>,
    pub temperature_2: Option<f64>,
    pub balancing: bool,
    pub balancing_current: Option<f64>,
    pub cycle_count: Option<u32>,
    pub switches: SwitchStates,
    pub protection: ProtectionState,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Telemetry {
    pub fn min_cell_voltage(&self) -> Option<f64> {
        self.cells.iter().filter_map(|c| c.voltage).reduce(f64::min)
    }

    pub fn max_cell_voltage(&self) -> Option<f64> {
        self.cells.iter().filter_map(|c| c.voltage).reduce(f64::max)
    }

    /// Lowest auxiliary sensor temperature
    pub fn min_temperature(&self) -> Option<f64> {
        [self.temperature_1, self.temperature_2].into_iter().flatten().reduce(f64::min)
    }

    /// Highest auxiliary sensor temperature
    pub fn max_temperature(&self) -> Option<f64> {
        [self.temperature_1, self.temperature_2].into_iter().flatten().reduce(f64::max)
    }
}

/// Session driver for one BLE-attached BMS.
pub struct BleSessionDriver<A, R, C = SystemClock> {
    address: String,
    accumulator: A,
    radio: R,
    clock: C,
    config: DriverConfig,
    limiter: CurrentLimiter,
    correction: Option<CurrentCorrection>,
    state: ConnectionState,
    reset_guard: ResetGuard,
    resets: u32,
    settings: Option<DeviceSettings>,
    initial_ovp: Option<OvpSetpoints>,
    telemetry: Telemetry,
    last_summary: Option<i64>,
}

impl<A: Accumulator, R: RadioStack> BleSessionDriver<A, R, SystemClock> {
    pub fn with_system_clock(address: &str, accumulator: A, radio: R, config: DriverConfig) -> Result<Self> {
        Self::new(address, accumulator, radio, SystemClock, config)
    }
}

impl<A: Accumulator, R: RadioStack, C: Clock> BleSessionDriver<A, R, C> {
    /// Create an idle session. Fails only on an unusable configuration.
    pub fn new(address: &str, accumulator: A, radio: R, clock: C, config: DriverConfig) -> Result<Self> {
        config.validate()?;
        let limiter = config.current_limiter()?;
        let correction = config.current_correction()?;
        log::info!("Init of BLE session at {}", address);

        Ok(Self {
            address: address.to_string(),
            accumulator,
            radio,
            clock,
            config,
            limiter,
            correction,
            state: ConnectionState::Idle,
            reset_guard: ResetGuard::Armed,
            resets: 0,
            settings: None,
            initial_ovp: None,
            telemetry: Telemetry::default(),
            last_summary: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reset_guard(&self) -> ResetGuard {
        self.reset_guard
    }

    /// Radio stack resets issued over the lifetime of the session
    pub fn resets(&self) -> u32 {
        self.resets
    }

    pub fn cells(&self) -> &[Cell] {
        &self.telemetry.cells
    }

    pub fn protection(&self) -> &ProtectionState {
        &self.telemetry.protection
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn settings(&self) -> Option<&DeviceSettings> {
        self.settings.as_ref()
    }

    pub fn initial_ovp(&self) -> Option<OvpSetpoints> {
        self.initial_ovp
    }

    pub fn accumulator(&self) -> &A {
        &self.accumulator
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn connection_name(&self) -> String {
        format!("BLE {}", self.address)
    }

    /// Address without separators, lower case.
    pub fn unique_identifier(&self) -> String {
        self.address.replace(':', "").to_lowercase()
    }

    pub fn hardware_version(&self) -> Option<String> {
        self.settings
            .as_ref()
            .map(|s| s.hardware_version(&self.config.model_name))
    }

    /// Charge current limit for the latest telemetry.
    ///
    /// Bounded by the device's own maximum charge current once settings have
    /// been read.
    pub fn charge_limit(&self) -> Option<f64> {
        let device_max = self.settings.as_ref().map(|s| s.max_charge_current);
        self.limiter
            .charge_limit(&self.telemetry)
            .map(|limit| cap(limit, device_max))
            .map_err(|e| log::error!("{}: charge limit: {}", self.address, e))
            .ok()
    }

    /// Discharge current limit for the latest telemetry, bounded like
    /// [`charge_limit`](Self::charge_limit).
    pub fn discharge_limit(&self) -> Option<f64> {
        let device_max = self.settings.as_ref().map(|s| s.max_discharge_current);
        self.limiter
            .discharge_limit(&self.telemetry)
            .map(|limit| cap(limit, device_max))
            .map_err(|e| log::error!("{}: discharge limit: {}", self.address, e))
            .ok()
    }

    /// Start scraping and wait for the first usable snapshot.
    ///
    /// Returns immediately when the link is already established. On failure
    /// the listener is stopped again and the session is left idle; calling
    /// again later is the caller's decision.
    pub fn connect(&mut self) -> bool {
        if self.state.is_established() {
            return true;
        }
        if self.state == ConnectionState::Stopped {
            log::warn!("{}: connect on a stopped session", self.address);
            return false;
        }

        match self.try_connect() {
            Ok(()) => {
                log::info!("{}: connected", self.connection_name());
                true
            }
            Err(e) => {
                log::error!("{}: connect failed: {}", self.address, e);
                self.accumulator.stop_listening();
                self.state = ConnectionState::Idle;
                false
            }
        }
    }

    fn try_connect(&mut self) -> Result<()> {
        self.state = ConnectionState::Connecting;
        self.accumulator.start_listening()?;
        self.wait_for_first_snapshot()?;

        let settings = self.read_settings()?;
        if !self.config.accepts_vendor(&settings.vendor_id) {
            return Err(BmsError::UnsupportedVendor(settings.vendor_id));
        }

        self.refresh_inner()
    }

    fn wait_for_first_snapshot(&mut self) -> Result<()> {
        let attempts = self.config.connect_attempts;
        for attempt in 1..=attempts {
            let linked = self.accumulator.is_link_connected();
            let has_snapshot = self.accumulator.latest_snapshot().is_some();
            if linked && has_snapshot {
                return Ok(());
            }
            log::debug!(
                "{}: waiting for link (attempt {}/{}, linked: {}, snapshot: {})",
                self.address,
                attempt,
                attempts,
                linked,
                has_snapshot
            );
            self.clock.sleep(self.config.connect_poll_interval());
        }

        if self.accumulator.device_settings().is_none() {
            log::info!("   |- Settings MISSING");
        }
        Err(BmsError::ConnectTimeout { attempts })
    }

    /// Read the settings block and size the cell table.
    ///
    /// The cell count is fixed by the first successful read.
    pub fn read_settings(&mut self) -> Result<DeviceSettings> {
        let settings = self.accumulator.device_settings().ok_or(BmsError::MissingSettings)?;

        if let Some(existing) = &self.settings {
            if existing.cell_count != settings.cell_count {
                return Err(BmsError::CellCountChanged {
                    expected: existing.cell_count,
                    actual: settings.cell_count,
                });
            }
        }
        if self.telemetry.cells.is_empty() {
            self.telemetry.cells = vec![Cell::default(); settings.cell_count];
        }
        if self.initial_ovp.is_none() {
            self.initial_ovp = Some(OvpSetpoints {
                ovp: settings.cell_ovp,
                ovpr: settings.cell_ovpr,
            });
        }

        log::debug!("BAT: {}", settings.hardware_version(&self.config.model_name));
        self.settings = Some(settings.clone());
        Ok(settings)
    }

    /// Evaluate the latest snapshot once; `false` means no update this cycle.
    pub fn refresh(&mut self) -> bool {
        match self.refresh_inner() {
            Ok(()) => true,
            Err(e @ BmsError::StaleTelemetry { .. }) | Err(e @ BmsError::NoTelemetry) => {
                log::debug!("{}: no update ({:?}): {}", self.address, self.state, e);
                false
            }
            Err(e) => {
                log::error!("{}: refresh failed: {}", self.address, e);
                false
            }
        }
    }

    fn refresh_inner(&mut self) -> Result<()> {
        if self.state == ConnectionState::Stopped {
            return Err(BmsError::Stopped);
        }
        let snapshot = self.accumulator.latest_snapshot().ok_or(BmsError::NoTelemetry)?;

        let age_secs = self
            .clock
            .now()
            .saturating_duration_since(snapshot.last_update)
            .as_secs();
        if age_secs >= self.config.stale_after_secs {
            self.handle_stale(age_secs);
            return Err(BmsError::StaleTelemetry { age_secs });
        }

        let projection = self.prepare(&snapshot)?;

        if self.reset_guard == ResetGuard::Tripped {
            log::info!("{}: fresh data after reset", self.address);
        }
        self.reset_guard = ResetGuard::Armed;
        self.state = ConnectionState::Connected;
        self.project(&snapshot, projection, age_secs);
        Ok(())
    }

    /// Everything about a snapshot that can fail, computed before any state
    /// is touched.
    fn prepare(&mut self, snapshot: &TelemetrySnapshot) -> Result<Projection> {
        let cell_ovp = match self.settings.as_ref().map(|s| s.cell_ovp) {
            Some(ovp) => ovp,
            None => self.read_settings()?.cell_ovp,
        };
        let current = match &self.correction {
            Some(correction) => correction.apply(snapshot.current)?,
            None => snapshot.current,
        };
        if !current.is_finite() {
            return Err(BmsError::domain(format!("non-finite current {current}")));
        }
        Ok(Projection { cell_ovp, current })
    }

    fn handle_stale(&mut self, age_secs: u64) {
        self.state = ConnectionState::Stale;

        if age_secs % self.config.diagnostic_interval_secs == 0 {
            log::info!(
                "{}: Bluetooth connection interrupted. Got no fresh data since {} s.",
                self.address,
                age_secs
            );
            match self.radio.query_link_diagnostics(&self.address) {
                Ok(info) => log::info!("{}", info),
                Err(e) => log::warn!("{}: link diagnostics unavailable: {}", self.address, e),
            }
        }

        if age_secs >= self.config.reset_after_secs
            && self.config.force_reset_ble_stack
            && self.reset_guard == ResetGuard::Armed
        {
            self.recover();
        }
    }

    fn recover(&mut self) {
        log::error!("{}: Bluetooth died. Restarting Bluetooth system driver.", self.address);
        self.state = ConnectionState::Resetting;
        self.reset_guard = ResetGuard::Tripped;
        self.resets += 1;

        if let Err(e) = self.radio.reset_radio_stack() {
            log::error!("{}: radio stack reset failed: {}", self.address, e);
        }
        self.clock.sleep(self.config.reset_settle());
        if let Err(e) = self.accumulator.start_listening() {
            log::error!("{}: restart of scraping failed: {}", self.address, e);
        }
        self.clock.sleep(self.config.reset_settle());

        self.state = ConnectionState::Connecting;
    }

    fn project(&mut self, snapshot: &TelemetrySnapshot, projection: Projection, age_secs: u64) {
        let Projection { cell_ovp, current } = projection;

        for (i, cell) in self.telemetry.cells.iter_mut().enumerate() {
            match snapshot.cell_voltages.get(i) {
                Some(&v) if v > self.config.cell_voltage_min && v < self.config.cell_voltage_max => {
                    cell.voltage = Some(v);
                }
                Some(&v) => log::warn!("{}", BmsError::OutOfRangeReading { cell: i, voltage: v }),
                None => log::warn!("Cell {} missing from snapshot", i),
            }
            cell.balancing = snapshot.balancing_active
                && (snapshot.min_voltage_cell_index == i || snapshot.max_voltage_cell_index == i);
        }

        let t = &mut self.telemetry;
        t.current = Some(round_to(current, 1));
        t.voltage = Some(round_to(snapshot.total_voltage, 2));
        t.soc = Some(snapshot.soc);
        t.temperature_mos = Some(snapshot.temperature_mos_celsius());
        t.temperature_1 = Some(snapshot.temperature_1_celsius());
        t.temperature_2 = Some(snapshot.temperature_2_celsius());
        t.balancing = snapshot.balancing_active;
        t.balancing_current = Some(snapshot.balancing_current_amps());
        t.cycle_count = Some(snapshot.cycle_count);
        t.switches = snapshot.switch_states;
        t.protection = ProtectionState::evaluate(snapshot, cell_ovp, self.config.mosfet_alarm_temperature);

        let now = Utc::now();
        t.updated_at = Some(now);
        self.log_summary(now, age_secs);
    }

    fn log_summary(&mut self, now: DateTime<Utc>, age_secs: u64) {
        let second = now.timestamp();
        if second % SUMMARY_LOG_INTERVAL_SECS != 0 || self.last_summary == Some(second) {
            return;
        }
        self.last_summary = Some(second);

        let t = &self.telemetry;
        let voltages: Vec<f64> = t
            .cells
            .iter()
            .filter_map(|c| c.voltage)
            .map(|v| round_to(v, 3))
            .collect();
        log::debug!(
            "current: {:?} - voltage: {:?} - temp MOS: {:?} - temp1: {:?} - temp2: {:?} - last update: {}s - cell voltages: {:?}",
            t.current,
            t.voltage,
            t.temperature_mos,
            t.temperature_1,
            t.temperature_2,
            age_secs,
            voltages
        );
    }

    /// Stop the listener and end the session. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.accumulator.stop_listening();
        if self.state != ConnectionState::Stopped {
            log::info!("{}: disconnected", self.connection_name());
        }
        self.state = ConnectionState::Stopped;
    }
}

/// Validated per-snapshot inputs of a projection.
struct Projection {
    cell_ovp: f64,
    current: f64,
}

/// Bound `limit` by a device maximum; negative maxima are ignored.
fn cap(limit: f64, device_max: Option<f64>) -> f64 {
    match device_max {
        Some(max) if max >= 0.0 => limit.min(max),
        _ => limit,
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
