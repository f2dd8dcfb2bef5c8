use bms_link::session::ResetGuard;
use bms_link::{
    Accumulator, BleSessionDriver, BmsError, Clock, ConnectionState, DeviceSettings, DriverConfig,
    ProtectionLevel, RadioStack, Result, SnapshotSlot, SwitchStates, TelemetrySnapshot, Warnings,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    fn advance(&self, secs: u64) {
        self.now.set(self.now.get() + Duration::from_secs(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

struct FakeAccumulator {
    slot: SnapshotSlot,
    settings: Rc<RefCell<Option<DeviceSettings>>>,
    linked: bool,
    starts: u32,
    stops: u32,
}

impl Accumulator for FakeAccumulator {
    fn start_listening(&mut self) -> Result<()> {
        self.starts += 1;
        Ok(())
    }

    fn stop_listening(&mut self) {
        self.stops += 1;
    }

    fn latest_snapshot(&self) -> Option<TelemetrySnapshot> {
        self.slot.latest()
    }

    fn device_settings(&self) -> Option<DeviceSettings> {
        self.settings.borrow().clone()
    }

    fn is_link_connected(&self) -> bool {
        self.linked
    }
}

#[derive(Default)]
struct FakeRadio {
    resets: u32,
    diagnostics: u32,
    fail: bool,
}

impl RadioStack for FakeRadio {
    fn reset_radio_stack(&mut self) -> Result<()> {
        self.resets += 1;
        if self.fail {
            return Err(BmsError::radio("hciconfig exited with 1"));
        }
        Ok(())
    }

    fn query_link_diagnostics(&mut self, identifier: &str) -> Result<String> {
        self.diagnostics += 1;
        if self.fail {
            return Err(BmsError::radio("bluetoothctl missing"));
        }
        Ok(format!("Device {identifier} RSSI: -71"))
    }
}

type Driver = BleSessionDriver<FakeAccumulator, FakeRadio, ManualClock>;

const ADDRESS: &str = "C8:47:8C:E4:54:0E";

fn settings(cell_count: usize) -> DeviceSettings {
    DeviceSettings {
        cell_count,
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

fn snapshot(last_update: Instant, cell_voltages: &[f64]) -> TelemetrySnapshot {
    TelemetrySnapshot {
        cell_voltages: cell_voltages.to_vec(),
        total_voltage: cell_voltages.iter().sum(),
        current: 12.34,
        soc: 64.0,
        temperature_mos: 31.0,
        temperature_1: 22.0,
        temperature_2: 23.0,
        balancing_active: false,
        balancing_current: 0.0,
        min_voltage_cell_index: 0,
        max_voltage_cell_index: cell_voltages.len().saturating_sub(1),
        delta_cell_voltage: 0.03,
        warnings: Warnings::default(),
        cycle_count: 42,
        switch_states: SwitchStates {
            charging: true,
            discharging: true,
            balancing: true,
        },
        last_update,
    }
}

struct Harness {
    clock: ManualClock,
    slot: SnapshotSlot,
    settings: Rc<RefCell<Option<DeviceSettings>>>,
    driver: Driver,
}

fn harness_with(config: DriverConfig, radio: FakeRadio, linked: bool) -> Harness {
    let clock = ManualClock::new();
    let slot = SnapshotSlot::new();
    slot.publish(snapshot(clock.now(), &[3.25, 3.26, 3.27, 3.28]));
    let shared_settings = Rc::new(RefCell::new(Some(settings(4))));
    let accumulator = FakeAccumulator {
        slot: slot.clone(),
        settings: shared_settings.clone(),
        linked,
        starts: 0,
        stops: 0,
    };
    let driver = BleSessionDriver::new(ADDRESS, accumulator, radio, clock.clone(), config).unwrap();
    Harness {
        clock,
        slot,
        settings: shared_settings,
        driver,
    }
}

fn connected() -> Harness {
    let mut h = harness_with(DriverConfig::default(), FakeRadio::default(), true);
    assert!(h.driver.connect());
    h
}

#[test]
fn test_connect_populates_cells() {
    let h = connected();
    assert_eq!(h.driver.state(), ConnectionState::Connected);
    assert_eq!(h.driver.cells().len(), 4);
    assert!(h.driver.cells().iter().all(|c| c.voltage.is_some()));

    let t = h.driver.telemetry();
    assert_eq!(t.current, Some(12.3));
    assert_eq!(t.cycle_count, Some(42));
    assert!(t.updated_at.is_some());
    assert_eq!(h.driver.hardware_version().as_deref(), Some("BMS 11.XW 4S (2023-04-01)"));
    assert_eq!(h.driver.initial_ovp().map(|o| o.ovp), Some(3.65));
}

#[test]
fn test_connect_is_idempotent() {
    let mut h = connected();
    assert!(h.driver.connect());
    assert_eq!(h.driver.accumulator().starts, 1);
}

#[test]
fn test_connect_times_out_without_link() {
    let mut h = harness_with(DriverConfig::default(), FakeRadio::default(), false);
    let started = h.clock.now();

    assert!(!h.driver.connect());
    assert_eq!(h.driver.state(), ConnectionState::Idle);
    assert_eq!(h.driver.accumulator().stops, 1);
    assert_eq!(h.clock.now() - started, Duration::from_secs(10));
}

#[test]
fn test_connect_rejects_foreign_vendor() {
    let config = DriverConfig {
        vendor_prefixes: vec!["JK-".to_string()],
        ..DriverConfig::default()
    };
    let mut h = harness_with(config, FakeRadio::default(), true);
    assert!(!h.driver.connect());
    assert_eq!(h.driver.state(), ConnectionState::Idle);
}

#[test]
fn test_out_of_range_cell_keeps_last_value() {
    let mut h = connected();
    h.slot.publish(snapshot(h.clock.now(), &[3.65, 0.5, 3.65, 3.65]));

    assert!(h.driver.refresh());
    let cells = h.driver.cells();
    assert_eq!(cells[0].voltage, Some(3.65));
    assert_eq!(cells[1].voltage, Some(3.26));
    assert_eq!(cells[3].voltage, Some(3.65));
}

#[test]
fn test_balancing_marks_extreme_cells() {
    let mut h = connected();
    let mut snap = snapshot(h.clock.now(), &[3.40, 3.30, 3.35, 3.45]);
    snap.balancing_active = true;
    snap.min_voltage_cell_index = 1;
    snap.max_voltage_cell_index = 3;
    h.slot.publish(snap);

    assert!(h.driver.refresh());
    let balancing: Vec<bool> = h.driver.cells().iter().map(|c| c.balancing).collect();
    assert_eq!(balancing, vec![false, true, false, true]);
    assert!(h.driver.telemetry().balancing);
}

#[test]
fn test_protection_from_snapshot() {
    let mut h = connected();
    let mut snap = snapshot(h.clock.now(), &[3.30, 3.31, 3.32, 3.50]);
    snap.delta_cell_voltage = 0.20;
    snap.temperature_mos = 6543.5;
    snap.warnings.charge_overtemp = true;
    h.slot.publish(snap);

    assert!(h.driver.refresh());
    let protection = h.driver.protection();
    assert_eq!(protection.cell_imbalance, ProtectionLevel::Alarm);
    assert_eq!(protection.high_charge_temperature, ProtectionLevel::Alarm);
    assert_eq!(protection.mosfet_overtemp, ProtectionLevel::Normal);
    assert!((h.driver.telemetry().temperature_mos.unwrap() - -10.0).abs() < 1e-9);
}

#[test]
fn test_stale_snapshot_fails_refresh() {
    let mut h = connected();
    h.clock.advance(20);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.state(), ConnectionState::Stale);
    assert_eq!(h.driver.radio().resets, 0);
    assert_eq!(h.driver.radio().diagnostics, 0);
}

#[test]
fn test_diagnostics_every_interval() {
    let mut h = connected();
    h.clock.advance(15);
    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().diagnostics, 1);

    h.clock.advance(7);
    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().diagnostics, 1);
}

#[test]
fn test_reset_once_per_stale_episode() {
    let mut h = connected();
    h.clock.advance(31);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().resets, 1);
    assert_eq!(h.driver.resets(), 1);
    assert_eq!(h.driver.reset_guard(), ResetGuard::Tripped);
    assert_eq!(h.driver.state(), ConnectionState::Connecting);
    // scraping restarted after the reset
    assert_eq!(h.driver.accumulator().starts, 2);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().resets, 1);
    assert_eq!(h.driver.state(), ConnectionState::Stale);

    h.slot.publish(snapshot(h.clock.now(), &[3.25, 3.26, 3.27, 3.28]));
    assert!(h.driver.refresh());
    assert_eq!(h.driver.state(), ConnectionState::Connected);
    assert_eq!(h.driver.reset_guard(), ResetGuard::Armed);

    // a new stale episode may reset again
    h.clock.advance(45);
    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().resets, 2);
}

#[test]
fn test_reset_at_thirty_seconds_with_diagnostics() {
    let mut h = connected();
    h.clock.advance(30);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().diagnostics, 1);
    assert_eq!(h.driver.radio().resets, 1);
}

#[test]
fn test_failed_reset_still_reconnects() {
    let radio = FakeRadio {
        fail: true,
        ..FakeRadio::default()
    };
    let mut h = harness_with(DriverConfig::default(), radio, true);
    assert!(h.driver.connect());
    h.clock.advance(45);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().resets, 1);
    assert_eq!(h.driver.state(), ConnectionState::Connecting);
}

#[test]
fn test_reset_disabled_by_config() {
    let config = DriverConfig {
        force_reset_ble_stack: false,
        ..DriverConfig::default()
    };
    let mut h = harness_with(config, FakeRadio::default(), true);
    assert!(h.driver.connect());
    h.clock.advance(31);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.radio().resets, 0);
    assert_eq!(h.driver.state(), ConnectionState::Stale);
}

#[test]
fn test_refresh_without_snapshot() {
    let mut h = harness_with(DriverConfig::default(), FakeRadio::default(), true);
    h.slot.clear();
    assert!(!h.driver.refresh());
    assert_eq!(h.driver.state(), ConnectionState::Idle);
}

#[test]
fn test_disconnect_is_idempotent() {
    let mut h = connected();
    h.driver.disconnect();
    h.driver.disconnect();

    assert_eq!(h.driver.state(), ConnectionState::Stopped);
    assert_eq!(h.driver.accumulator().stops, 2);
    assert!(!h.driver.refresh());
    assert!(!h.driver.connect());
}

#[test]
fn test_disconnect_from_idle() {
    let mut h = harness_with(DriverConfig::default(), FakeRadio::default(), true);
    h.driver.disconnect();
    assert_eq!(h.driver.state(), ConnectionState::Stopped);
    assert_eq!(h.driver.accumulator().stops, 1);
}

#[test]
fn test_cell_count_is_fixed() {
    let mut h = connected();
    *h.settings.borrow_mut() = Some(settings(8));

    match h.driver.read_settings() {
        Err(BmsError::CellCountChanged { expected, actual }) => {
            assert_eq!(expected, 4);
            assert_eq!(actual, 8);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(h.driver.cells().len(), 4);
}

#[test]
fn test_missing_settings_fail_connect() {
    let mut h = harness_with(DriverConfig::default(), FakeRadio::default(), true);
    *h.settings.borrow_mut() = None;

    assert!(!h.driver.connect());
    assert!(matches!(h.driver.read_settings(), Err(BmsError::MissingSettings)));
}

#[test]
fn test_current_limits_follow_telemetry() {
    let h = connected();
    assert_eq!(h.driver.charge_limit(), Some(50.0));
    assert_eq!(h.driver.discharge_limit(), Some(60.0));
}

#[test]
fn test_current_limits_capped_by_device() {
    let mut h = harness_with(DriverConfig::default(), FakeRadio::default(), true);
    let mut device = settings(4);
    device.max_charge_current = 20.0;
    *h.settings.borrow_mut() = Some(device);

    assert!(h.driver.connect());
    assert_eq!(h.driver.charge_limit(), Some(20.0));
    assert_eq!(h.driver.discharge_limit(), Some(60.0));
}

#[test]
fn test_invalid_current_leaves_telemetry_untouched() {
    let mut h = connected();
    let before = h.driver.telemetry().clone();

    let mut snap = snapshot(h.clock.now(), &[3.40, 3.41, 3.42, 3.43]);
    snap.current = f64::NAN;
    h.slot.publish(snap);

    assert!(!h.driver.refresh());
    assert_eq!(h.driver.telemetry(), &before);
    assert_eq!(h.driver.cells()[0].voltage, Some(3.25));
}

#[test]
fn test_current_correction_applied() {
    let config: DriverConfig = serde_json::from_str(
        r#"{ "current_correction": { "reported_by_bms": [-100.0, 0.0, 100.0], "measured_by_user": [-100.0, 0.0, 110.0] } }"#,
    )
    .unwrap();
    let mut h = harness_with(config, FakeRadio::default(), true);
    assert!(h.driver.connect());
    // 12.34 A reported, 10% high side correction
    assert_eq!(h.driver.telemetry().current, Some(13.6));
}

#[test]
fn test_identity() {
    let h = connected();
    assert_eq!(h.driver.unique_identifier(), "c8478ce4540e");
    assert_eq!(h.driver.connection_name(), "BLE C8:47:8C:E4:54:0E");
}

#[test]
fn test_invalid_config_is_rejected() {
    let clock = ManualClock::new();
    let accumulator = FakeAccumulator {
        slot: SnapshotSlot::new(),
        settings: Rc::new(RefCell::new(None)),
        linked: true,
        starts: 0,
        stops: 0,
    };
    let mut config = DriverConfig::default();
    config.limits.charge_temperature = Some(bms_link::CurveTable::new(&[10.0], &[1.0]));

    match BleSessionDriver::new(ADDRESS, accumulator, FakeRadio::default(), clock, config) {
        Err(BmsError::Domain(_)) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("invalid curve accepted"),
    }
}
