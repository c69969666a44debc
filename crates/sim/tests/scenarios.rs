//! End-to-end runs against the simulated machine.

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use fabrik_protocol::{Phase, Response};
use fabrik_selftest::hal::HeaterId;
use fabrik_selftest::orchestrator::TICK_PERIOD_MS;
use fabrik_selftest::{Bridge, Selftest, State, TestMask, TestResult};
use fabrik_sim::harness::Harness;
use fabrik_sim::machine_config;
use fabrik_sim::simulator::{Machine, SimConfig};

fn run(
    machine: &mut Machine,
    config: &mut SimConfig,
    selftest: &mut Selftest<'_>,
    bridge: &Bridge<NoopRawMutex>,
    max_ticks: u32,
) {
    let mut harness = Harness::new();
    for _ in 0..max_ticks {
        machine.advance(TICK_PERIOD_MS);
        harness.react(machine, bridge);
        let mut periph = machine.peripherals(config);
        selftest.tick(&mut periph, bridge);
        if !selftest.is_in_progress() {
            return;
        }
    }
    panic!("selftest did not settle in {} ticks", max_ticks);
}

#[test]
fn full_wizard_passes_on_a_healthy_machine() {
    let cfg = machine_config();
    let mut machine = Machine::new();
    let mut config = SimConfig::new();
    let bridge = Bridge::new();
    let mut selftest = Selftest::new(&cfg);

    selftest.start(TestMask::ALL);
    run(&mut machine, &mut config, &mut selftest, &bridge, 50_000);

    assert_eq!(selftest.state(), State::Finished);
    assert!(config.record.all_passed(), "record: {:?}", config.record);
    // the measured travel, not the nominal one, ends up stored
    assert_eq!(config.axis_length_mm, Machine::TRUE_LENGTH_MM);
    assert!(config.heater_gain_c_per_s[0] > 0.0);
    assert!(config.heater_gain_c_per_s[1] > 0.0);
    assert!(!config.run_wizard);
}

#[test]
fn broken_nozzle_fails_only_the_nozzle() {
    let cfg = machine_config();
    let mut machine = Machine::new();
    machine.thermal.broken[HeaterId::Nozzle as usize] = true;
    let mut config = SimConfig::new();
    let bridge = Bridge::new();
    let mut selftest = Selftest::new(&cfg);

    selftest.start(TestMask::HEATERS);
    run(&mut machine, &mut config, &mut selftest, &bridge, 10_000);

    assert_eq!(selftest.state(), State::Finished);
    assert_eq!(config.record.nozzle, TestResult::Failed);
    assert_eq!(config.record.bed, TestResult::Passed);
    // no characterization is recorded for the heater that failed
    assert_eq!(config.heater_gain_c_per_s[0], 0.0);
    assert!(config.heater_gain_c_per_s[1] > 0.0);
    assert!(config.run_wizard);
}

#[test]
fn dock_check_runs_every_commanded_cycle() {
    let cfg = machine_config();
    let mut machine = Machine::new();
    let mut config = SimConfig::new();
    let bridge = Bridge::new();
    let mut selftest = Selftest::new(&cfg);

    selftest.start(TestMask::DOCK);
    run(&mut machine, &mut config, &mut selftest, &bridge, 10_000);

    assert_eq!(selftest.state(), State::Finished);
    assert_eq!(config.record.dock, TestResult::Passed);
    assert_eq!(machine.toolchanger.park_count, cfg.dock.num_cycles as u32);
    assert_eq!(machine.toolchanger.pick_count, cfg.dock.num_cycles as u32);
}

#[test]
fn misaligned_dock_fails_without_terminating() {
    let cfg = machine_config();
    let mut machine = Machine::new();
    // over tolerance but under the fatal bound
    machine.toolchanger.offset_mm = (2.0, 0.0);
    let mut config = SimConfig::new();
    let bridge = Bridge::new();
    let mut selftest = Selftest::new(&cfg);

    selftest.start(TestMask::DOCK);
    run(&mut machine, &mut config, &mut selftest, &bridge, 10_000);

    assert_eq!(selftest.state(), State::Finished);
    assert_eq!(config.record.dock, TestResult::Failed);
    assert_eq!(selftest.fatal_fault(), None);
}

#[test]
fn external_abort_with_both_heaters_live_settles_cleanly() {
    let cfg = machine_config();
    let mut machine = Machine::new();
    let mut config = SimConfig::new();
    let bridge = Bridge::new();
    let mut selftest = Selftest::new(&cfg);
    let mut harness = Harness::new();

    selftest.start(TestMask::HEATERS);
    for _ in 0..1_000 {
        machine.advance(TICK_PERIOD_MS);
        harness.react(&mut machine, &bridge);
        let mut periph = machine.peripherals(&mut config);
        selftest.tick(&mut periph, &bridge);
        if selftest.state() == State::Heaters {
            break;
        }
    }
    assert_eq!(selftest.state(), State::Heaters);
    // a few more dispatches so both procedures are underway
    for _ in 0..10 {
        machine.advance(TICK_PERIOD_MS);
        let mut periph = machine.peripherals(&mut config);
        selftest.tick(&mut periph, &bridge);
    }

    {
        let mut periph = machine.peripherals(&mut config);
        selftest.abort(&mut periph);
    }
    assert!(selftest.is_aborted());
    assert_eq!(config.record.nozzle, TestResult::Skipped);
    assert_eq!(config.record.bed, TestResult::Skipped);
    assert_eq!(machine.thermal.target_c, [0.0, 0.0]);

    // once torn down, further ticks change nothing
    let record = config.record;
    machine.advance(TICK_PERIOD_MS);
    let mut periph = machine.peripherals(&mut config);
    selftest.tick(&mut periph, &bridge);
    assert!(selftest.is_aborted());
    assert_eq!(config.record, record);
}

#[test]
fn user_abort_during_homing_skips_the_axis() {
    let cfg = machine_config();
    let mut machine = Machine::new();
    let mut config = SimConfig::new();
    let bridge = Bridge::new();
    let mut selftest = Selftest::new(&cfg);

    selftest.start(TestMask::XAXIS);
    bridge.respond(Phase::AxisHome, Response::Abort);
    run(&mut machine, &mut config, &mut selftest, &bridge, 1_000);

    assert!(selftest.is_aborted());
    assert_eq!(config.record.xaxis, TestResult::Skipped);
    // teardown releases the motors
    assert!(!machine.motion.steppers_enabled);
}
