//! Inert hardware stand-ins for driver and orchestrator tests. The
//! full-behaviour simulator lives in the sim crate; these only hold
//! whatever value a test pokes into them.

use core::cell::Cell;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;

use crate::bridge::Bridge;
use crate::hal::{
    AxisId, Clock, Config, FanId, Fans, FilamentSensor, FilamentState, HeaterId, Loadcell, Motion,
    Peripherals, Thermal, ToolChanger,
};
use crate::record::SelftestRecord;

pub struct TestClock {
    ms: Cell<u32>,
}

impl TestClock {
    pub fn advance(&self, ms: u32) {
        self.ms.set(self.ms.get().wrapping_add(ms));
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u32 {
        self.ms.get()
    }
}

pub struct NullMotion {
    pub drained: bool,
    pub position: [f32; 3],
}

impl Motion for NullMotion {
    fn home(&mut self, _axis: AxisId) {}

    fn move_to(&mut self, axis: AxisId, target_mm: f32, _feedrate_mm_s: f32) {
        self.position[axis.index()] = target_mm;
    }

    fn position_mm(&self, axis: AxisId) -> f32 {
        self.position[axis.index()]
    }

    fn queue_drained(&self) -> bool {
        self.drained
    }

    fn disable_steppers(&mut self) {}
}

pub struct NullThermal {
    pub temp: [f32; 2],
    pub target: [f32; 2],
}

impl Thermal for NullThermal {
    fn temperature_c(&self, heater: HeaterId) -> f32 {
        self.temp[heater as usize]
    }

    fn set_target_c(&mut self, heater: HeaterId, target: f32) {
        self.target[heater as usize] = target;
    }
}

pub struct NullFans {
    pub pwm: [u8; 2],
    pub rpm: [u16; 2],
    pub auto_restored: bool,
}

impl Fans for NullFans {
    fn set_pwm(&mut self, fan: FanId, pwm: u8) {
        self.pwm[fan as usize] = pwm;
        self.auto_restored = false;
    }

    fn rpm(&self, fan: FanId) -> u16 {
        self.rpm[fan as usize]
    }

    fn restore_auto(&mut self) {
        self.auto_restored = true;
    }
}

pub struct NullLoadcell {
    pub load: i32,
}

impl Loadcell for NullLoadcell {
    fn load_g(&self) -> i32 {
        self.load
    }

    fn tare(&mut self) {
        self.load = 0;
    }
}

pub struct NullFsensor {
    pub state: FilamentState,
    pub calibrated: bool,
    pub invalidated: bool,
}

impl FilamentSensor for NullFsensor {
    fn state(&self) -> FilamentState {
        self.state
    }

    fn request_calibration(&mut self, _with_filament: bool) {
        self.calibrated = true;
    }

    fn calibration_finished(&self) -> bool {
        self.calibrated
    }

    fn invalidate_calibration(&mut self) {
        self.invalidated = true;
    }

    fn unload(&mut self) {}

    fn unload_active(&self) -> bool {
        false
    }
}

pub struct NullToolchanger {
    pub docked: bool,
    pub offset: (f32, f32),
}

impl ToolChanger for NullToolchanger {
    fn park(&mut self) {
        self.docked = true;
    }

    fn pick(&mut self) {
        self.docked = false;
    }

    fn docked(&self) -> bool {
        self.docked
    }

    fn dock_offset_mm(&self) -> (f32, f32) {
        self.offset
    }
}

pub struct MemConfig {
    pub record: SelftestRecord,
    pub axis_length: [f32; 3],
    pub heater_gain: [f32; 2],
    pub run_wizard: bool,
}

impl Config for MemConfig {
    fn selftest_record(&self) -> SelftestRecord {
        self.record
    }

    fn set_selftest_record(&mut self, record: SelftestRecord) {
        self.record = record;
    }

    fn set_axis_length(&mut self, axis: AxisId, length_mm: f32) {
        self.axis_length[axis.index()] = length_mm;
    }

    fn set_heater_gain(&mut self, heater: HeaterId, rise_c_per_s: f32) {
        self.heater_gain[heater as usize] = rise_c_per_s;
    }

    fn run_wizard(&self) -> bool {
        self.run_wizard
    }

    fn set_run_wizard(&mut self, run: bool) {
        self.run_wizard = run;
    }
}

pub struct Fixture {
    pub clock: TestClock,
    pub bridge: Bridge<NoopRawMutex>,
    pub motion: NullMotion,
    pub thermal: NullThermal,
    pub fans: NullFans,
    pub loadcell: NullLoadcell,
    pub fsensor: NullFsensor,
    pub toolchanger: NullToolchanger,
    pub config: MemConfig,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture {
            clock: TestClock { ms: Cell::new(0) },
            bridge: Bridge::new(),
            motion: NullMotion {
                drained: true,
                position: [0.0; 3],
            },
            thermal: NullThermal {
                temp: [25.0; 2],
                target: [0.0; 2],
            },
            fans: NullFans {
                pwm: [0; 2],
                rpm: [0; 2],
                auto_restored: true,
            },
            loadcell: NullLoadcell { load: 0 },
            fsensor: NullFsensor {
                state: FilamentState::NoFilament,
                calibrated: false,
                invalidated: false,
            },
            toolchanger: NullToolchanger {
                docked: true,
                offset: (0.0, 0.0),
            },
            config: MemConfig {
                record: SelftestRecord::default(),
                axis_length: [0.0; 3],
                heater_gain: [0.0; 2],
                run_wizard: true,
            },
        }
    }

    /// Splits the fixture into a [`Peripherals`] view plus the bridge,
    /// borrowing disjoint fields.
    pub fn split(&mut self) -> (Peripherals<'_>, &Bridge<NoopRawMutex>) {
        let Fixture {
            clock,
            bridge,
            motion,
            thermal,
            fans,
            loadcell,
            fsensor,
            toolchanger,
            config,
        } = self;
        (
            Peripherals {
                clock,
                motion,
                thermal,
                fans,
                loadcell,
                fsensor,
                toolchanger,
                config,
            },
            &*bridge,
        )
    }
}
