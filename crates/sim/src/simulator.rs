//! A crude but honest machine model: axes with travel limits, first-order
//! heaters, fans that follow their PWM, timers for tool changes and
//! filament operations. Good enough for every selftest path, including
//! the failing ones.

use fabrik_selftest::hal::{
    AxisId, Clock, Config, FanId, Fans, FilamentSensor, FilamentState, HeaterId, Loadcell, Motion,
    Peripherals, Thermal, ToolChanger,
};
use fabrik_selftest::SelftestRecord;

const AMBIENT_C: f32 = 25.0;
const HEAT_RATE_C_PER_S: f32 = 20.0;
const COOL_RATE_C_PER_S: f32 = 15.0;
const HOMING_FEEDRATE_MM_S: f32 = 40.0;
const CALIBRATION_MS: u32 = 300;
const UNLOAD_MS: u32 = 500;
const TOOLCHANGE_MS: u32 = 400;
const POSITION_EPS_MM: f32 = 0.01;

pub struct SimClock {
    now_ms: u32,
}

impl Clock for SimClock {
    fn now_ms(&self) -> u32 {
        self.now_ms
    }
}

pub struct SimAxis {
    pub position_mm: f32,
    /// Physical end of travel; commanded moves past it stall here, which
    /// is exactly what the axis length measurement relies on.
    pub limit_mm: f32,
    target_mm: f32,
    feedrate_mm_s: f32,
}

impl SimAxis {
    fn goal(&self) -> f32 {
        self.target_mm.clamp(0.0, self.limit_mm)
    }

    fn advance(&mut self, dt_s: f32) {
        let goal = self.goal();
        let step = self.feedrate_mm_s * dt_s;
        if (goal - self.position_mm).abs() <= step {
            self.position_mm = goal;
        } else if goal > self.position_mm {
            self.position_mm += step;
        } else {
            self.position_mm -= step;
        }
    }
}

pub struct SimMotion {
    pub axes: [SimAxis; 3],
    pub steppers_enabled: bool,
}

impl Motion for SimMotion {
    fn home(&mut self, axis: AxisId) {
        let axis = &mut self.axes[axis.index()];
        axis.target_mm = 0.0;
        axis.feedrate_mm_s = HOMING_FEEDRATE_MM_S;
        self.steppers_enabled = true;
    }

    fn move_to(&mut self, axis: AxisId, target_mm: f32, feedrate_mm_s: f32) {
        let axis = &mut self.axes[axis.index()];
        axis.target_mm = target_mm;
        axis.feedrate_mm_s = feedrate_mm_s;
        self.steppers_enabled = true;
    }

    fn position_mm(&self, axis: AxisId) -> f32 {
        self.axes[axis.index()].position_mm
    }

    fn queue_drained(&self) -> bool {
        self.axes
            .iter()
            .all(|a| (a.position_mm - a.goal()).abs() < POSITION_EPS_MM)
    }

    fn disable_steppers(&mut self) {
        self.steppers_enabled = false;
    }
}

pub struct SimThermal {
    pub temp_c: [f32; 2],
    pub target_c: [f32; 2],
    /// A broken heater never warms up; used by the failure scenarios.
    pub broken: [bool; 2],
}

impl SimThermal {
    fn advance(&mut self, dt_s: f32) {
        for i in 0..2 {
            // a broken heating element delivers no power at all, so the
            // temperature relaxes to ambient whatever the target says
            let target = if self.broken[i] {
                AMBIENT_C
            } else {
                self.target_c[i]
            };
            let heating = target > self.temp_c[i];
            let goal = if heating { target } else { target.max(AMBIENT_C) };
            let rate = if heating {
                HEAT_RATE_C_PER_S
            } else {
                COOL_RATE_C_PER_S
            };
            let step = rate * dt_s;
            if (goal - self.temp_c[i]).abs() <= step {
                self.temp_c[i] = goal;
            } else if goal > self.temp_c[i] {
                self.temp_c[i] += step;
            } else {
                self.temp_c[i] -= step;
            }
        }
    }
}

impl Thermal for SimThermal {
    fn temperature_c(&self, heater: HeaterId) -> f32 {
        self.temp_c[heater as usize]
    }

    fn set_target_c(&mut self, heater: HeaterId, target: f32) {
        self.target_c[heater as usize] = target;
    }
}

pub struct SimFans {
    pub pwm: [u8; 2],
    pub auto_control: bool,
    /// Tachometer counts per PWM step; default gives ~3000 rpm at full
    /// power.
    pub rpm_per_pwm: u16,
}

impl Fans for SimFans {
    fn set_pwm(&mut self, fan: FanId, pwm: u8) {
        self.pwm[fan as usize] = pwm;
        self.auto_control = false;
    }

    fn rpm(&self, fan: FanId) -> u16 {
        self.pwm[fan as usize] as u16 * self.rpm_per_pwm
    }

    fn restore_auto(&mut self) {
        self.pwm = [0, 0];
        self.auto_control = true;
    }
}

pub struct SimLoadcell {
    pub load_g: i32,
}

impl Loadcell for SimLoadcell {
    fn load_g(&self) -> i32 {
        self.load_g
    }

    fn tare(&mut self) {
        self.load_g = 0;
    }
}

pub struct SimFsensor {
    pub has_filament: bool,
    calibrated: bool,
    calibration_ms: Option<u32>,
    unload_ms: Option<u32>,
}

impl SimFsensor {
    fn advance(&mut self, dt_ms: u32) {
        if let Some(remaining) = self.calibration_ms {
            if remaining <= dt_ms {
                self.calibration_ms = None;
                self.calibrated = true;
            } else {
                self.calibration_ms = Some(remaining - dt_ms);
            }
        }
        if let Some(remaining) = self.unload_ms {
            if remaining <= dt_ms {
                self.unload_ms = None;
                self.has_filament = false;
            } else {
                self.unload_ms = Some(remaining - dt_ms);
            }
        }
    }
}

impl FilamentSensor for SimFsensor {
    fn state(&self) -> FilamentState {
        if !self.calibrated {
            FilamentState::NotCalibrated
        } else if self.has_filament {
            FilamentState::HasFilament
        } else {
            FilamentState::NoFilament
        }
    }

    fn request_calibration(&mut self, _with_filament: bool) {
        self.calibrated = false;
        self.calibration_ms = Some(CALIBRATION_MS);
    }

    fn calibration_finished(&self) -> bool {
        self.calibration_ms.is_none() && self.calibrated
    }

    fn invalidate_calibration(&mut self) {
        self.calibrated = false;
        self.calibration_ms = None;
    }

    fn unload(&mut self) {
        self.unload_ms = Some(UNLOAD_MS);
    }

    fn unload_active(&self) -> bool {
        self.unload_ms.is_some()
    }
}

pub struct SimToolchanger {
    pub offset_mm: (f32, f32),
    pub park_count: u32,
    pub pick_count: u32,
    docked: bool,
    pending: Option<(bool, u32)>,
}

impl SimToolchanger {
    fn advance(&mut self, dt_ms: u32) {
        if let Some((target, remaining)) = self.pending {
            if remaining <= dt_ms {
                self.pending = None;
                self.docked = target;
            } else {
                self.pending = Some((target, remaining - dt_ms));
            }
        }
    }
}

impl ToolChanger for SimToolchanger {
    fn park(&mut self) {
        self.park_count += 1;
        self.pending = Some((true, TOOLCHANGE_MS));
    }

    fn pick(&mut self) {
        self.pick_count += 1;
        self.pending = Some((false, TOOLCHANGE_MS));
    }

    fn docked(&self) -> bool {
        self.docked
    }

    fn dock_offset_mm(&self) -> (f32, f32) {
        self.offset_mm
    }
}

/// In-memory [`Config`] for scenarios that do not exercise the flash
/// store.
pub struct SimConfig {
    pub record: SelftestRecord,
    pub axis_length_mm: [f32; 3],
    pub heater_gain_c_per_s: [f32; 2],
    pub run_wizard: bool,
}

impl SimConfig {
    pub fn new() -> SimConfig {
        SimConfig {
            record: SelftestRecord::default(),
            axis_length_mm: [0.0; 3],
            heater_gain_c_per_s: [0.0; 2],
            run_wizard: true,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig::new()
    }
}

impl Config for SimConfig {
    fn selftest_record(&self) -> SelftestRecord {
        self.record
    }

    fn set_selftest_record(&mut self, record: SelftestRecord) {
        self.record = record;
    }

    fn set_axis_length(&mut self, axis: AxisId, length_mm: f32) {
        self.axis_length_mm[axis.index()] = length_mm;
    }

    fn set_heater_gain(&mut self, heater: HeaterId, rise_c_per_s: f32) {
        self.heater_gain_c_per_s[heater as usize] = rise_c_per_s;
    }

    fn run_wizard(&self) -> bool {
        self.run_wizard
    }

    fn set_run_wizard(&mut self, run: bool) {
        self.run_wizard = run;
    }
}

/// The whole machine. Advance it, then hand its peripherals to the
/// engine.
pub struct Machine {
    pub clock: SimClock,
    pub motion: SimMotion,
    pub thermal: SimThermal,
    pub fans: SimFans,
    pub loadcell: SimLoadcell,
    pub fsensor: SimFsensor,
    pub toolchanger: SimToolchanger,
}

impl Machine {
    /// True axis lengths in mm, deliberately a little off nominal.
    pub const TRUE_LENGTH_MM: [f32; 3] = [181.0, 182.5, 188.0];

    pub fn new() -> Machine {
        let axis = |limit_mm| SimAxis {
            position_mm: 0.0,
            limit_mm,
            target_mm: 0.0,
            feedrate_mm_s: 0.0,
        };
        Machine {
            clock: SimClock { now_ms: 0 },
            motion: SimMotion {
                axes: [
                    axis(Self::TRUE_LENGTH_MM[0]),
                    axis(Self::TRUE_LENGTH_MM[1]),
                    axis(Self::TRUE_LENGTH_MM[2]),
                ],
                steppers_enabled: false,
            },
            thermal: SimThermal {
                temp_c: [AMBIENT_C; 2],
                target_c: [0.0; 2],
                broken: [false; 2],
            },
            fans: SimFans {
                pwm: [0; 2],
                auto_control: true,
                rpm_per_pwm: 12,
            },
            loadcell: SimLoadcell { load_g: 0 },
            fsensor: SimFsensor {
                has_filament: false,
                calibrated: false,
                calibration_ms: None,
                unload_ms: None,
            },
            toolchanger: SimToolchanger {
                offset_mm: (0.2, -0.1),
                park_count: 0,
                pick_count: 0,
                docked: false,
                pending: None,
            },
        }
    }

    pub fn advance(&mut self, dt_ms: u32) {
        self.clock.now_ms = self.clock.now_ms.wrapping_add(dt_ms);
        let dt_s = dt_ms as f32 / 1000.0;
        for axis in &mut self.motion.axes {
            axis.advance(dt_s);
        }
        self.thermal.advance(dt_s);
        self.fsensor.advance(dt_ms);
        self.toolchanger.advance(dt_ms);
    }

    pub fn peripherals<'a>(&'a mut self, config: &'a mut dyn Config) -> Peripherals<'a> {
        Peripherals {
            clock: &self.clock,
            motion: &mut self.motion,
            thermal: &mut self.thermal,
            fans: &mut self.fans,
            loadcell: &mut self.loadcell,
            fsensor: &mut self.fsensor,
            toolchanger: &mut self.toolchanger,
            config,
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_heater_never_leaves_ambient() {
        let mut machine = Machine::new();
        machine.thermal.broken[HeaterId::Nozzle as usize] = true;
        machine.thermal.set_target_c(HeaterId::Nozzle, 200.0);
        machine.thermal.set_target_c(HeaterId::Bed, 60.0);
        for _ in 0..600 {
            machine.advance(50);
        }
        assert_eq!(machine.thermal.temperature_c(HeaterId::Nozzle), AMBIENT_C);
        assert_eq!(machine.thermal.temperature_c(HeaterId::Bed), 60.0);
    }
}
