//! Hardware behind the engine's peripheral traits, for the toolhead
//! test jig: one Z carriage, the two toolhead fans, the load cell, the
//! filament sensor and the nozzle thermistor.
//!
//! Everything is serviced from the main control loop; `service` runs the
//! step generator, the bang-bang nozzle control and the tachometer
//! windows, and the trait impls only read or write cached state.

use embassy_time::Instant;
use embedded_hal::digital::v2::{InputPin, OutputPin, PinState};
use esp32c3_hal::adc::{AdcPin, ADC, ADC1};
use esp32c3_hal::gpio::{Analog, AnyPin, GpioPin, Input, Output, PullUp, PushPull};
use esp32c3_hal::ledc::channel::{Channel, ChannelHW as _};
use esp32c3_hal::ledc::LowSpeed;
use esp32c3_hal::prelude::*;
use fabrik_protocol::Response;
use fabrik_selftest::hal::{
    AxisId, Clock, FanId, Fans, FilamentSensor, FilamentState, HeaterId, Loadcell, Motion,
    Peripherals, Thermal, ToolChanger,
};

pub type AnyOutput = AnyPin<Output<PushPull>>;
pub type AnyInput = AnyPin<Input<PullUp>>;

/// Steps executed per service call, bounding the time spent bit-banging.
const STEP_BURST: u32 = 32;
const TACH_WINDOW_MS: u64 = 250;
/// Two tach pulses per fan revolution.
const TACH_PULSES_PER_REV: u32 = 2;
const AMBIENT_C: f32 = 25.0;

pub struct BoardClock;

impl Clock for BoardClock {
    fn now_ms(&self) -> u32 {
        Instant::now().as_millis() as u32
    }
}

/// Step/dir driver with a stall (DIAG) input. Homing runs into the
/// stall; so does the length measurement, which is the point.
pub struct Stepper {
    step: AnyOutput,
    dir: AnyOutput,
    enable: AnyOutput,
    diag: AnyInput,
    steps_per_mm: f32,
    pos_steps: i32,
    target_steps: i32,
    steps_per_s: u32,
    step_debt: f32,
}

impl Stepper {
    pub fn new(
        step: impl Into<AnyOutput>,
        dir: impl Into<AnyOutput>,
        enable: impl Into<AnyOutput>,
        diag: impl Into<AnyInput>,
        steps_per_mm: f32,
    ) -> Self {
        Stepper {
            step: step.into(),
            dir: dir.into(),
            enable: enable.into(),
            diag: diag.into(),
            steps_per_mm,
            pos_steps: 0,
            target_steps: 0,
            steps_per_s: 0,
            step_debt: 0.0,
        }
    }

    fn stalled(&self) -> bool {
        self.diag.is_high().unwrap_or(false)
    }

    /// Emits up to the accumulated number of steps, stopping at the
    /// target or at a stall. A stall adopts the current position as the
    /// target, which is what the length measurement reads back.
    fn service(&mut self, dt_s: f32) {
        self.step_debt += self.steps_per_s as f32 * dt_s;
        let mut budget = (self.step_debt as u32).min(STEP_BURST);
        self.step_debt -= budget as f32;
        while budget > 0 && self.pos_steps != self.target_steps {
            if self.stalled() {
                self.target_steps = self.pos_steps;
                break;
            }
            let forward = self.target_steps > self.pos_steps;
            let _ = self.dir.set_state(PinState::from(forward));
            let _ = self.step.set_high();
            let _ = self.step.set_low();
            self.pos_steps += if forward { 1 } else { -1 };
            budget -= 1;
        }
    }

    fn moving(&self) -> bool {
        self.pos_steps != self.target_steps
    }

    /// After a stalled homing move the stall position becomes the
    /// origin.
    fn rehome_origin(&mut self) {
        if !self.moving() && self.pos_steps < 0 {
            self.pos_steps = 0;
            self.target_steps = 0;
        }
    }
}

/// Only the Z carriage exists on the jig; X and Y report as parked.
pub struct BoardMotion {
    z: Stepper,
}

impl BoardMotion {
    pub fn new(z: Stepper) -> Self {
        BoardMotion { z }
    }

    fn service(&mut self, dt_s: f32) {
        self.z.service(dt_s);
        self.z.rehome_origin();
    }
}

impl Motion for BoardMotion {
    fn home(&mut self, axis: AxisId) {
        if axis != AxisId::Z {
            return;
        }
        let _ = self.z.enable.set_low();
        // run toward the stall; the stop adopts the origin
        self.z.target_steps = i32::MIN / 2;
        self.z.steps_per_s = (10.0 * self.z.steps_per_mm) as u32;
    }

    fn move_to(&mut self, axis: AxisId, target_mm: f32, feedrate_mm_s: f32) {
        if axis != AxisId::Z {
            return;
        }
        let _ = self.z.enable.set_low();
        self.z.target_steps = (target_mm * self.z.steps_per_mm) as i32;
        self.z.steps_per_s = (feedrate_mm_s * self.z.steps_per_mm) as u32;
    }

    fn position_mm(&self, axis: AxisId) -> f32 {
        if axis != AxisId::Z {
            return 0.0;
        }
        self.z.pos_steps as f32 / self.z.steps_per_mm
    }

    fn queue_drained(&self) -> bool {
        !self.z.moving()
    }

    fn disable_steppers(&mut self) {
        let _ = self.z.enable.set_high();
        self.z.target_steps = self.z.pos_steps;
    }
}

pub type NozzleSense = AdcPin<GpioPin<Analog, 0>, ADC1>;

/// Nozzle thermistor plus bang-bang heater output. The jig has no bed;
/// its reading is pinned at ambient.
pub struct BoardThermal<'d> {
    adc: ADC<'d, ADC1>,
    sense: NozzleSense,
    heater: AnyOutput,
    temp_c: f32,
    target_c: f32,
}

impl<'d> BoardThermal<'d> {
    pub fn new(adc: ADC<'d, ADC1>, sense: NozzleSense, heater: impl Into<AnyOutput>) -> Self {
        BoardThermal {
            adc,
            sense,
            heater: heater.into(),
            temp_c: AMBIENT_C,
            target_c: 0.0,
        }
    }

    /// Crude NTC linearization, good to a couple of degrees in the range
    /// the selftest cares about.
    fn counts_to_c(counts: u16) -> f32 {
        300.0 - counts as f32 * 0.075
    }

    fn service(&mut self) {
        if let Ok(counts) = self.adc.read(&mut self.sense) {
            self.temp_c = Self::counts_to_c(counts);
        }
        let heat = self.target_c > 0.0 && self.temp_c < self.target_c;
        let _ = self.heater.set_state(PinState::from(heat));
    }
}

impl Thermal for BoardThermal<'_> {
    fn temperature_c(&self, heater: HeaterId) -> f32 {
        match heater {
            HeaterId::Nozzle => self.temp_c,
            HeaterId::Bed => AMBIENT_C,
        }
    }

    fn set_target_c(&mut self, heater: HeaterId, target: f32) {
        if heater == HeaterId::Nozzle {
            self.target_c = target;
        }
    }
}

pub struct BoardFans<'d> {
    channels: [Channel<'d, LowSpeed, AnyOutput>; 2],
    tachs: [AnyInput; 2],
    tach_level: [bool; 2],
    tach_count: [u32; 2],
    rpm: [u16; 2],
    window_start: Instant,
}

impl<'d> BoardFans<'d> {
    pub fn new(channels: [Channel<'d, LowSpeed, AnyOutput>; 2], tachs: [AnyInput; 2]) -> Self {
        BoardFans {
            channels,
            tachs,
            tach_level: [false; 2],
            tach_count: [0; 2],
            rpm: [0; 2],
            window_start: Instant::now(),
        }
    }

    fn service(&mut self) {
        for i in 0..2 {
            let level = self.tachs[i].is_high().unwrap_or(false);
            if level && !self.tach_level[i] {
                self.tach_count[i] += 1;
            }
            self.tach_level[i] = level;
        }
        let elapsed_ms = self.window_start.elapsed().as_millis();
        if elapsed_ms >= TACH_WINDOW_MS {
            for i in 0..2 {
                let revs_per_min =
                    self.tach_count[i] * 60_000 / (TACH_PULSES_PER_REV * elapsed_ms as u32);
                self.rpm[i] = revs_per_min as u16;
                self.tach_count[i] = 0;
            }
            self.window_start = Instant::now();
        }
    }
}

impl Fans for BoardFans<'_> {
    fn set_pwm(&mut self, fan: FanId, pwm: u8) {
        self.channels[fan as usize].set_duty_hw(pwm as u32);
    }

    fn rpm(&self, fan: FanId) -> u16 {
        self.rpm[fan as usize]
    }

    fn restore_auto(&mut self) {
        for channel in &self.channels {
            channel.set_duty_hw(0);
        }
    }
}

/// HX711-style load cell frontend, polled for readiness in `service`.
pub struct BoardLoadcell {
    dout: AnyInput,
    sck: AnyOutput,
    raw: i32,
    offset: i32,
    counts_per_g: f32,
}

impl BoardLoadcell {
    pub fn new(dout: impl Into<AnyInput>, sck: impl Into<AnyOutput>, counts_per_g: f32) -> Self {
        BoardLoadcell {
            dout: dout.into(),
            sck: sck.into(),
            raw: 0,
            offset: 0,
            counts_per_g,
        }
    }

    fn service(&mut self) {
        // data line low means a sample is ready
        if self.dout.is_high().unwrap_or(true) {
            return;
        }
        let mut raw: u32 = 0;
        for _ in 0..24 {
            let _ = self.sck.set_high();
            let _ = self.sck.set_low();
            raw = (raw << 1) | self.dout.is_high().unwrap_or(false) as u32;
        }
        // one extra clock selects gain 128 for the next conversion
        let _ = self.sck.set_high();
        let _ = self.sck.set_low();
        // sign-extend the 24-bit reading
        self.raw = ((raw << 8) as i32) >> 8;
    }
}

impl Loadcell for BoardLoadcell {
    fn load_g(&self) -> i32 {
        ((self.raw - self.offset) as f32 / self.counts_per_g) as i32
    }

    fn tare(&mut self) {
        self.offset = self.raw;
    }
}

pub struct BoardFsensor {
    pin: AnyInput,
    calibrated: bool,
    /// Pin level that means filament present; learned by calibration.
    present_level: bool,
}

impl BoardFsensor {
    pub fn new(pin: impl Into<AnyInput>) -> Self {
        BoardFsensor {
            pin: pin.into(),
            calibrated: false,
            present_level: true,
        }
    }

    fn level(&self) -> bool {
        self.pin.is_high().unwrap_or(false)
    }
}

impl FilamentSensor for BoardFsensor {
    fn state(&self) -> FilamentState {
        if !self.calibrated {
            FilamentState::NotCalibrated
        } else if self.level() == self.present_level {
            FilamentState::HasFilament
        } else {
            FilamentState::NoFilament
        }
    }

    fn request_calibration(&mut self, with_filament: bool) {
        // learn which level corresponds to the reference condition
        self.present_level = if with_filament {
            self.level()
        } else {
            !self.level()
        };
        self.calibrated = true;
    }

    fn calibration_finished(&self) -> bool {
        self.calibrated
    }

    fn invalidate_calibration(&mut self) {
        self.calibrated = false;
    }

    // the jig has no extruder; unloading is the operator's job
    fn unload(&mut self) {}

    fn unload_active(&self) -> bool {
        false
    }
}

/// Single fixed tool; the dock test is never selected on this board.
pub struct SingleTool;

impl ToolChanger for SingleTool {
    fn park(&mut self) {}

    fn pick(&mut self) {}

    fn docked(&self) -> bool {
        false
    }

    fn dock_offset_mm(&self) -> (f32, f32) {
        (0.0, 0.0)
    }
}

/// Two-button operator input, edge triggered on release.
pub struct Buttons {
    ok: AnyInput,
    cancel: AnyInput,
    ok_was_down: bool,
    cancel_was_down: bool,
}

impl Buttons {
    pub fn new(ok: impl Into<AnyInput>, cancel: impl Into<AnyInput>) -> Self {
        Buttons {
            ok: ok.into(),
            cancel: cancel.into(),
            ok_was_down: false,
            cancel_was_down: false,
        }
    }

    pub fn poll(&mut self) -> Option<Response> {
        let ok_down = self.ok.is_low().unwrap_or(false);
        let cancel_down = self.cancel.is_low().unwrap_or(false);
        let response = if self.ok_was_down && !ok_down {
            Some(Response::Continue)
        } else if self.cancel_was_down && !cancel_down {
            Some(Response::Abort)
        } else {
            None
        };
        self.ok_was_down = ok_down;
        self.cancel_was_down = cancel_down;
        response
    }
}

pub struct Board<'d> {
    pub clock: BoardClock,
    pub motion: BoardMotion,
    pub thermal: BoardThermal<'d>,
    pub fans: BoardFans<'d>,
    pub loadcell: BoardLoadcell,
    pub fsensor: BoardFsensor,
    pub toolchanger: SingleTool,
    last_service: Instant,
}

impl<'d> Board<'d> {
    pub fn new(
        motion: BoardMotion,
        thermal: BoardThermal<'d>,
        fans: BoardFans<'d>,
        loadcell: BoardLoadcell,
        fsensor: BoardFsensor,
    ) -> Self {
        Board {
            clock: BoardClock,
            motion,
            thermal,
            fans,
            loadcell,
            fsensor,
            toolchanger: SingleTool,
            last_service: Instant::now(),
        }
    }

    pub fn service(&mut self) {
        let now = Instant::now();
        let dt_s = (now - self.last_service).as_micros() as f32 / 1_000_000.0;
        self.last_service = now;
        self.motion.service(dt_s);
        self.thermal.service();
        self.fans.service();
        self.loadcell.service();
    }

    pub fn peripherals<'a>(
        &'a mut self,
        config: &'a mut dyn fabrik_selftest::hal::Config,
    ) -> Peripherals<'a> {
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
