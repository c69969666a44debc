//! Interfaces to the rest of the firmware.
//!
//! The engine never talks to hardware directly; everything it needs from
//! the motion, thermal, fan, load-cell, filament-sensor and tool-dock
//! subsystems comes in through these traits, bundled per tick into a
//! [`Peripherals`] value. The simulator and the real board both
//! implement them.

use crate::record::SelftestRecord;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AxisId {
    X,
    Y,
    Z,
}

impl AxisId {
    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeaterId {
    Nozzle,
    Bed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FanId {
    Print,
    Heatbreak,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilamentState {
    NotInitialized,
    NoFilament,
    HasFilament,
    NotCalibrated,
    NotConnected,
    Disabled,
}

/// A hardware inconsistency severe enough to stop the whole machine, not
/// just fail a sub-test. Not retryable from inside the engine.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Fault {
    /// The dock was measured wildly outside its physical envelope.
    DockFarOutOfBounds { distance_mm: f32 },
}

/// Monotonic millisecond clock. Allowed to wrap.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

/// The slice of the motion subsystem the selftest needs: enqueue simple
/// moves and observe when the queue drains.
pub trait Motion {
    fn home(&mut self, axis: AxisId);
    fn move_to(&mut self, axis: AxisId, target_mm: f32, feedrate_mm_s: f32);
    fn position_mm(&self, axis: AxisId) -> f32;
    /// True once every enqueued command has finished executing.
    fn queue_drained(&self) -> bool;
    fn disable_steppers(&mut self);
}

pub trait Thermal {
    fn temperature_c(&self, heater: HeaterId) -> f32;
    fn set_target_c(&mut self, heater: HeaterId, target: f32);
}

pub trait Fans {
    /// Takes the fan out of automatic control and drives it directly.
    fn set_pwm(&mut self, fan: FanId, pwm: u8);
    fn rpm(&self, fan: FanId) -> u16;
    /// Hands control back to the regular thermal logic.
    fn restore_auto(&mut self);
}

pub trait Loadcell {
    fn load_g(&self) -> i32;
    fn tare(&mut self);
}

pub trait FilamentSensor {
    fn state(&self) -> FilamentState;
    fn request_calibration(&mut self, with_filament: bool);
    fn calibration_finished(&self) -> bool;
    fn invalidate_calibration(&mut self);
    /// Kick off a filament unload; completion is polled.
    fn unload(&mut self);
    fn unload_active(&self) -> bool;
}

pub trait ToolChanger {
    fn park(&mut self);
    fn pick(&mut self);
    fn docked(&self) -> bool;
    /// Measured dock position relative to its nominal location.
    fn dock_offset_mm(&self) -> (f32, f32);
}

/// Persistent configuration the engine reads and writes.
pub trait Config {
    fn selftest_record(&self) -> SelftestRecord;
    fn set_selftest_record(&mut self, record: SelftestRecord);
    fn set_axis_length(&mut self, axis: AxisId, length_mm: f32);
    /// Measured heat-up rate from the heater characterization.
    fn set_heater_gain(&mut self, heater: HeaterId, rise_c_per_s: f32);
    fn run_wizard(&self) -> bool;
    fn set_run_wizard(&mut self, run: bool);
}

/// Everything a step function may touch, rebuilt from the owning
/// context on every tick so the engine holds no long-lived borrows.
pub struct Peripherals<'a> {
    pub clock: &'a dyn Clock,
    pub motion: &'a mut dyn Motion,
    pub thermal: &'a mut dyn Thermal,
    pub fans: &'a mut dyn Fans,
    pub loadcell: &'a mut dyn Loadcell,
    pub fsensor: &'a mut dyn FilamentSensor,
    pub toolchanger: &'a mut dyn ToolChanger,
    pub config: &'a mut dyn Config,
}
