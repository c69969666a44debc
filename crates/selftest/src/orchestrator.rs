//! The top-level run: which sub-tests execute, in what order, and what
//! happens to their verdicts.
//!
//! A [`Selftest`] owns one optional slot per test family; a slot is
//! allocated when its state is entered and destroyed as soon as the
//! procedure releases, leaving only the 2-bit verdict in the persisted
//! [`SelftestRecord`]. Everything runs from [`Selftest::tick`], rate
//! limited so a fast caller does not turn wait states into busy loops.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;

use crate::bridge::Notifier;
use crate::hal::{Fault, HeaterId, Peripherals};
use crate::part::Part;
use crate::parts::axis::{self, AxisConfig, AxisPart};
use crate::parts::dock::{self, DockConfig, DockPart};
use crate::parts::fan::{self, FanConfig, FanPart};
use crate::parts::fsensor::{self, FsensorConfig, FsensorPart};
use crate::parts::heater::{self, HeaterConfig, HeaterPart};
use crate::parts::loadcell::{self, LoadcellConfig, LoadcellPart};
use crate::record::SelftestRecord;
use crate::result::{FsmResult, TestResult};

/// Minimum spacing between dispatches, so wait states poll the hardware
/// at a sane rate no matter how often the caller ticks.
pub const TICK_PERIOD_MS: u32 = 50;

/// Order of a full run. Test states are entered only when selected; the
/// `Wait*` states let queued motion and heater cleanup settle before the
/// next family starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum State {
    Idle,
    Start,
    Prepare,
    Fans,
    Loadcell,
    WaitLoadcell,
    XAxis,
    YAxis,
    ZAxis,
    WaitAxes,
    Heaters,
    WaitHeaters,
    FSensor,
    Dock,
    Restore,
    Epilogue,
    Finish,
    Finished,
    Aborted,
}

/// Bitset over [`State`] selecting what a run executes.
///
/// Callers build it from the test bits; [`Selftest::start`] widens it
/// with the bracketing states and whatever `Wait*` states the selection
/// implies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TestMask(u32);

impl TestMask {
    pub const NONE: TestMask = TestMask(0);
    pub const FANS: TestMask = TestMask::of(State::Fans);
    pub const LOADCELL: TestMask = TestMask::of(State::Loadcell);
    pub const XAXIS: TestMask = TestMask::of(State::XAxis);
    pub const YAXIS: TestMask = TestMask::of(State::YAxis);
    pub const ZAXIS: TestMask = TestMask::of(State::ZAxis);
    pub const AXES: TestMask = Self::XAXIS.or(Self::YAXIS).or(Self::ZAXIS);
    pub const HEATERS: TestMask = TestMask::of(State::Heaters);
    pub const FSENSOR: TestMask = TestMask::of(State::FSensor);
    pub const DOCK: TestMask = TestMask::of(State::Dock);
    /// The full wizard.
    pub const ALL: TestMask = Self::FANS
        .or(Self::LOADCELL)
        .or(Self::AXES)
        .or(Self::HEATERS)
        .or(Self::FSENSOR)
        .or(Self::DOCK);

    pub const fn of(state: State) -> TestMask {
        TestMask(1 << state as u32)
    }

    pub const fn or(self, other: TestMask) -> TestMask {
        TestMask(self.0 | other.0)
    }

    pub const fn contains(self, state: State) -> bool {
        self.0 & (1 << state as u32) != 0
    }

    pub const fn intersects(self, other: TestMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Adds the states every run needs plus the `Wait*` states implied
    /// by the selected tests.
    fn widened(self) -> TestMask {
        let mut mask = self
            .or(TestMask::of(State::Start))
            .or(TestMask::of(State::Prepare))
            .or(TestMask::of(State::Restore))
            .or(TestMask::of(State::Epilogue))
            .or(TestMask::of(State::Finish));
        if mask.contains(State::Loadcell) {
            mask = mask.or(TestMask::of(State::WaitLoadcell));
        }
        if mask.intersects(TestMask::AXES) {
            mask = mask.or(TestMask::of(State::WaitAxes));
        }
        if mask.contains(State::Heaters) {
            mask = mask.or(TestMask::of(State::WaitHeaters));
        }
        mask
    }
}

/// Static tuning for every test family, one instance per machine model.
pub struct SelftestConfig {
    pub fans: FanConfig,
    pub loadcell: LoadcellConfig,
    pub xaxis: AxisConfig,
    pub yaxis: AxisConfig,
    pub zaxis: AxisConfig,
    pub nozzle: HeaterConfig,
    pub bed: HeaterConfig,
    pub fsensor: FsensorConfig,
    pub dock: DockConfig,
    /// Bed preheat started during `Prepare` when heaters are selected,
    /// so the bed check does not start from ambient.
    pub bed_preheat_c: f32,
}

type RecordField = for<'a> fn(&'a mut SelftestRecord) -> &'a mut TestResult;

fn poll_slot<S, R: FsmResult, const N: usize>(
    slot: &mut Option<Part<S, R, N>>,
    periph: &mut Peripherals<'_>,
    ui: &dyn Notifier,
) -> Option<(TestResult, Option<Fault>)> {
    let part = slot.as_mut()?;
    if part.tick(periph, ui) {
        return None;
    }
    let fault = part.take_fault();
    let result = part.result();
    *slot = None;
    Some((result, fault))
}

pub struct Selftest<'c> {
    cfg: &'c SelftestConfig,
    state: State,
    mask: TestMask,
    last_tick_ms: Option<u32>,
    started_ms: u32,
    fault: Option<Fault>,
    heater_turn: bool,
    fans: Option<FanPart<'c>>,
    loadcell: Option<LoadcellPart<'c>>,
    // one slot serves X, Y and Z; the axes run strictly in sequence
    axis: Option<AxisPart<'c>>,
    nozzle: Option<HeaterPart<'c>>,
    bed: Option<HeaterPart<'c>>,
    fsensor: Option<FsensorPart<'c>>,
    dock: Option<DockPart<'c>>,
}

impl<'c> Selftest<'c> {
    pub fn new(cfg: &'c SelftestConfig) -> Self {
        Selftest {
            cfg,
            state: State::Idle,
            mask: TestMask::NONE,
            last_tick_ms: None,
            started_ms: 0,
            fault: None,
            heater_turn: false,
            fans: None,
            loadcell: None,
            axis: None,
            nozzle: None,
            bed: None,
            fsensor: None,
            dock: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        !matches!(self.state, State::Idle | State::Finished | State::Aborted)
    }

    pub fn is_aborted(&self) -> bool {
        self.state == State::Aborted
    }

    /// Set when a run was terminated by a machine-level fault rather
    /// than a failed or aborted sub-test.
    pub fn fatal_fault(&self) -> Option<Fault> {
        self.fault
    }

    pub fn elapsed_ms(&self, now_ms: u32) -> u32 {
        now_ms.wrapping_sub(self.started_ms)
    }

    /// Arms a run. Ignored while one is already in progress.
    pub fn start(&mut self, mask: TestMask) {
        if self.is_in_progress() {
            log::warn!("selftest: already running, start ignored");
            return;
        }
        self.mask = mask.widened();
        self.state = State::Start;
        self.fault = None;
        self.last_tick_ms = None;
        log::info!("selftest: armed, mask {:#x}", self.mask.bits());
    }

    /// Advances the run by at most one step of one procedure. Safe to
    /// call every loop iteration; actual dispatch is rate limited.
    pub fn tick(&mut self, periph: &mut Peripherals<'_>, ui: &dyn Notifier) {
        if !self.is_in_progress() {
            return;
        }
        let now = periph.clock.now_ms();
        if let Some(last) = self.last_tick_ms {
            if now.wrapping_sub(last) < TICK_PERIOD_MS {
                return;
            }
        }
        self.last_tick_ms = Some(now);

        match self.state {
            State::Idle | State::Finished | State::Aborted => {}
            State::Start => {
                self.started_ms = now;
                log::info!("selftest: run started");
                self.advance(periph);
            }
            State::Prepare => {
                let mut record = periph.config.selftest_record();
                self.reset_requested(&mut record);
                periph.config.set_selftest_record(record);
                if self.mask.contains(State::Heaters) {
                    periph
                        .thermal
                        .set_target_c(HeaterId::Bed, self.cfg.bed_preheat_c);
                }
                self.advance(periph);
            }
            State::Fans => {
                let cfg = self.cfg;
                self.fans.get_or_insert_with(|| fan::part(&cfg.fans));
                if let Some((result, fault)) = poll_slot(&mut self.fans, periph, ui) {
                    self.finish_test(periph, |r| &mut r.fans, result, fault);
                }
            }
            State::Loadcell => {
                let cfg = self.cfg;
                self.loadcell
                    .get_or_insert_with(|| loadcell::part(&cfg.loadcell));
                if let Some((result, fault)) = poll_slot(&mut self.loadcell, periph, ui) {
                    self.finish_test(periph, |r| &mut r.loadcell, result, fault);
                }
            }
            State::XAxis | State::YAxis | State::ZAxis => {
                let cfg = self.cfg;
                let (axis_cfg, field): (&'c AxisConfig, RecordField) = match self.state {
                    State::XAxis => (&cfg.xaxis, |r| &mut r.xaxis),
                    State::YAxis => (&cfg.yaxis, |r| &mut r.yaxis),
                    _ => (&cfg.zaxis, |r| &mut r.zaxis),
                };
                self.axis.get_or_insert_with(|| axis::part(axis_cfg));
                if let Some((result, fault)) = poll_slot(&mut self.axis, periph, ui) {
                    self.finish_test(periph, field, result, fault);
                }
            }
            State::Heaters => self.tick_heaters(periph, ui),
            State::FSensor => {
                let cfg = self.cfg;
                self.fsensor
                    .get_or_insert_with(|| fsensor::part(&cfg.fsensor));
                if let Some((result, fault)) = poll_slot(&mut self.fsensor, periph, ui) {
                    self.finish_test(periph, |r| &mut r.fsensor, result, fault);
                }
            }
            State::Dock => {
                let cfg = self.cfg;
                self.dock.get_or_insert_with(|| dock::part(&cfg.dock));
                if let Some((result, fault)) = poll_slot(&mut self.dock, periph, ui) {
                    self.finish_test(periph, |r| &mut r.dock, result, fault);
                }
            }
            State::WaitLoadcell | State::WaitAxes | State::WaitHeaters => {
                if periph.motion.queue_drained() {
                    self.advance(periph);
                }
            }
            State::Restore => {
                self.teardown(periph);
                self.advance(periph);
            }
            State::Epilogue => {
                let record = periph.config.selftest_record();
                if record.all_passed() {
                    log::info!("selftest: everything passed, wizard done");
                    periph.config.set_run_wizard(false);
                }
                self.advance(periph);
            }
            State::Finish => {
                log::info!("selftest: finished after {} ms", self.elapsed_ms(now));
                self.state = State::Finished;
            }
        }
    }

    /// Tears the run down: every live procedure is aborted (recording
    /// `Skipped`) and the hardware is returned to its idle state.
    pub fn abort(&mut self, periph: &mut Peripherals<'_>) {
        if !self.is_in_progress() {
            return;
        }
        log::warn!("selftest: run aborted in {:?}", self.state);
        if let Some(mut part) = self.fans.take() {
            part.abort(periph);
            Self::persist(periph, |r| &mut r.fans, part.result());
        }
        if let Some(mut part) = self.loadcell.take() {
            part.abort(periph);
            Self::persist(periph, |r| &mut r.loadcell, part.result());
        }
        if let Some(mut part) = self.axis.take() {
            part.abort(periph);
            let field: RecordField = match self.state {
                State::XAxis => |r| &mut r.xaxis,
                State::YAxis => |r| &mut r.yaxis,
                _ => |r| &mut r.zaxis,
            };
            Self::persist(periph, field, part.result());
        }
        if let Some(mut part) = self.nozzle.take() {
            part.abort(periph);
            Self::persist(periph, |r| &mut r.nozzle, part.result());
        }
        if let Some(mut part) = self.bed.take() {
            part.abort(periph);
            Self::persist(periph, |r| &mut r.bed, part.result());
        }
        if let Some(mut part) = self.fsensor.take() {
            part.abort(periph);
            Self::persist(periph, |r| &mut r.fsensor, part.result());
        }
        if let Some(mut part) = self.dock.take() {
            part.abort(periph);
            Self::persist(periph, |r| &mut r.dock, part.result());
        }
        self.teardown(periph);
        self.state = State::Aborted;
    }

    /// Both heaters run concurrently from the one `Heaters` state, one
    /// of them stepped per dispatch.
    fn tick_heaters(&mut self, periph: &mut Peripherals<'_>, ui: &dyn Notifier) {
        let cfg = self.cfg;
        if self.nozzle.is_none() && self.bed.is_none() {
            self.nozzle = Some(heater::part(&cfg.nozzle));
            self.bed = Some(heater::part(&cfg.bed));
        }
        self.heater_turn = !self.heater_turn;
        let tick_nozzle = match (&self.nozzle, &self.bed) {
            (Some(_), Some(_)) => self.heater_turn,
            (Some(_), None) => true,
            _ => false,
        };
        let done = if tick_nozzle {
            let field: RecordField = |r| &mut r.nozzle;
            poll_slot(&mut self.nozzle, periph, ui).map(|(result, fault)| (result, fault, field))
        } else {
            let field: RecordField = |r| &mut r.bed;
            poll_slot(&mut self.bed, periph, ui).map(|(result, fault)| (result, fault, field))
        };
        if let Some((result, _fault, field)) = done {
            Self::persist(periph, field, result);
            if result == TestResult::Skipped {
                self.abort(periph);
            } else if self.nozzle.is_none() && self.bed.is_none() {
                self.advance(periph);
            }
        }
    }

    fn finish_test(
        &mut self,
        periph: &mut Peripherals<'_>,
        field: RecordField,
        result: TestResult,
        fault: Option<Fault>,
    ) {
        Self::persist(periph, field, result);
        if let Some(fault) = fault {
            log::error!("selftest: fatal fault {:?}, terminating", fault);
            self.fault = Some(fault);
            self.abort(periph);
        } else if result == TestResult::Skipped {
            // the user aborted inside the procedure; the whole run goes
            self.abort(periph);
        } else {
            self.advance(periph);
        }
    }

    fn persist(periph: &mut Peripherals<'_>, field: RecordField, result: TestResult) {
        let mut record = periph.config.selftest_record();
        *field(&mut record) = result;
        periph.config.set_selftest_record(record);
    }

    /// Steps to the next selected state. The Z axis additionally needs
    /// the load cell and both horizontal axes to have passed, since its
    /// endstop detection runs through the load cell.
    fn advance(&mut self, periph: &mut Peripherals<'_>) {
        let mut next = self.state as u32 + 1;
        loop {
            let state = State::from_u32(next).unwrap_or(State::Finished);
            if matches!(state, State::Finished | State::Aborted) {
                self.state = state;
                return;
            }
            if !self.mask.contains(state) {
                next += 1;
                continue;
            }
            if state == State::ZAxis && !Self::zaxis_runnable(periph) {
                log::warn!("selftest: Z axis prerequisites not met, skipping");
                next += 1;
                continue;
            }
            log::debug!("selftest: {:?} -> {:?}", self.state, state);
            self.state = state;
            return;
        }
    }

    fn zaxis_runnable(periph: &Peripherals<'_>) -> bool {
        let record = periph.config.selftest_record();
        record.loadcell == TestResult::Passed
            && record.xaxis == TestResult::Passed
            && record.yaxis == TestResult::Passed
    }

    /// Clears the stored verdict of every selected test, so a re-run
    /// cannot show a stale pass while the new result is pending.
    fn reset_requested(&self, record: &mut SelftestRecord) {
        if self.mask.contains(State::Fans) {
            record.fans = TestResult::Unknown;
        }
        if self.mask.contains(State::Loadcell) {
            record.loadcell = TestResult::Unknown;
        }
        if self.mask.contains(State::XAxis) {
            record.xaxis = TestResult::Unknown;
        }
        if self.mask.contains(State::YAxis) {
            record.yaxis = TestResult::Unknown;
        }
        if self.mask.contains(State::ZAxis) {
            record.zaxis = TestResult::Unknown;
        }
        if self.mask.contains(State::Heaters) {
            record.nozzle = TestResult::Unknown;
            record.bed = TestResult::Unknown;
        }
        if self.mask.contains(State::FSensor) {
            record.fsensor = TestResult::Unknown;
        }
        if self.mask.contains(State::Dock) {
            record.dock = TestResult::Unknown;
        }
    }

    fn teardown(&self, periph: &mut Peripherals<'_>) {
        periph.thermal.set_target_c(HeaterId::Nozzle, 0.0);
        periph.thermal.set_target_c(HeaterId::Bed, 0.0);
        periph.fans.restore_auto();
        periph.motion.disable_steppers();
    }
}
