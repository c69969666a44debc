//! Generic driver turning an ordered list of step functions into a
//! resumable, abortable, loop-capable hardware procedure.
//!
//! A [`Part`] owns the per-run state: current step, entry timestamp,
//! loop-mark slots, the last button the user pressed and the minimum
//! time a terminal screen stays visible. The step functions themselves
//! live in [`crate::parts`], one module per test family.

use fabrik_protocol::{BaseData, Phase, Response};

use crate::bridge::Notifier;
use crate::hal::{Fault, Peripherals};
use crate::outcome::{Outcome, LOOP_MARKS};
use crate::result::{FsmResult, TestResult};

/// How long a terminal state keeps reporting "still running", so the UI
/// gets to render the final icon before the instance is destroyed. Also
/// the threshold for [`StepCtx::state_visible`].
pub const DEFAULT_DWELL_MS: u32 = 500;

pub type StepFn<S, R> = fn(&mut S, &mut R, &mut StepCtx<'_, '_>) -> Outcome;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Progress {
    Idle,
    Step(usize),
    Finished,
    Aborted,
    Failed,
}

/// What the driver hands to a step function, besides the instance and
/// the result value.
pub struct StepCtx<'p, 'a> {
    pub periph: &'p mut Peripherals<'a>,
    pub ui: &'p dyn Notifier,
    /// Last button the user pressed while the current phase was shown.
    pub button: Response,
    in_state_ms: u32,
    dwell_ms: u32,
    phase: Phase,
    phase_changed: bool,
    fault: Option<Fault>,
}

impl StepCtx<'_, '_> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Switches the UI to a different screen. Takes effect after the
    /// step returns; also forgets the last button press, which belonged
    /// to the previous screen.
    pub fn set_phase(&mut self, phase: Phase) {
        if phase != self.phase {
            self.phase = phase;
            self.phase_changed = true;
        }
    }

    /// Milliseconds spent in the current step.
    pub fn in_state_ms(&self) -> u32 {
        self.in_state_ms
    }

    /// True once the current screen has been up long enough not to
    /// flicker. Steps that would otherwise blip through a phase gate on
    /// this before moving on.
    pub fn state_visible(&self) -> bool {
        self.in_state_ms >= self.dwell_ms
    }

    /// Escalates a whole-system fault. The run terminates; this is not
    /// an ordinary test failure and has no retry path.
    pub fn raise_fatal(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }
}

/// One running self-test procedure: a fixed step table bound to an
/// instance `S` and a result value `R`.
pub struct Part<S, R: FsmResult, const N: usize> {
    name: &'static str,
    steps: [StepFn<S, R>; N],
    instance: S,
    result: R,
    progress: Progress,
    entered_ms: u32,
    marks: [Option<usize>; LOOP_MARKS],
    last_button: Response,
    phase: Phase,
    last_sent: Option<BaseData>,
    dwell_ms: u32,
    abort_hook: Option<fn(&mut S, &mut Peripherals<'_>)>,
    fault: Option<Fault>,
}

impl<S, R: FsmResult, const N: usize> Part<S, R, N> {
    pub fn new(name: &'static str, phase: Phase, steps: [StepFn<S, R>; N], instance: S) -> Self {
        assert!(N > 0);
        Part {
            name,
            steps,
            instance,
            result: R::default(),
            progress: Progress::Idle,
            entered_ms: 0,
            marks: [None; LOOP_MARKS],
            last_button: Response::None,
            phase,
            last_sent: None,
            dwell_ms: DEFAULT_DWELL_MS,
            abort_hook: None,
            fault: None,
        }
    }

    pub fn with_dwell_ms(mut self, dwell_ms: u32) -> Self {
        self.dwell_ms = dwell_ms;
        self
    }

    /// Cleanup invoked when the procedure is aborted, before the result
    /// is marked. The drop path cannot reach hardware, so this can.
    pub fn with_abort_hook(mut self, hook: fn(&mut S, &mut Peripherals<'_>)) -> Self {
        self.abort_hook = Some(hook);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The persisted verdict for the current progress. `Unknown` while
    /// still running; a user abort maps to `Skipped`.
    pub fn result(&self) -> TestResult {
        match self.progress {
            Progress::Finished => TestResult::Passed,
            Progress::Failed => TestResult::Failed,
            Progress::Aborted => TestResult::Skipped,
            Progress::Idle | Progress::Step(_) => TestResult::Unknown,
        }
    }

    pub fn take_fault(&mut self) -> Option<Fault> {
        self.fault.take()
    }

    /// Advances the procedure by at most one step. Returns true while
    /// the procedure is still running (or its terminal screen is still
    /// within its dwell time).
    pub fn tick(&mut self, periph: &mut Peripherals<'_>, ui: &dyn Notifier) -> bool {
        let now = periph.clock.now_ms();
        let step = match self.progress {
            Progress::Idle => {
                log::info!("{}: started", self.name);
                self.enter(Progress::Step(0), now);
                self.push_notification(ui);
                0
            }
            Progress::Step(step) => step,
            _ => return now.wrapping_sub(self.entered_ms) < self.dwell_ms,
        };

        // The user can abort from any screen; steps never see that
        // button, only the driver does.
        if let Some(response) = ui.poll_response(self.phase) {
            if response == Response::Abort {
                log::warn!("{}: user abort", self.name);
                self.abort(periph);
                self.push_notification(ui);
                return false;
            }
            self.last_button = response;
        }

        let mut ctx = StepCtx {
            periph,
            ui,
            button: self.last_button,
            in_state_ms: now.wrapping_sub(self.entered_ms),
            dwell_ms: self.dwell_ms,
            phase: self.phase,
            phase_changed: false,
            fault: None,
        };
        let outcome = (self.steps[step])(&mut self.instance, &mut self.result, &mut ctx);
        let StepCtx {
            phase,
            phase_changed,
            fault,
            ..
        } = ctx;

        if phase_changed {
            self.phase = phase;
            self.last_button = Response::None;
        }
        if let Some(fault) = fault {
            log::error!("{}: fatal fault {:?}", self.name, fault);
            self.fault = Some(fault);
        }

        match outcome {
            Outcome::Continue => self.advance(step + 1, now),
            Outcome::MarkLoop(mark) => {
                self.marks[mark.index()] = Some(step);
                self.advance(step + 1, now);
            }
            Outcome::Repeat => {
                log::trace!("{}: step {} still running", self.name, step);
            }
            Outcome::Fail => {
                log::error!("{}: failed at step {}", self.name, step);
                self.result.fail();
                self.enter(Progress::Failed, now);
            }
            Outcome::Abort => {
                log::warn!("{}: aborted at step {}", self.name, step);
                self.result.abort();
                self.enter(Progress::Aborted, now);
            }
            Outcome::JumpBack(mark) => match self.marks[mark.index()] {
                Some(target) if target <= step => self.enter(Progress::Step(target), now),
                _ => {
                    // Jumping to a slot nothing marked is a programming
                    // error in the step table; refuse to guess.
                    debug_assert!(false, "jump to unset loop mark");
                    log::error!("{}: jump to unset loop mark at step {}", self.name, step);
                    self.result.abort();
                    self.enter(Progress::Aborted, now);
                }
            },
        }

        self.push_notification(ui);
        match self.progress {
            Progress::Idle | Progress::Step(_) => true,
            _ => now.wrapping_sub(self.entered_ms) < self.dwell_ms,
        }
    }

    /// External abort, used by the orchestrator when the whole run is
    /// torn down. No-op once terminal.
    pub fn abort(&mut self, periph: &mut Peripherals<'_>) {
        if !matches!(self.progress, Progress::Idle | Progress::Step(_)) {
            return;
        }
        let now = periph.clock.now_ms();
        if let Some(hook) = self.abort_hook {
            hook(&mut self.instance, periph);
        }
        self.result.abort();
        self.enter(Progress::Aborted, now);
    }

    fn advance(&mut self, next: usize, now: u32) {
        if next == N {
            log::info!("{}: passed", self.name);
            self.result.pass();
            self.enter(Progress::Finished, now);
        } else {
            self.enter(Progress::Step(next), now);
        }
    }

    fn enter(&mut self, progress: Progress, now: u32) {
        if self.progress != progress {
            log::debug!("{}: {:?} -> {:?}", self.name, self.progress, progress);
        }
        self.progress = progress;
        self.entered_ms = now;
    }

    fn push_notification(&mut self, ui: &dyn Notifier) {
        let data = BaseData::new(self.phase, self.result.serialize());
        if self.last_sent != Some(data) {
            ui.notify(data);
            self.last_sent = Some(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::LoopMark;
    use crate::testutil::Fixture;
    use fabrik_protocol::PhaseData;

    fn tick<S, R: FsmResult, const N: usize>(fx: &mut Fixture, part: &mut Part<S, R, N>) -> bool {
        let (mut periph, bridge) = fx.split();
        part.tick(&mut periph, bridge)
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct ToyResult {
        state: u8,
        value: u8,
    }

    impl FsmResult for ToyResult {
        fn serialize(&self) -> PhaseData {
            [self.state, self.value, 0, 0]
        }

        fn deserialize(data: PhaseData) -> Self {
            ToyResult {
                state: data[0],
                value: data[1],
            }
        }

        fn pass(&mut self) {
            self.state = 1;
        }

        fn fail(&mut self) {
            self.state = 2;
        }

        fn abort(&mut self) {
            self.state = 3;
        }
    }

    #[derive(Default)]
    struct Toy {
        laps: u8,
        waits: u8,
    }

    fn step_mark(_s: &mut Toy, _r: &mut ToyResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        Outcome::MarkLoop(LoopMark::new(0))
    }

    fn step_work(s: &mut Toy, r: &mut ToyResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        s.laps += 1;
        r.value = s.laps;
        Outcome::Continue
    }

    fn step_loop(s: &mut Toy, _r: &mut ToyResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if s.laps < 3 {
            Outcome::JumpBack(LoopMark::new(0))
        } else {
            Outcome::Continue
        }
    }

    fn step_wait(s: &mut Toy, _r: &mut ToyResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        s.waits += 1;
        if s.waits < 2 {
            Outcome::Repeat
        } else {
            Outcome::Continue
        }
    }

    fn step_fail(_s: &mut Toy, _r: &mut ToyResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        Outcome::Fail
    }

    fn step_bad_jump(_s: &mut Toy, _r: &mut ToyResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        Outcome::JumpBack(LoopMark::new(5))
    }

    #[test]
    fn loops_run_the_marked_section_again() {
        let mut fx = Fixture::new();
        let mut part: Part<Toy, ToyResult, 4> = Part::new(
            "toy",
            Phase::Prepare,
            [step_mark, step_work, step_loop, step_wait],
            Toy::default(),
        )
        .with_dwell_ms(0);

        let mut running = true;
        for _ in 0..32 {
            fx.clock.advance(50);
            running = tick(&mut fx, &mut part);
            if !running {
                break;
            }
        }
        assert!(!running);
        assert_eq!(part.result(), TestResult::Passed);
        // the work step ran once per lap
        assert_eq!(part.instance.laps, 3);
        assert_eq!(part.instance.waits, 2);
    }

    #[test]
    fn terminal_state_dwells_before_releasing() {
        let mut fx = Fixture::new();
        let mut part: Part<Toy, ToyResult, 1> =
            Part::new("toy", Phase::Prepare, [step_fail], Toy::default()).with_dwell_ms(200);

        assert!(tick(&mut fx, &mut part));
        assert_eq!(part.result(), TestResult::Failed);
        fx.clock.advance(100);
        assert!(tick(&mut fx, &mut part));
        fx.clock.advance(150);
        assert!(!tick(&mut fx, &mut part));
        // once released, it stays released
        assert!(!tick(&mut fx, &mut part));
    }

    #[test]
    fn user_abort_is_surfaced_as_skipped() {
        let mut fx = Fixture::new();
        let mut part: Part<Toy, ToyResult, 2> =
            Part::new("toy", Phase::Prepare, [step_wait, step_wait], Toy::default())
                .with_dwell_ms(0);

        assert!(tick(&mut fx, &mut part));
        fx.bridge.respond(Phase::Prepare, Response::Abort);
        assert!(!tick(&mut fx, &mut part));
        assert_eq!(part.result(), TestResult::Skipped);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "unset loop mark"))]
    fn jump_to_unset_mark_is_rejected() {
        let mut fx = Fixture::new();
        let mut part: Part<Toy, ToyResult, 1> =
            Part::new("toy", Phase::Prepare, [step_bad_jump], Toy::default()).with_dwell_ms(0);
        tick(&mut fx, &mut part);
    }

    #[test]
    fn notifications_are_deduplicated() {
        let mut fx = Fixture::new();
        let mut part: Part<Toy, ToyResult, 2> =
            Part::new("toy", Phase::Prepare, [step_wait, step_wait], Toy::default())
                .with_dwell_ms(0);

        tick(&mut fx, &mut part);
        assert!(fx.bridge.take_notification().is_some());
        tick(&mut fx, &mut part);
        // nothing changed on screen, so nothing new was pushed
        assert!(fx.bridge.take_notification().is_none());
    }
}
