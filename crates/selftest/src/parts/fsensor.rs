//! Filament sensor calibration.
//!
//! Two calibration passes, one without filament and one with, separated
//! by a user-driven unload loop (`MarkLoop(0)`) and an insertion loop
//! (`MarkLoop(1)`) that restarts if the filament is pulled back out
//! before the user confirms.

use fabrik_protocol::{Phase, PhaseData, Response};

use crate::hal::FilamentState;
use crate::outcome::{LoopMark, Outcome};
use crate::part::{Part, StepCtx};
use crate::result::{FsmResult, SubtestState};

pub struct FsensorConfig {
    pub name: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FsensorResult {
    pub state: SubtestState,
    pub inserted: bool,
}

impl FsmResult for FsensorResult {
    fn serialize(&self) -> PhaseData {
        [self.state as u8, self.inserted as u8, 0, 0]
    }

    fn deserialize(data: PhaseData) -> Self {
        FsensorResult {
            state: SubtestState::from_u8(data[0]),
            inserted: data[1] != 0,
        }
    }

    fn pass(&mut self) {
        self.state = SubtestState::Ok;
    }

    fn fail(&mut self) {
        self.state = SubtestState::NotGood;
    }

    fn abort(&mut self) {
        self.state = SubtestState::Undef;
    }
}

pub struct FsensorTest<'c> {
    cfg: &'c FsensorConfig,
    unloading: bool,
}

pub const STEP_COUNT: usize = 12;

pub type FsensorPart<'c> = Part<FsensorTest<'c>, FsensorResult, STEP_COUNT>;

pub fn part(cfg: &FsensorConfig) -> FsensorPart<'_> {
    Part::new(
        cfg.name,
        Phase::FSensorAskUnload,
        [
            FsensorTest::ask_mark,
            FsensorTest::ask_wait,
            FsensorTest::unload_wait,
            FsensorTest::unload_confirm,
            FsensorTest::calibrate,
            FsensorTest::calibrate_wait,
            FsensorTest::insertion_mark,
            FsensorTest::insertion_wait,
            FsensorTest::insertion_ok,
            FsensorTest::insertion_calibrate,
            FsensorTest::insertion_calibrate_wait,
            FsensorTest::enforce_remove,
        ],
        FsensorTest {
            cfg,
            unloading: false,
        },
    )
    // A half-done calibration is worse than none.
    .with_abort_hook(|_s, periph| periph.fsensor.invalidate_calibration())
}

impl<'c> FsensorTest<'c> {
    fn ask_mark(s: &mut FsensorTest<'c>, r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::FSensorAskUnload);
        r.state = SubtestState::Running;
        s.unloading = false;
        Outcome::MarkLoop(LoopMark::new(0))
    }

    fn ask_wait(s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        match ctx.button {
            // user says there is no filament in the printer
            Response::Continue => Outcome::Continue,
            Response::Unload => {
                log::info!("{}: unloading filament", s.cfg.name);
                ctx.periph.fsensor.unload();
                s.unloading = true;
                Outcome::Continue
            }
            _ => Outcome::Repeat,
        }
    }

    fn unload_wait(s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if !s.unloading {
            return Outcome::Continue;
        }
        if ctx.periph.fsensor.unload_active() {
            Outcome::Repeat
        } else {
            ctx.set_phase(Phase::FSensorUnloadConfirm);
            Outcome::Continue
        }
    }

    fn unload_confirm(s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if !s.unloading {
            return Outcome::Continue;
        }
        match ctx.button {
            // filament still in; back to the question
            Response::Yes => Outcome::JumpBack(LoopMark::new(0)),
            Response::No => Outcome::Continue,
            _ => Outcome::Repeat,
        }
    }

    fn calibrate(s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::FSensorCalibrate);
        log::info!("{}: calibrating without filament", s.cfg.name);
        ctx.periph.fsensor.request_calibration(false);
        Outcome::Continue
    }

    fn calibrate_wait(s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if !ctx.state_visible() || !ctx.periph.fsensor.calibration_finished() {
            return Outcome::Repeat;
        }
        match ctx.periph.fsensor.state() {
            FilamentState::NoFilament => Outcome::Continue,
            state => {
                log::error!("{}: calibration ended in {:?}", s.cfg.name, state);
                ctx.set_phase(Phase::FSensorFail);
                Outcome::Fail
            }
        }
    }

    fn insertion_mark(_s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::FSensorInsertionWait);
        Outcome::MarkLoop(LoopMark::new(1))
    }

    fn insertion_wait(_s: &mut FsensorTest<'c>, r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.periph.fsensor.state() == FilamentState::HasFilament {
            r.inserted = true;
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn insertion_ok(_s: &mut FsensorTest<'c>, r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::FSensorInsertionOk);
        if ctx.periph.fsensor.state() != FilamentState::HasFilament {
            // pulled back out before confirming
            r.inserted = false;
            return Outcome::JumpBack(LoopMark::new(1));
        }
        if ctx.button == Response::Continue {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn insertion_calibrate(s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::FSensorInsertionCalibrate);
        log::info!("{}: calibrating with filament", s.cfg.name);
        ctx.periph.fsensor.request_calibration(true);
        Outcome::Continue
    }

    fn insertion_calibrate_wait(
        s: &mut FsensorTest<'c>,
        _r: &mut FsensorResult,
        ctx: &mut StepCtx<'_, '_>,
    ) -> Outcome {
        if !ctx.state_visible() || !ctx.periph.fsensor.calibration_finished() {
            return Outcome::Repeat;
        }
        match ctx.periph.fsensor.state() {
            FilamentState::HasFilament => Outcome::Continue,
            state => {
                log::error!("{}: calibration ended in {:?}", s.cfg.name, state);
                ctx.set_phase(Phase::FSensorFail);
                Outcome::Fail
            }
        }
    }

    fn enforce_remove(_s: &mut FsensorTest<'c>, _r: &mut FsensorResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::FSensorEnforceRemove);
        if ctx.periph.fsensor.state() == FilamentState::NoFilament {
            ctx.set_phase(Phase::FSensorDone);
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn result_roundtrip(state in 0u8..4, inserted: bool) {
            let result = FsensorResult {
                state: SubtestState::from_u8(state),
                inserted,
            };
            prop_assert_eq!(FsensorResult::deserialize(result.serialize()), result);
        }
    }
}
