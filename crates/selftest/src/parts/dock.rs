//! Tool dock alignment check.
//!
//! Measures how far the dock sits from its nominal position, then runs a
//! number of park/pick cycles (the `MarkLoop(0)` loop) to prove the
//! coupling is reliable. A dock measured far outside its physical
//! envelope is a machine-level fault, not a failed sub-test.

use fabrik_protocol::{ExtendedData, Phase, PhaseData, Response};

use crate::hal::Fault;
use crate::outcome::{LoopMark, Outcome};
use crate::part::{Part, StepCtx};
use crate::parts::progress_pct;
use crate::result::{FsmResult, SubtestState};

pub struct DockConfig {
    pub name: &'static str,
    pub num_cycles: u8,
    /// Offset beyond this fails the sub-test.
    pub tolerance_mm: f32,
    /// Offset beyond this means the dock is somewhere it physically
    /// cannot be; the whole run terminates.
    pub fatal_distance_mm: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DockResult {
    pub state: SubtestState,
    pub cycles: u8,
    pub progress: u8,
}

impl FsmResult for DockResult {
    fn serialize(&self) -> PhaseData {
        [self.state as u8, self.cycles, self.progress, 0]
    }

    fn deserialize(data: PhaseData) -> Self {
        DockResult {
            state: SubtestState::from_u8(data[0]),
            cycles: data[1],
            progress: data[2],
        }
    }

    fn pass(&mut self) {
        self.state = SubtestState::Ok;
        self.progress = 100;
    }

    fn fail(&mut self) {
        self.state = SubtestState::NotGood;
    }

    fn abort(&mut self) {
        self.state = SubtestState::Undef;
    }
}

pub struct DockTest<'c> {
    cfg: &'c DockConfig,
    offset_mm: (f32, f32),
}

pub const STEP_COUNT: usize = 10;

pub type DockPart<'c> = Part<DockTest<'c>, DockResult, STEP_COUNT>;

pub fn part(cfg: &DockConfig) -> DockPart<'_> {
    Part::new(
        cfg.name,
        Phase::DockPrepare,
        [
            DockTest::prepare,
            DockTest::remove_pins,
            DockTest::measure,
            DockTest::cycle_mark,
            DockTest::park,
            DockTest::park_wait,
            DockTest::pick,
            DockTest::pick_wait,
            DockTest::cycle_check,
            DockTest::done,
        ],
        DockTest {
            cfg,
            offset_mm: (0.0, 0.0),
        },
    )
}

impl<'c> DockTest<'c> {
    fn prepare(_s: &mut DockTest<'c>, r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::DockPrepare);
        r.state = SubtestState::Running;
        Outcome::Continue
    }

    fn remove_pins(_s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::DockRemovePins);
        if ctx.button == Response::Continue {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn measure(s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let (x, y) = ctx.periph.toolchanger.dock_offset_mm();
        s.offset_mm = (x, y);
        let distance = libm::sqrtf(x * x + y * y);
        if distance > s.cfg.fatal_distance_mm {
            log::error!("{}: dock offset {} mm, machine unusable", s.cfg.name, distance);
            ctx.raise_fatal(Fault::DockFarOutOfBounds { distance_mm: distance });
            return Outcome::Fail;
        }
        if distance > s.cfg.tolerance_mm {
            log::error!(
                "{}: dock offset {} mm exceeds {} mm",
                s.cfg.name,
                distance,
                s.cfg.tolerance_mm
            );
            ctx.set_phase(Phase::DockFail);
            return Outcome::Fail;
        }
        log::info!("{}: dock offset ({}, {}) mm", s.cfg.name, x, y);
        Outcome::Continue
    }

    fn cycle_mark(_s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::DockCycle);
        Outcome::MarkLoop(LoopMark::new(0))
    }

    fn park(_s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.periph.toolchanger.park();
        Outcome::Continue
    }

    fn park_wait(_s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.periph.motion.queue_drained() && ctx.periph.toolchanger.docked() {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn pick(_s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.periph.toolchanger.pick();
        Outcome::Continue
    }

    fn pick_wait(_s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.periph.motion.queue_drained() && !ctx.periph.toolchanger.docked() {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn cycle_check(s: &mut DockTest<'c>, r: &mut DockResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        r.cycles += 1;
        r.progress = progress_pct(r.cycles as u32, s.cfg.num_cycles as u32);
        if r.cycles < s.cfg.num_cycles {
            Outcome::JumpBack(LoopMark::new(0))
        } else {
            Outcome::Continue
        }
    }

    fn done(s: &mut DockTest<'c>, _r: &mut DockResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let (x_mm, y_mm) = s.offset_mm;
        ctx.ui.publish_extended(&ExtendedData::DockOffsets {
            x_mm,
            y_mm,
            cycles: s.cfg.num_cycles,
        });
        ctx.set_phase(Phase::DockDone);
        Outcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn result_roundtrip(state in 0u8..4, cycles in 0u8..10, progress in 0u8..=100) {
            let result = DockResult {
                state: SubtestState::from_u8(state),
                cycles,
                progress,
            };
            prop_assert_eq!(DockResult::deserialize(result.serialize()), result);
        }
    }
}
