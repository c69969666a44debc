//! Axis homing and length measurement.
//!
//! Homes the axis, then drives it end to end once per entry in the
//! feedrate table and checks the measured travel against the expected
//! length band. The feedrate loop is a `MarkLoop(0)` cycle.

use fabrik_protocol::{Phase, PhaseData};

use crate::hal::AxisId;
use crate::outcome::{LoopMark, Outcome};
use crate::part::{Part, StepCtx};
use crate::parts::progress_pct;
use crate::result::{FsmResult, SubtestState};

pub struct AxisConfig {
    pub name: &'static str,
    pub axis: AxisId,
    pub length_mm: f32,
    pub length_min_mm: f32,
    pub length_max_mm: f32,
    /// One measurement pass per entry.
    pub fr_table_mm_s: &'static [f32],
    /// Extra travel commanded past the nominal end, so the axis always
    /// reaches its physical stop.
    pub end_gap_mm: f32,
    pub park: bool,
    pub park_pos_mm: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AxisResult {
    pub state: SubtestState,
    pub progress: u8,
    /// Measured length in tenths of a millimetre.
    pub length_x10: u16,
}

impl FsmResult for AxisResult {
    fn serialize(&self) -> PhaseData {
        let [lo, hi] = self.length_x10.to_le_bytes();
        [self.state as u8, self.progress, lo, hi]
    }

    fn deserialize(data: PhaseData) -> Self {
        AxisResult {
            state: SubtestState::from_u8(data[0]),
            progress: data[1],
            length_x10: u16::from_le_bytes([data[2], data[3]]),
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

pub struct AxisTest<'c> {
    cfg: &'c AxisConfig,
    fr_index: usize,
    measured_mm: f32,
}

pub const STEP_COUNT: usize = 11;

pub type AxisPart<'c> = Part<AxisTest<'c>, AxisResult, STEP_COUNT>;

pub fn part(cfg: &AxisConfig) -> AxisPart<'_> {
    Part::new(
        cfg.name,
        Phase::AxisHome,
        [
            AxisTest::home,
            AxisTest::home_wait,
            AxisTest::mark_pass,
            AxisTest::move_out,
            AxisTest::wait_out,
            AxisTest::move_back,
            AxisTest::wait_back,
            AxisTest::next_feedrate,
            AxisTest::check_length,
            AxisTest::park,
            AxisTest::park_wait,
        ],
        AxisTest {
            cfg,
            fr_index: 0,
            measured_mm: 0.0,
        },
    )
}

impl<'c> AxisTest<'c> {
    fn feedrate(&self) -> f32 {
        self.cfg.fr_table_mm_s[self.fr_index]
    }

    fn home(s: &mut AxisTest<'c>, r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::AxisHome);
        r.state = SubtestState::Running;
        ctx.periph.motion.home(s.cfg.axis);
        Outcome::Continue
    }

    fn home_wait(_s: &mut AxisTest<'c>, _r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.periph.motion.queue_drained() {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn mark_pass(_s: &mut AxisTest<'c>, _r: &mut AxisResult, _ctx: &mut StepCtx<'_, '_>) -> Outcome {
        Outcome::MarkLoop(LoopMark::new(0))
    }

    fn move_out(s: &mut AxisTest<'c>, _r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::AxisMeasure);
        let target = s.cfg.length_mm + s.cfg.end_gap_mm;
        ctx.periph.motion.move_to(s.cfg.axis, target, s.feedrate());
        Outcome::Continue
    }

    fn wait_out(s: &mut AxisTest<'c>, r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let pos = ctx.periph.motion.position_mm(s.cfg.axis);
        r.progress = progress_pct(pos as u32, s.cfg.length_mm as u32);
        if ctx.periph.motion.queue_drained() {
            // the far endstop cut the move short at the true length
            s.measured_mm = pos;
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn move_back(s: &mut AxisTest<'c>, _r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.periph.motion.move_to(s.cfg.axis, 0.0, s.feedrate());
        Outcome::Continue
    }

    fn wait_back(_s: &mut AxisTest<'c>, _r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.periph.motion.queue_drained() {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn next_feedrate(
        s: &mut AxisTest<'c>,
        _r: &mut AxisResult,
        _ctx: &mut StepCtx<'_, '_>,
    ) -> Outcome {
        s.fr_index += 1;
        if s.fr_index < s.cfg.fr_table_mm_s.len() {
            Outcome::JumpBack(LoopMark::new(0))
        } else {
            s.fr_index = s.cfg.fr_table_mm_s.len() - 1;
            Outcome::Continue
        }
    }

    fn check_length(s: &mut AxisTest<'c>, r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        r.length_x10 = (s.measured_mm * 10.0) as u16;
        if s.measured_mm >= s.cfg.length_min_mm && s.measured_mm <= s.cfg.length_max_mm {
            log::info!("{}: measured {} mm", s.cfg.name, s.measured_mm);
            ctx.periph.config.set_axis_length(s.cfg.axis, s.measured_mm);
            Outcome::Continue
        } else {
            log::error!(
                "{}: measured {} mm, expected {}..{} mm",
                s.cfg.name,
                s.measured_mm,
                s.cfg.length_min_mm,
                s.cfg.length_max_mm
            );
            ctx.set_phase(Phase::AxisFail);
            Outcome::Fail
        }
    }

    fn park(s: &mut AxisTest<'c>, _r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if s.cfg.park {
            ctx.periph
                .motion
                .move_to(s.cfg.axis, s.cfg.park_pos_mm, s.feedrate());
        }
        Outcome::Continue
    }

    fn park_wait(s: &mut AxisTest<'c>, _r: &mut AxisResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if !s.cfg.park || ctx.periph.motion.queue_drained() {
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
        fn result_roundtrip(state in 0u8..4, progress in 0u8..=100, length in 0u16..4000) {
            let result = AxisResult {
                state: SubtestState::from_u8(state),
                progress,
                length_x10: length,
            };
            prop_assert_eq!(AxisResult::deserialize(result.serialize()), result);
        }
    }
}
