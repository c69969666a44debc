//! Load-cell tap detection: cool the nozzle, lift Z, count the user
//! down and expect a tap in the right force window before the timeout.
//!
//! Touching the nozzle during the countdown restarts the ask/countdown
//! cycle (the `MarkLoop(0)` loop).

use fabrik_protocol::{Phase, PhaseData, Response};

use crate::hal::{AxisId, HeaterId};
use crate::outcome::{LoopMark, Outcome};
use crate::part::{Part, StepCtx};
use crate::parts::progress_pct;
use crate::result::{FsmResult, SubtestState};

pub struct LoadcellConfig {
    pub name: &'static str,
    /// Nozzle must be below this before the user is asked to touch it.
    pub cool_temp_c: f32,
    pub countdown_sec: u8,
    /// Load seen during the countdown that means "user is already
    /// touching", which restarts the cycle.
    pub countdown_load_error_g: i32,
    pub tap_min_g: i32,
    pub tap_max_g: i32,
    pub tap_timeout_ms: u32,
    /// Z lift before the test so the user can reach the nozzle.
    pub z_extra_pos_mm: f32,
    pub z_feedrate_mm_s: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadcellResult {
    pub state: SubtestState,
    pub countdown: u8,
    pub progress: u8,
    pub pressed: bool,
}

impl FsmResult for LoadcellResult {
    fn serialize(&self) -> PhaseData {
        [
            self.state as u8,
            self.countdown,
            self.progress,
            self.pressed as u8,
        ]
    }

    fn deserialize(data: PhaseData) -> Self {
        LoadcellResult {
            state: SubtestState::from_u8(data[0]),
            countdown: data[1],
            progress: data[2],
            pressed: data[3] != 0,
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

pub struct LoadcellTest<'c> {
    cfg: &'c LoadcellConfig,
}

pub const STEP_COUNT: usize = 9;

pub type LoadcellPart<'c> = Part<LoadcellTest<'c>, LoadcellResult, STEP_COUNT>;

pub fn part(cfg: &LoadcellConfig) -> LoadcellPart<'_> {
    Part::new(
        cfg.name,
        Phase::LoadcellPrepare,
        [
            LoadcellTest::prepare,
            LoadcellTest::wait_move,
            LoadcellTest::cooldown,
            LoadcellTest::ask_mark,
            LoadcellTest::ask_wait,
            LoadcellTest::countdown_init,
            LoadcellTest::countdown,
            LoadcellTest::tap_init,
            LoadcellTest::tap_wait,
        ],
        LoadcellTest { cfg },
    )
}

impl<'c> LoadcellTest<'c> {
    fn prepare(s: &mut LoadcellTest<'c>, r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::LoadcellPrepare);
        r.state = SubtestState::Running;
        ctx.periph.thermal.set_target_c(HeaterId::Nozzle, 0.0);
        ctx.periph
            .motion
            .move_to(AxisId::Z, s.cfg.z_extra_pos_mm, s.cfg.z_feedrate_mm_s);
        Outcome::Continue
    }

    fn wait_move(_s: &mut LoadcellTest<'c>, _r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.periph.motion.queue_drained() {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn cooldown(s: &mut LoadcellTest<'c>, r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::LoadcellCooldown);
        let temp = ctx.periph.thermal.temperature_c(HeaterId::Nozzle);
        if temp > s.cfg.cool_temp_c {
            r.progress = progress_pct(s.cfg.cool_temp_c as u32, temp as u32);
            Outcome::Repeat
        } else {
            Outcome::Continue
        }
    }

    fn ask_mark(_s: &mut LoadcellTest<'c>, _r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::LoadcellAskTap);
        Outcome::MarkLoop(LoopMark::new(0))
    }

    fn ask_wait(_s: &mut LoadcellTest<'c>, _r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        if ctx.button == Response::Continue {
            ctx.periph.loadcell.tare();
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn countdown_init(s: &mut LoadcellTest<'c>, r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::LoadcellCountdown);
        r.countdown = s.cfg.countdown_sec;
        Outcome::Continue
    }

    fn countdown(s: &mut LoadcellTest<'c>, r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let load = ctx.periph.loadcell.load_g();
        if load.abs() > s.cfg.countdown_load_error_g {
            log::warn!("{}: load {} g during countdown, restarting", s.cfg.name, load);
            return Outcome::JumpBack(LoopMark::new(0));
        }
        let elapsed_sec = (ctx.in_state_ms() / 1000) as u8;
        r.countdown = s.cfg.countdown_sec.saturating_sub(elapsed_sec);
        if r.countdown == 0 {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn tap_init(_s: &mut LoadcellTest<'c>, _r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::LoadcellTap);
        Outcome::Continue
    }

    fn tap_wait(s: &mut LoadcellTest<'c>, r: &mut LoadcellResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        r.progress = progress_pct(ctx.in_state_ms(), s.cfg.tap_timeout_ms);
        let load = ctx.periph.loadcell.load_g();
        if load >= s.cfg.tap_min_g && load <= s.cfg.tap_max_g {
            log::info!("{}: tap of {} g detected", s.cfg.name, load);
            r.pressed = true;
            ctx.set_phase(Phase::LoadcellDone);
            Outcome::Continue
        } else if ctx.in_state_ms() >= s.cfg.tap_timeout_ms {
            log::error!("{}: no tap within {} ms", s.cfg.name, s.cfg.tap_timeout_ms);
            ctx.set_phase(Phase::LoadcellFail);
            Outcome::Fail
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
        fn result_roundtrip(state in 0u8..4, countdown in 0u8..10, progress in 0u8..=100, pressed: bool) {
            let result = LoadcellResult {
                state: SubtestState::from_u8(state),
                countdown,
                progress,
                pressed,
            };
            prop_assert_eq!(LoadcellResult::deserialize(result.serialize()), result);
        }
    }
}
