//! Fan validation: both fans at full PWM, RPM sampled and checked
//! against per-fan bands, then spun down and checked for stop.

use fabrik_protocol::{Phase, PhaseData};
use heapless::Vec;

use crate::hal::FanId;
use crate::outcome::Outcome;
use crate::part::{Part, StepCtx};
use crate::parts::progress_pct;
use crate::result::{FsmResult, SubtestState};

/// RPM below which a fan counts as stopped; tachometers jitter near
/// zero, so an exact zero check would flake.
const STOPPED_RPM: u16 = 100;

const SAMPLES: usize = 8;

pub struct FanConfig {
    pub name: &'static str,
    pub rpm_min_print: u16,
    pub rpm_max_print: u16,
    pub rpm_min_heatbreak: u16,
    pub rpm_max_heatbreak: u16,
    pub spinup_ms: u32,
    pub spindown_ms: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FanResult {
    pub print: SubtestState,
    pub heatbreak: SubtestState,
    pub progress: u8,
}

impl FsmResult for FanResult {
    fn serialize(&self) -> PhaseData {
        [self.print as u8, self.heatbreak as u8, self.progress, 0]
    }

    fn deserialize(data: PhaseData) -> Self {
        FanResult {
            print: SubtestState::from_u8(data[0]),
            heatbreak: SubtestState::from_u8(data[1]),
            progress: data[2],
        }
    }

    fn pass(&mut self) {
        self.print = SubtestState::Ok;
        self.heatbreak = SubtestState::Ok;
        self.progress = 100;
    }

    fn fail(&mut self) {
        if self.print != SubtestState::Ok {
            self.print = SubtestState::NotGood;
        }
        if self.heatbreak != SubtestState::Ok {
            self.heatbreak = SubtestState::NotGood;
        }
    }

    fn abort(&mut self) {
        self.print = SubtestState::Undef;
        self.heatbreak = SubtestState::Undef;
    }
}

pub struct FanTest<'c> {
    cfg: &'c FanConfig,
    samples: Vec<(u16, u16), SAMPLES>,
}

pub const STEP_COUNT: usize = 6;

pub type FanPart<'c> = Part<FanTest<'c>, FanResult, STEP_COUNT>;

pub fn part(cfg: &FanConfig) -> FanPart<'_> {
    Part::new(
        cfg.name,
        Phase::Fans,
        [
            FanTest::start,
            FanTest::wait_spinup,
            FanTest::sample,
            FanTest::evaluate,
            FanTest::spindown,
            FanTest::wait_stop,
        ],
        FanTest {
            cfg,
            samples: Vec::new(),
        },
    )
    .with_abort_hook(|_s, periph| periph.fans.restore_auto())
}

impl<'c> FanTest<'c> {
    fn start(_s: &mut FanTest<'c>, r: &mut FanResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(Phase::Fans);
        r.print = SubtestState::Running;
        r.heatbreak = SubtestState::Running;
        ctx.periph.fans.set_pwm(FanId::Print, 255);
        ctx.periph.fans.set_pwm(FanId::Heatbreak, 255);
        Outcome::Continue
    }

    fn wait_spinup(s: &mut FanTest<'c>, r: &mut FanResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        r.progress = progress_pct(ctx.in_state_ms(), s.cfg.spinup_ms) / 2;
        if ctx.in_state_ms() < s.cfg.spinup_ms {
            Outcome::Repeat
        } else {
            Outcome::Continue
        }
    }

    fn sample(s: &mut FanTest<'c>, _r: &mut FanResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let pair = (
            ctx.periph.fans.rpm(FanId::Print),
            ctx.periph.fans.rpm(FanId::Heatbreak),
        );
        if s.samples.push(pair).is_err() {
            Outcome::Continue
        } else if s.samples.is_full() {
            Outcome::Continue
        } else {
            Outcome::Repeat
        }
    }

    fn evaluate(s: &mut FanTest<'c>, r: &mut FanResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let count = s.samples.len() as u32;
        let (print_sum, heatbreak_sum) = s
            .samples
            .iter()
            .fold((0u32, 0u32), |(p, h), (ps, hs)| (p + *ps as u32, h + *hs as u32));
        let print_avg = (print_sum / count) as u16;
        let heatbreak_avg = (heatbreak_sum / count) as u16;

        r.print = if print_avg >= s.cfg.rpm_min_print && print_avg <= s.cfg.rpm_max_print {
            SubtestState::Ok
        } else {
            SubtestState::NotGood
        };
        r.heatbreak =
            if heatbreak_avg >= s.cfg.rpm_min_heatbreak && heatbreak_avg <= s.cfg.rpm_max_heatbreak {
                SubtestState::Ok
            } else {
                SubtestState::NotGood
            };

        if r.print == SubtestState::NotGood || r.heatbreak == SubtestState::NotGood {
            log::error!(
                "{}: print {} rpm, heatbreak {} rpm out of range",
                s.cfg.name,
                print_avg,
                heatbreak_avg
            );
            ctx.periph.fans.set_pwm(FanId::Print, 0);
            ctx.periph.fans.set_pwm(FanId::Heatbreak, 0);
            ctx.periph.fans.restore_auto();
            ctx.set_phase(Phase::FansFail);
            Outcome::Fail
        } else {
            log::info!(
                "{}: print {} rpm, heatbreak {} rpm",
                s.cfg.name,
                print_avg,
                heatbreak_avg
            );
            Outcome::Continue
        }
    }

    fn spindown(_s: &mut FanTest<'c>, _r: &mut FanResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.periph.fans.set_pwm(FanId::Print, 0);
        ctx.periph.fans.set_pwm(FanId::Heatbreak, 0);
        Outcome::Continue
    }

    fn wait_stop(s: &mut FanTest<'c>, r: &mut FanResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        r.progress = 50 + progress_pct(ctx.in_state_ms(), s.cfg.spindown_ms) / 2;
        if ctx.in_state_ms() < s.cfg.spindown_ms {
            return Outcome::Repeat;
        }
        let print = ctx.periph.fans.rpm(FanId::Print);
        let heatbreak = ctx.periph.fans.rpm(FanId::Heatbreak);
        ctx.periph.fans.restore_auto();
        if print > STOPPED_RPM || heatbreak > STOPPED_RPM {
            log::error!("{}: fans still spinning after spindown", s.cfg.name);
            ctx.set_phase(Phase::FansFail);
            Outcome::Fail
        } else {
            Outcome::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn result_roundtrip(print in 0u8..4, heatbreak in 0u8..4, progress in 0u8..=100) {
            let result = FanResult {
                print: SubtestState::from_u8(print),
                heatbreak: SubtestState::from_u8(heatbreak),
                progress,
            };
            prop_assert_eq!(FanResult::deserialize(result.serialize()), result);
        }
    }
}
