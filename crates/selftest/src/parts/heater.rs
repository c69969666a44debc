//! Heater characterization: cool down to a known start, heat at full
//! target for a fixed time, check the reached temperature against the
//! expected band. Covers the nozzle and the bed through the config.

use fabrik_protocol::{ExtendedData, Phase, PhaseData};

use crate::hal::HeaterId;
use crate::outcome::Outcome;
use crate::part::{Part, StepCtx};
use crate::parts::progress_pct;
use crate::result::{FsmResult, SubtestState};

pub struct HeaterConfig {
    pub name: &'static str,
    pub heater: HeaterId,
    /// The test only starts once the heater has cooled below this.
    pub start_temp_c: f32,
    pub target_temp_c: f32,
    pub heat_time_ms: u32,
    /// Band the temperature must be in when `heat_time_ms` is up.
    pub heat_min_temp_c: f32,
    pub heat_max_temp_c: f32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeaterResult {
    pub state: SubtestState,
    pub progress: u8,
    /// Current temperature in half-degrees, for the live progress bar.
    pub temp_half_c: u16,
}

impl FsmResult for HeaterResult {
    fn serialize(&self) -> PhaseData {
        let [lo, hi] = self.temp_half_c.to_le_bytes();
        [self.state as u8, self.progress, lo, hi]
    }

    fn deserialize(data: PhaseData) -> Self {
        HeaterResult {
            state: SubtestState::from_u8(data[0]),
            progress: data[1],
            temp_half_c: u16::from_le_bytes([data[2], data[3]]),
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

pub struct HeaterTest<'c> {
    cfg: &'c HeaterConfig,
    heat_start_temp_c: f32,
}

pub const STEP_COUNT: usize = 6;

pub type HeaterPart<'c> = Part<HeaterTest<'c>, HeaterResult, STEP_COUNT>;

/// Nozzle and bed run concurrently, so each reports on its own phase;
/// a shared one would leave the UI unable to tell the payloads apart.
fn phases(heater: HeaterId) -> (Phase, Phase) {
    match heater {
        HeaterId::Nozzle => (Phase::Nozzle, Phase::NozzleFail),
        HeaterId::Bed => (Phase::Bed, Phase::BedFail),
    }
}

pub fn part(cfg: &HeaterConfig) -> HeaterPart<'_> {
    Part::new(
        cfg.name,
        phases(cfg.heater).0,
        [
            HeaterTest::setup,
            HeaterTest::cooldown,
            HeaterTest::enable,
            HeaterTest::heat_wait,
            HeaterTest::evaluate,
            HeaterTest::restore,
        ],
        HeaterTest {
            cfg,
            heat_start_temp_c: 0.0,
        },
    )
    .with_abort_hook(|s, periph| periph.thermal.set_target_c(s.cfg.heater, 0.0))
}

impl<'c> HeaterTest<'c> {
    fn record_temp(&self, r: &mut HeaterResult, temp: f32) {
        r.temp_half_c = (temp * 2.0) as u16;
    }

    fn setup(s: &mut HeaterTest<'c>, r: &mut HeaterResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.set_phase(phases(s.cfg.heater).0);
        r.state = SubtestState::Running;
        ctx.periph.thermal.set_target_c(s.cfg.heater, 0.0);
        Outcome::Continue
    }

    fn cooldown(s: &mut HeaterTest<'c>, r: &mut HeaterResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let temp = ctx.periph.thermal.temperature_c(s.cfg.heater);
        s.record_temp(r, temp);
        if temp > s.cfg.start_temp_c {
            Outcome::Repeat
        } else {
            Outcome::Continue
        }
    }

    fn enable(s: &mut HeaterTest<'c>, _r: &mut HeaterResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        s.heat_start_temp_c = ctx.periph.thermal.temperature_c(s.cfg.heater);
        ctx.periph
            .thermal
            .set_target_c(s.cfg.heater, s.cfg.target_temp_c);
        log::info!("{}: heating to {} C", s.cfg.name, s.cfg.target_temp_c);
        Outcome::Continue
    }

    fn heat_wait(s: &mut HeaterTest<'c>, r: &mut HeaterResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let temp = ctx.periph.thermal.temperature_c(s.cfg.heater);
        s.record_temp(r, temp);
        r.progress = progress_pct(ctx.in_state_ms(), s.cfg.heat_time_ms);
        if ctx.in_state_ms() < s.cfg.heat_time_ms {
            Outcome::Repeat
        } else {
            Outcome::Continue
        }
    }

    fn evaluate(s: &mut HeaterTest<'c>, r: &mut HeaterResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        let temp = ctx.periph.thermal.temperature_c(s.cfg.heater);
        s.record_temp(r, temp);
        if temp < s.cfg.heat_min_temp_c || temp > s.cfg.heat_max_temp_c {
            log::error!(
                "{}: reached {} C, expected {}..{} C",
                s.cfg.name,
                temp,
                s.cfg.heat_min_temp_c,
                s.cfg.heat_max_temp_c
            );
            ctx.set_phase(phases(s.cfg.heater).1);
            return Outcome::Fail;
        }
        let heat_time_s = s.cfg.heat_time_ms as f32 / 1000.0;
        let rise_c_per_s = (temp - s.heat_start_temp_c) / heat_time_s;
        let overshoot = temp - s.cfg.target_temp_c;
        ctx.periph.config.set_heater_gain(s.cfg.heater, rise_c_per_s);
        ctx.ui.publish_extended(&ExtendedData::HeaterCharacteristics {
            rise_c_per_s,
            overshoot_c: if overshoot > 0.0 { overshoot } else { 0.0 },
            settle_s: heat_time_s,
        });
        Outcome::Continue
    }

    fn restore(s: &mut HeaterTest<'c>, _r: &mut HeaterResult, ctx: &mut StepCtx<'_, '_>) -> Outcome {
        ctx.periph.thermal.set_target_c(s.cfg.heater, 0.0);
        Outcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn result_roundtrip(state in 0u8..4, progress in 0u8..=100, temp in 0u16..700) {
            let result = HeaterResult {
                state: SubtestState::from_u8(state),
                progress,
                temp_half_c: temp,
            };
            prop_assert_eq!(HeaterResult::deserialize(result.serialize()), result);
        }
    }
}
