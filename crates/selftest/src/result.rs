use fabrik_protocol::PhaseData;
use serde::{Deserialize, Serialize};

/// Persisted verdict of one sub-test. Two bits in the packed record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TestResult {
    #[default]
    Unknown = 0,
    Passed = 1,
    Failed = 2,
    Skipped = 3,
}

impl TestResult {
    pub fn from_bits(bits: u8) -> TestResult {
        match bits & 0b11 {
            1 => TestResult::Passed,
            2 => TestResult::Failed,
            3 => TestResult::Skipped,
            _ => TestResult::Unknown,
        }
    }

    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// UI-facing state of one checked component within a running sub-test,
/// as it appears inside a serialized [`PhaseData`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SubtestState {
    #[default]
    Undef = 0,
    Running = 1,
    Ok = 2,
    NotGood = 3,
}

impl SubtestState {
    pub fn from_u8(raw: u8) -> SubtestState {
        match raw {
            1 => SubtestState::Running,
            2 => SubtestState::Ok,
            3 => SubtestState::NotGood,
            _ => SubtestState::Undef,
        }
    }
}

/// The live result value of one test family.
///
/// One value exists per running procedure; the driver mutates it through
/// the terminal hooks and ships it to the UI through `serialize`. The
/// codec must be lossless: `deserialize(serialize(x)) == x` for every
/// value the family can produce.
pub trait FsmResult: Default + Clone + PartialEq {
    fn serialize(&self) -> PhaseData;
    fn deserialize(data: PhaseData) -> Self;

    /// The procedure ran to its end successfully.
    fn pass(&mut self);
    /// The procedure decided the hardware is out of tolerance.
    fn fail(&mut self);
    /// The user gave up. Surfaced as `Skipped`, never `Failed`, so an
    /// abort cannot regress a previously passing record.
    fn abort(&mut self);
}
