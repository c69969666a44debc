#![no_std]

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};

pub mod extended;

pub use extended::{ExtendedData, ExtendedTag, EXTENDED_MAX};

/// The 4-byte payload carried alongside every phase change.
///
/// Opaque to everything except the result type that produced it; the
/// matching codec is the only thing allowed to look inside.
pub type PhaseData = [u8; 4];

/// Identifies which dialog/progress screen the engine wants shown.
///
/// Sent to the UI thread as a plain `u8` together with a [`PhaseData`]
/// payload.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Prepare = 0,

    Fans,
    FansFail,

    LoadcellPrepare,
    LoadcellCooldown,
    LoadcellAskTap,
    LoadcellCountdown,
    LoadcellTap,
    LoadcellFail,
    LoadcellDone,

    AxisHome,
    AxisMeasure,
    AxisFail,

    Nozzle,
    NozzleFail,
    Bed,
    BedFail,

    FSensorAskUnload,
    FSensorUnloadConfirm,
    FSensorCalibrate,
    FSensorInsertionWait,
    FSensorInsertionOk,
    FSensorInsertionCalibrate,
    FSensorEnforceRemove,
    FSensorFail,
    FSensorDone,

    DockPrepare,
    DockRemovePins,
    DockCycle,
    DockFail,
    DockDone,

    Epilogue,
    Aborted,
}

impl Phase {
    pub fn from_u8(raw: u8) -> Option<Phase> {
        num_traits::FromPrimitive::from_u8(raw)
    }
}

/// A button the user pressed in response to the current phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Response {
    /// No response has arrived yet.
    #[default]
    None,
    Continue,
    Retry,
    Abort,
    Yes,
    No,
    Unload,
    Skip,
}

/// One notification as it travels to the UI thread: which screen to
/// show plus the serialized result driving it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseData {
    pub phase: Phase,
    pub data: PhaseData,
}

impl BaseData {
    pub fn new(phase: Phase, data: PhaseData) -> Self {
        BaseData { phase, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn phase_u8_roundtrip(raw in 0u8..=40) {
            if let Some(phase) = Phase::from_u8(raw) {
                prop_assert_eq!(phase as u8, raw);
            }
        }
    }

    #[test]
    fn unknown_phase_is_rejected() {
        assert_eq!(Phase::from_u8(0xff), None);
    }
}
