//! Self-test and calibration orchestration engine.
//!
//! Long-running hardware procedures (axis measurement, heater checks,
//! fan validation, load-cell tap detection, filament-sensor
//! calibration, tool-dock calibration) expressed as cooperative state
//! machines: everything runs from one periodic tick, nothing blocks,
//! and the only cross-thread state is the pair of UI mailboxes in
//! [`bridge`].

#![no_std]

pub mod bridge;
pub mod hal;
pub mod orchestrator;
pub mod outcome;
pub mod part;
pub mod parts;
pub mod record;
pub mod result;

#[cfg(test)]
mod testutil;

pub use bridge::{Bridge, Notifier};
pub use hal::Peripherals;
pub use orchestrator::{Selftest, SelftestConfig, State, TestMask};
pub use outcome::{LoopMark, Outcome};
pub use part::{Part, StepCtx, StepFn};
pub use record::SelftestRecord;
pub use result::{FsmResult, TestResult};
