//! A model operator: watches the notification mailbox and does whatever
//! the current screen asks of a human, promptly and correctly. Tests
//! that need a slower or less cooperative user poke the bridge
//! themselves.

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use fabrik_protocol::{Phase, Response};
use fabrik_selftest::Bridge;

use crate::simulator::Machine;

/// Load the operator applies during the tap screen.
const TAP_G: i32 = 200;

#[derive(Default)]
pub struct Harness {
    last_phase: Option<Phase>,
}

impl Harness {
    pub fn new() -> Harness {
        Harness::default()
    }

    pub fn react(&mut self, machine: &mut Machine, bridge: &Bridge<NoopRawMutex>) {
        let Some(data) = bridge.take_notification() else {
            return;
        };
        if self.last_phase != Some(data.phase) {
            log::info!("screen: {:?} {:?}", data.phase, data.data);
            self.last_phase = Some(data.phase);
        }
        match data.phase {
            Phase::LoadcellAskTap => bridge.respond(data.phase, Response::Continue),
            Phase::LoadcellTap => machine.loadcell.load_g = TAP_G,
            Phase::LoadcellDone => machine.loadcell.load_g = 0,
            // no filament loaded, so no unload needed
            Phase::FSensorAskUnload => bridge.respond(data.phase, Response::Continue),
            Phase::FSensorInsertionWait => machine.fsensor.has_filament = true,
            Phase::FSensorInsertionOk => bridge.respond(data.phase, Response::Continue),
            Phase::FSensorEnforceRemove => machine.fsensor.has_filament = false,
            Phase::DockRemovePins => bridge.respond(data.phase, Response::Continue),
            _ => {}
        }
    }
}
