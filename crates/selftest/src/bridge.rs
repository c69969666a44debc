//! The two channels shared with the UI thread.
//!
//! Everything else in the engine is single-owner data; only the
//! notification mailbox, the response mailbox and the extended-payload
//! slot are ever touched from a second thread, each under a short
//! blocking-mutex critical section.

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use fabrik_protocol::{BaseData, ExtendedData, ExtendedTag, Phase, Response, EXTENDED_MAX};

/// The engine-side face of the bridge. Trait-object form so the driver
/// and orchestrator stay independent of the mutex flavour.
pub trait Notifier {
    /// Pushes the latest phase/payload pair. At most one value is
    /// pending: a newer notification overwrites, never queues.
    fn notify(&self, data: BaseData);

    /// Non-blocking read of the user's answer to `phase`. Responses to
    /// any other phase are left in place for their owner.
    fn poll_response(&self, phase: Phase) -> Option<Response>;

    /// Writes to the extended side channel. Returns false when the slot
    /// already holds a bit-identical value for the same tag (no-op, so
    /// the UI is not poked for nothing).
    fn publish_extended(&self, data: &ExtendedData) -> bool;
}

struct ExtendedSlot {
    tag: Option<ExtendedTag>,
    len: usize,
    buf: [u8; EXTENDED_MAX],
}

/// Cross-thread mailbox pair plus the extended-payload slot.
///
/// `M` picks the lock: `CriticalSectionRawMutex` on the target,
/// `NoopRawMutex` in single-threaded tests and the simulator.
pub struct Bridge<M: RawMutex> {
    notification: Mutex<M, Cell<Option<BaseData>>>,
    response: Mutex<M, Cell<Option<(Phase, Response)>>>,
    extended: Mutex<M, RefCell<ExtendedSlot>>,
}

impl<M: RawMutex> Bridge<M> {
    pub const fn new() -> Self {
        Bridge {
            notification: Mutex::new(Cell::new(None)),
            response: Mutex::new(Cell::new(None)),
            extended: Mutex::new(RefCell::new(ExtendedSlot {
                tag: None,
                len: 0,
                buf: [0; EXTENDED_MAX],
            })),
        }
    }

    /// UI side: takes the pending notification, if any.
    pub fn take_notification(&self) -> Option<BaseData> {
        self.notification.lock(|n| n.take())
    }

    /// UI side: records the user's answer to the given phase. A newer
    /// answer replaces an unread older one.
    pub fn respond(&self, phase: Phase, response: Response) {
        self.response.lock(|r| r.set(Some((phase, response))));
    }

    /// UI side: decodes the extended slot, if it holds the expected tag.
    pub fn read_extended(&self, tag: ExtendedTag) -> Option<ExtendedData> {
        self.extended.lock(|slot| {
            let slot = slot.borrow();
            if slot.tag != Some(tag) {
                return None;
            }
            ExtendedData::decode(&slot.buf[..slot.len]).ok()
        })
    }
}

impl<M: RawMutex> Default for Bridge<M> {
    fn default() -> Self {
        Bridge::new()
    }
}

impl<M: RawMutex> Notifier for Bridge<M> {
    fn notify(&self, data: BaseData) {
        self.notification.lock(|n| n.set(Some(data)));
    }

    fn poll_response(&self, phase: Phase) -> Option<Response> {
        self.response.lock(|r| match r.get() {
            Some((p, response)) if p == phase => {
                r.set(None);
                Some(response)
            }
            _ => None,
        })
    }

    fn publish_extended(&self, data: &ExtendedData) -> bool {
        let mut encoded = [0u8; EXTENDED_MAX];
        let Ok(len) = data.encode(&mut encoded) else {
            // Every variant fits EXTENDED_MAX; checked by the codec tests.
            return false;
        };
        self.extended.lock(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.tag == Some(data.tag()) && slot.buf[..slot.len] == encoded[..len] {
                return false;
            }
            slot.tag = Some(data.tag());
            slot.len = len;
            slot.buf[..len].copy_from_slice(&encoded[..len]);
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    fn bridge() -> Bridge<NoopRawMutex> {
        Bridge::new()
    }

    #[test]
    fn newer_notification_overwrites_older() {
        let b = bridge();
        b.notify(BaseData::new(Phase::Fans, [1, 0, 0, 0]));
        b.notify(BaseData::new(Phase::Fans, [2, 0, 0, 0]));
        assert_eq!(b.take_notification(), Some(BaseData::new(Phase::Fans, [2, 0, 0, 0])));
        assert_eq!(b.take_notification(), None);
    }

    #[test]
    fn response_is_only_visible_to_its_phase() {
        let b = bridge();
        b.respond(Phase::FSensorAskUnload, Response::Unload);
        assert_eq!(b.poll_response(Phase::Nozzle), None);
        assert_eq!(b.poll_response(Phase::FSensorAskUnload), Some(Response::Unload));
        // consumed
        assert_eq!(b.poll_response(Phase::FSensorAskUnload), None);
    }

    #[test]
    fn identical_extended_write_is_a_noop() {
        let b = bridge();
        let data = ExtendedData::DockOffsets {
            x_mm: 0.25,
            y_mm: -0.5,
            cycles: 3,
        };
        assert!(b.publish_extended(&data));
        assert!(!b.publish_extended(&data));
        assert_eq!(b.read_extended(ExtendedTag::DockOffsets), Some(data));
        assert_eq!(b.read_extended(ExtendedTag::HeaterCharacteristics), None);
    }

    #[test]
    fn extended_slot_holds_one_value_system_wide() {
        let b = bridge();
        let dock = ExtendedData::DockOffsets {
            x_mm: 0.0,
            y_mm: 0.0,
            cycles: 1,
        };
        let heater = ExtendedData::HeaterCharacteristics {
            rise_c_per_s: 1.5,
            overshoot_c: 3.0,
            settle_s: 40.0,
        };
        assert!(b.publish_extended(&dock));
        assert!(b.publish_extended(&heater));
        assert_eq!(b.read_extended(ExtendedTag::DockOffsets), None);
        assert_eq!(b.read_extended(ExtendedTag::HeaterCharacteristics), Some(heater));
    }
}
