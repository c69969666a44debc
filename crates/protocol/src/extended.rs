//! Side channel for the rare result that does not fit in 4 bytes.
//!
//! Values are serialized with postcard into a caller-provided buffer and
//! identified by a type tag, so the consumer can check what it is about
//! to decode before decoding it.

use serde::{Deserialize, Serialize};

/// Upper bound on the postcard encoding of any [`ExtendedData`] variant.
pub const EXTENDED_MAX: usize = 32;

/// Discriminates what is currently stored in the shared extended slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtendedTag {
    DockOffsets,
    HeaterCharacteristics,
}

/// Result data larger than a [`crate::PhaseData`].
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ExtendedData {
    /// Where the tool dock actually sits, relative to its nominal
    /// position, after the park/pick cycling finished.
    DockOffsets { x_mm: f32, y_mm: f32, cycles: u8 },
    /// Steady-state behaviour measured during the heater check.
    HeaterCharacteristics {
        rise_c_per_s: f32,
        overshoot_c: f32,
        settle_s: f32,
    },
}

impl ExtendedData {
    pub fn tag(&self) -> ExtendedTag {
        match self {
            ExtendedData::DockOffsets { .. } => ExtendedTag::DockOffsets,
            ExtendedData::HeaterCharacteristics { .. } => ExtendedTag::HeaterCharacteristics,
        }
    }

    /// Encodes into `buf`, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, postcard::Error> {
        postcard::to_slice(self, buf).map(|used| used.len())
    }

    pub fn decode(buf: &[u8]) -> Result<ExtendedData, postcard::Error> {
        postcard::from_bytes(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn dock_offsets_roundtrip(x in -50.0f32..50.0, y in -50.0f32..50.0, cycles in 0u8..10) {
            let data = ExtendedData::DockOffsets { x_mm: x, y_mm: y, cycles };
            let mut buf = [0u8; EXTENDED_MAX];
            let used = data.encode(&mut buf).unwrap();
            prop_assert!(used <= EXTENDED_MAX);
            prop_assert_eq!(ExtendedData::decode(&buf[..used]).unwrap(), data);
        }

        #[test]
        fn heater_characteristics_roundtrip(rise in 0.0f32..10.0, over in 0.0f32..30.0, settle in 0.0f32..600.0) {
            let data = ExtendedData::HeaterCharacteristics {
                rise_c_per_s: rise,
                overshoot_c: over,
                settle_s: settle,
            };
            let mut buf = [0u8; EXTENDED_MAX];
            let used = data.encode(&mut buf).unwrap();
            prop_assert_eq!(ExtendedData::decode(&buf[..used]).unwrap(), data);
        }
    }
}
