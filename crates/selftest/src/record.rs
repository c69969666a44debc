use serde::{Deserialize, Serialize};

use crate::result::TestResult;

/// Non-volatile pass/fail record, one 2-bit [`TestResult`] per sub-test.
///
/// Packed into a `u32` for storage (bit layout below, field 0 in the
/// lowest bits); lives in the configuration store, is read at the start
/// of a selftest run and rewritten as each sub-test finishes. Survives
/// power cycles; only a factory reset clears it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "u32", from = "u32")]
pub struct SelftestRecord {
    pub fans: TestResult,
    pub loadcell: TestResult,
    pub xaxis: TestResult,
    pub yaxis: TestResult,
    pub zaxis: TestResult,
    pub nozzle: TestResult,
    pub bed: TestResult,
    pub fsensor: TestResult,
    pub dock: TestResult,
}

impl SelftestRecord {
    const FIELDS: usize = 9;

    fn fields(&self) -> [TestResult; Self::FIELDS] {
        [
            self.fans,
            self.loadcell,
            self.xaxis,
            self.yaxis,
            self.zaxis,
            self.nozzle,
            self.bed,
            self.fsensor,
            self.dock,
        ]
    }

    pub fn all_passed(&self) -> bool {
        self.fields().iter().all(|r| *r == TestResult::Passed)
    }
}

impl From<SelftestRecord> for u32 {
    fn from(record: SelftestRecord) -> u32 {
        record
            .fields()
            .iter()
            .enumerate()
            .fold(0, |acc, (i, r)| acc | (r.bits() as u32) << (2 * i))
    }
}

impl From<u32> for SelftestRecord {
    fn from(raw: u32) -> SelftestRecord {
        let at = |i: usize| TestResult::from_bits((raw >> (2 * i)) as u8);
        SelftestRecord {
            fans: at(0),
            loadcell: at(1),
            xaxis: at(2),
            yaxis: at(3),
            zaxis: at(4),
            nozzle: at(5),
            bed: at(6),
            fsensor: at(7),
            dock: at(8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_result() -> impl Strategy<Value = TestResult> {
        (0u8..4).prop_map(TestResult::from_bits)
    }

    proptest! {
        #[test]
        fn pack_roundtrip(results in proptest::array::uniform9(arb_result())) {
            let record = SelftestRecord {
                fans: results[0],
                loadcell: results[1],
                xaxis: results[2],
                yaxis: results[3],
                zaxis: results[4],
                nozzle: results[5],
                bed: results[6],
                fsensor: results[7],
                dock: results[8],
            };
            prop_assert_eq!(SelftestRecord::from(u32::from(record)), record);
        }
    }

    #[test]
    fn fresh_record_is_all_unknown() {
        assert_eq!(u32::from(SelftestRecord::default()), 0);
    }

    #[test]
    fn unused_high_bits_are_ignored() {
        let raw = 0xfffd_0000;
        let record = SelftestRecord::from(raw);
        assert_eq!(record.fans, TestResult::Unknown);
        assert_eq!(record.dock, TestResult::Passed);
    }
}
