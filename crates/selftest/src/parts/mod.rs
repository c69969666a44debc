//! The concrete test families. Each module supplies a config struct, an
//! instance type, an ordered step table and a result value implementing
//! [`crate::result::FsmResult`]; the generic driver in [`crate::part`]
//! does the rest.

pub mod axis;
pub mod dock;
pub mod fan;
pub mod fsensor;
pub mod heater;
pub mod loadcell;

/// Elapsed/total scaled to 0..=100 for the progress byte in payloads.
pub(crate) fn progress_pct(elapsed: u32, total: u32) -> u8 {
    if total == 0 || elapsed >= total {
        100
    } else {
        (elapsed * 100 / total) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_saturates() {
        assert_eq!(progress_pct(0, 1000), 0);
        assert_eq!(progress_pct(500, 1000), 50);
        assert_eq!(progress_pct(2000, 1000), 100);
        assert_eq!(progress_pct(5, 0), 100);
    }
}
