/// Number of loop-mark slots a single procedure may use.
pub const LOOP_MARKS: usize = 8;

/// A loop-mark slot index, restricted to `0..LOOP_MARKS`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LoopMark(u8);

impl LoopMark {
    pub const fn new(slot: u8) -> LoopMark {
        assert!((slot as usize) < LOOP_MARKS);
        LoopMark(slot)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a step function tells the driver to do next.
///
/// Loops inside a procedure are expressed with marks: `MarkLoop`
/// remembers the current step in a slot (and then advances), and a later
/// `JumpBack` rewinds to it. Jumps only ever go backward.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Advance to the next step.
    Continue,
    /// Run the same step again next tick.
    Repeat,
    /// Terminate the procedure as user-aborted.
    Abort,
    /// Terminate the procedure as failed.
    Fail,
    /// Remember this step in the given slot, then advance.
    MarkLoop(LoopMark),
    /// Rewind to the step previously stored in the given slot.
    JumpBack(LoopMark),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_keep_their_slot() {
        assert_eq!(LoopMark::new(3).index(), 3);
    }

    #[test]
    #[should_panic]
    fn out_of_range_mark_panics() {
        let _ = LoopMark::new(LOOP_MARKS as u8);
    }
}
