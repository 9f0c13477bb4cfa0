//! Spill slot allocation.

use crate::ir::ValueKind;
use cranelift_entity::entity_impl;

/// An opaque reference to a stack spill slot, counted in stack words.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpillSlot(u32);
entity_impl!(SpillSlot, "ss");

/// Hands out spill slots within one function's frame.
///
/// Double-word values are aligned to even slot indices; the word skipped
/// for alignment is remembered and handed to the next single-word request.
#[derive(Clone, Debug, Default)]
pub struct FrameMap {
    next_slot: u32,
    alignment_hole: Option<u32>,
}

impl FrameMap {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a spill slot for a value of the given kind.
    pub fn alloc_spill_slot(&mut self, kind: ValueKind) -> SpillSlot {
        match kind.num_slots() {
            1 => {
                if let Some(hole) = self.alignment_hole.take() {
                    return SpillSlot::from_u32(hole);
                }
                let slot = self.next_slot;
                self.next_slot += 1;
                SpillSlot::from_u32(slot)
            }
            2 => {
                if self.next_slot % 2 != 0 {
                    self.alignment_hole = Some(self.next_slot);
                    self.next_slot += 1;
                }
                let slot = self.next_slot;
                self.next_slot += 2;
                SpillSlot::from_u32(slot)
            }
            n => unreachable!("unsupported spill size {}", n),
        }
    }

    /// Number of stack words handed out, including alignment padding.
    pub fn frame_words(&self) -> u32 {
        self.next_slot
    }

    /// True if no slot has been allocated.
    pub fn is_empty(&self) -> bool {
        self.next_slot == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueKind;

    #[test]
    fn alignment_hole_reuse() {
        let mut frame = FrameMap::new();
        let a = frame.alloc_spill_slot(ValueKind::Int);
        let b = frame.alloc_spill_slot(ValueKind::Float);
        let c = frame.alloc_spill_slot(ValueKind::Int);
        let d = frame.alloc_spill_slot(ValueKind::Int);
        assert_eq!(a.as_u32(), 0);
        // the float is aligned to slot 2, leaving a hole at 1
        assert_eq!(b.as_u32(), 2);
        // the hole is reused before new slots are handed out
        assert_eq!(c.as_u32(), 1);
        assert_eq!(d.as_u32(), 4);
        assert_eq!(frame.frame_words(), 5);
    }
}
