//! Control block and frame layout for the circular data region.
//!
//! The segment starts with a [`ControlBlock`] holding the two cursors; the
//! circular data region follows immediately after it. Each message occupies
//! one frame: a one-word length header, the payload, and padding up to the
//! next [`FRAME_ALIGNMENT`](crate::FRAME_ALIGNMENT) boundary. The header
//! stores the payload length, never the frame size; the reader recomputes
//! the frame size with the same rounding rule, so the two can never disagree.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::{DATA_OFFSET, FRAME_ALIGNMENT, HEADER_SIZE};

/// Value stored in a header's length word to mean "no frame here, the next
/// frame starts back at the beginning of the data region". Written by the
/// producer when a frame would not fit before the physical end of the
/// segment; never delivered to the consumer.
pub const WRAP_MARKER: u64 = u64::MAX;

/// Cursor pair describing occupancy of the circular data region.
///
/// `head` is the next write offset and `tail` the next read offset, both
/// measured from the start of the segment and always within
/// `[DATA_OFFSET, segment end)`. `head == tail` means empty; the write path
/// refuses any frame that would make the cursors coincide, so the equality
/// test stays unambiguous at the cost of one frame of capacity.
#[repr(C)]
pub struct ControlBlock {
    /// Next write offset, advanced only by the producer.
    head: AtomicU64,
    /// Next read offset, advanced only by the consumer.
    tail: AtomicU64,
}

impl ControlBlock {
    /// Reset both cursors to the first data offset. Producer-side only, at
    /// segment creation time.
    pub(crate) fn reset(&self) {
        self.head.store(DATA_OFFSET as u64, Ordering::Release);
        self.tail.store(DATA_OFFSET as u64, Ordering::Release);
    }

    pub(crate) fn head(&self) -> usize {
        self.head.load(Ordering::Acquire) as usize
    }

    pub(crate) fn tail(&self) -> usize {
        self.tail.load(Ordering::Acquire) as usize
    }

    pub(crate) fn set_head(&self, offset: usize) {
        self.head.store(offset as u64, Ordering::Release);
    }

    pub(crate) fn set_tail(&self, offset: usize) {
        self.tail.store(offset as u64, Ordering::Release);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head() == self.tail()
    }
}

/// Round `n` up to the next frame alignment boundary.
pub const fn align_up(n: usize) -> usize {
    (n + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Total bytes a payload occupies in the data region: length header plus
/// payload, padded to the alignment unit.
pub const fn frame_size(payload_len: usize) -> usize {
    align_up(HEADER_SIZE + payload_len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_block_is_two_machine_words() {
        assert_eq!(std::mem::size_of::<ControlBlock>(), 2 * HEADER_SIZE);
        assert_eq!(std::mem::size_of::<ControlBlock>(), DATA_OFFSET);
    }

    #[test]
    fn align_up_rounds_to_next_boundary() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 64);
        assert_eq!(align_up(63), 64);
        assert_eq!(align_up(64), 64);
        assert_eq!(align_up(65), 128);
    }

    #[test]
    fn frame_size_accounts_for_header() {
        // Header plus payload exactly filling one alignment unit.
        assert_eq!(frame_size(FRAME_ALIGNMENT - HEADER_SIZE), FRAME_ALIGNMENT);
        // One byte over spills into the next unit.
        assert_eq!(
            frame_size(FRAME_ALIGNMENT - HEADER_SIZE + 1),
            2 * FRAME_ALIGNMENT
        );
        assert_eq!(frame_size(1), FRAME_ALIGNMENT);
    }

    #[test]
    fn reset_makes_cursors_coincide_at_data_offset() {
        let cb = ControlBlock {
            head: AtomicU64::new(0),
            tail: AtomicU64::new(99),
        };
        assert!(!cb.is_empty());
        cb.reset();
        assert!(cb.is_empty());
        assert_eq!(cb.head(), DATA_OFFSET);
        assert_eq!(cb.tail(), DATA_OFFSET);
    }
}
