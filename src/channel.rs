//! The channel transaction layer: lock-guarded send and receive over the
//! circular data region.
//!
//! Free space is inherently two-region once the writer has wrapped: the run
//! from `head` to the physical end, and the run from the start of the data
//! region up to `tail`. A frame is always written contiguously; when it does
//! not fit before the physical end, the producer leaves a wrap marker and
//! continues at the start. The consumer mirrors the same size comparison, so
//! the marker is consumed without ever being delivered.

use tracing::{debug, trace};

use crate::{
    frame_size, ChannelError, ControlBlock, NamedLock, Result, Segment, DATA_OFFSET, HEADER_SIZE,
    WRAP_MARKER,
};

/// Smallest accepted data capacity.
const MIN_CAPACITY: usize = 1 << 20; // 1 MiB
/// Largest accepted data capacity.
const MAX_CAPACITY: usize = 1 << 30; // 1 GiB

/// Which side of the channel this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the segment and lock and initializes the cursors; writes frames.
    Producer,
    /// Attaches to an existing segment; reads frames.
    Consumer,
}

/// Bounded single-producer/single-consumer message channel over a named
/// shared memory segment.
///
/// `send` and `receive` never block waiting for space or data. They return
/// `Ok(false)` as a backpressure signal and the caller polls again after a
/// delay of its own choosing; the only blocking inside the channel is the
/// short critical section under the named lock.
#[derive(Debug)]
pub struct Channel {
    segment: Segment,
    lock: NamedLock,
    role: Role,
    /// One past the last usable byte of the data region.
    end: usize,
}

impl Channel {
    /// Open the channel `name` with a data capacity of `capacity_mb`
    /// mebibytes. The producer creates the segment and resets the cursors;
    /// the consumer attaches and fails if the producer has not created it
    /// yet. Errors here are environment failures and not worth retrying.
    pub fn open(name: &str, capacity_mb: usize, role: Role) -> Result<Self> {
        let capacity = capacity_mb.saturating_mul(1 << 20);
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
            return Err(ChannelError::InvalidCapacity {
                size: capacity,
                min: MIN_CAPACITY,
                max: MAX_CAPACITY,
            });
        }

        let segment = match role {
            Role::Producer => Segment::create(name, DATA_OFFSET + capacity)?,
            Role::Consumer => {
                let segment = Segment::open(name)?;
                if segment.len() != DATA_OFFSET + capacity {
                    return Err(ChannelError::SegmentMismatch {
                        name: name.to_string(),
                        actual: segment.len(),
                        expected: DATA_OFFSET + capacity,
                    });
                }
                segment
            }
        };

        let lock = NamedLock::open_or_create(format!("{name}.lock"), role == Role::Producer)?;
        if role == Role::Producer {
            let _guard = lock.acquire()?;
            control(&segment).reset();
        }

        let end = segment.len();
        debug!(name, capacity, ?role, "channel open");

        Ok(Self {
            segment,
            lock,
            role,
            end,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Configured data capacity in bytes (the segment minus the control
    /// block).
    pub fn capacity(&self) -> usize {
        self.end - DATA_OFFSET
    }

    /// Usable contiguous run in front of the write cursor. This is what the
    /// next write decision is made against; it is not the total free space,
    /// which may continue at the start of the data region.
    pub fn free_contiguous(&self) -> usize {
        let cb = control(&self.segment);
        let (head, tail) = (cb.head(), cb.tail());
        if head >= tail {
            self.end - head
        } else {
            tail - head
        }
    }

    /// Append one message to the channel.
    ///
    /// `Ok(false)` means the region has no room for the frame right now;
    /// retry once the consumer has drained something. Zero-length payloads
    /// and payloads whose frame could never fit the region are rejected as
    /// errors instead, since retrying them cannot help.
    pub fn send(&self, payload: &[u8]) -> Result<bool> {
        if payload.is_empty() {
            return Err(ChannelError::EmptyPayload);
        }
        let frame = frame_size(payload.len());
        // The writer never lets the cursors meet, so even an empty channel
        // cannot hold a frame spanning the whole data region.
        if frame >= self.capacity() {
            return Err(ChannelError::PayloadTooLarge {
                len: payload.len(),
                max: self.capacity(),
            });
        }

        let _guard = self.lock.acquire()?;
        let cb = control(&self.segment);
        let (head, tail) = (cb.head(), cb.tail());

        if head >= tail {
            // Free space runs from head to the physical end, then from the
            // start of the data region up to tail.
            if frame <= self.end - head {
                let mut new_head = head + frame;
                if new_head == self.end {
                    new_head = DATA_OFFSET;
                }
                if new_head == tail {
                    trace!(len = payload.len(), "send: full");
                    return Ok(false);
                }
                self.write_frame(head, payload);
                cb.set_head(new_head);
            } else {
                // The frame does not fit before the physical end; leave a
                // wrap marker and continue at the start of the data region.
                if self.end - head < HEADER_SIZE {
                    // Not even room for the marker.
                    trace!(len = payload.len(), "send: full");
                    return Ok(false);
                }
                if frame >= tail - DATA_OFFSET {
                    trace!(len = payload.len(), "send: full");
                    return Ok(false);
                }
                self.write_header(head, WRAP_MARKER);
                self.write_frame(DATA_OFFSET, payload);
                cb.set_head(DATA_OFFSET + frame);
            }
        } else {
            // Already wrapped: one free run between head and tail.
            if frame >= tail - head {
                trace!(len = payload.len(), "send: full");
                return Ok(false);
            }
            self.write_frame(head, payload);
            cb.set_head(head + frame);
        }

        trace!(len = payload.len(), "send: ok");
        Ok(true)
    }

    /// Payload length of the next unread message, or 0 when the channel is
    /// empty. Wrap markers are skipped: the reported size is always that of
    /// a real message.
    ///
    /// Takes no lock. Each cursor has exactly one writer (`tail` only moves
    /// under this consumer's own `receive` calls, `head` only under the
    /// producer's `send`), so an unlocked snapshot is conservative at worst.
    /// That argument breaks down with more than one process per role.
    pub fn peek_next_size(&self) -> usize {
        let cb = control(&self.segment);
        let (head, tail) = (cb.head(), cb.tail());
        if head == tail {
            return 0;
        }

        let len = if self.end - tail < HEADER_SIZE {
            // Too close to the physical end even for a marker; the next
            // frame can only be at the start of the data region.
            self.read_header(DATA_OFFSET)
        } else {
            match self.read_header(tail) {
                WRAP_MARKER => self.read_header(DATA_OFFSET),
                len => len,
            }
        };
        len as usize
    }

    /// Copy the next message into `buf`, whose length must be the value a
    /// prior [`peek_next_size`](Self::peek_next_size) returned.
    ///
    /// `Ok(false)` when there is nothing to read or `buf` is empty.
    pub fn receive(&self, buf: &mut [u8]) -> Result<bool> {
        if buf.is_empty() {
            return Ok(false);
        }
        let frame = frame_size(buf.len());

        let _guard = self.lock.acquire()?;
        let cb = control(&self.segment);
        let (head, tail) = (cb.head(), cb.tail());
        if head == tail {
            return Ok(false);
        }

        // The producer wrapped here iff this frame did not fit before the
        // physical end, so mirroring its size comparison consumes the wrap
        // marker without reading it.
        let read_at = if self.end - tail < frame {
            DATA_OFFSET
        } else {
            tail
        };

        unsafe {
            std::ptr::copy_nonoverlapping(
                self.segment.as_ptr().add(read_at + HEADER_SIZE),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }

        let mut new_tail = read_at + frame;
        if new_tail == self.end {
            new_tail = DATA_OFFSET;
        }
        cb.set_tail(new_tail);

        trace!(len = buf.len(), "receive: ok");
        Ok(true)
    }

    /// Write the length header word at `offset`. Header offsets are the
    /// data offset plus a multiple of the frame alignment, so the word write
    /// is aligned.
    fn write_header(&self, offset: usize, value: u64) {
        debug_assert!(offset + HEADER_SIZE <= self.end);
        unsafe {
            (self.segment.as_ptr().add(offset) as *mut u64).write(value);
        }
    }

    /// Write a full frame (header then payload) starting at `offset`.
    fn write_frame(&self, offset: usize, payload: &[u8]) {
        debug_assert!(offset + HEADER_SIZE + payload.len() <= self.end);
        self.write_header(offset, payload.len() as u64);
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.segment.as_ptr().add(offset + HEADER_SIZE),
                payload.len(),
            );
        }
    }

    fn read_header(&self, offset: usize) -> u64 {
        debug_assert!(offset + HEADER_SIZE <= self.end);
        unsafe { (self.segment.as_ptr().add(offset) as *const u64).read() }
    }
}

/// The control block lives at offset zero of every segment.
fn control(segment: &Segment) -> &ControlBlock {
    unsafe { &*(segment.as_ptr() as *const ControlBlock) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Names unique per process and test so parallel runs never attach to
    /// each other's segments.
    fn unique_name(tag: &str) -> String {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        format!(
            "shm-channel-test-{}-{}-{}",
            tag,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn pair(tag: &str, capacity_mb: usize) -> (Channel, Channel) {
        let name = unique_name(tag);
        let producer = Channel::open(&name, capacity_mb, Role::Producer).unwrap();
        let consumer = Channel::open(&name, capacity_mb, Role::Consumer).unwrap();
        (producer, consumer)
    }

    /// Peek-then-receive one message, or None when the channel is empty.
    fn drain_one(consumer: &Channel) -> Option<Vec<u8>> {
        let len = consumer.peek_next_size();
        if len == 0 {
            return None;
        }
        let mut buf = vec![0u8; len];
        assert!(consumer.receive(&mut buf).unwrap());
        Some(buf)
    }

    fn payload(fill: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| fill.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn fifo_order_byte_for_byte() {
        let (producer, consumer) = pair("fifo", 1);

        let messages: Vec<Vec<u8>> = (0..5).map(|i| payload(i as u8, 10 + i * 7)).collect();
        for message in &messages {
            assert!(producer.send(message).unwrap());
        }
        for message in &messages {
            assert_eq!(drain_one(&consumer).unwrap(), *message);
        }
        assert_eq!(consumer.peek_next_size(), 0);
    }

    #[test]
    fn zero_length_send_is_rejected_without_state_change() {
        let (producer, consumer) = pair("zero", 1);

        let err = producer.send(&[]).unwrap_err();
        assert!(matches!(err, ChannelError::EmptyPayload));
        assert!(err.is_invalid_input());

        // Cursors untouched: still empty, full contiguous run available.
        assert_eq!(consumer.peek_next_size(), 0);
        assert_eq!(producer.free_contiguous(), producer.capacity());
    }

    #[test]
    fn oversized_payload_is_invalid_not_backpressure() {
        let (producer, _consumer) = pair("oversized", 1);

        // A frame spanning the whole data region can never be placed.
        let payload = vec![0u8; producer.capacity()];
        let err = producer.send(&payload).unwrap_err();
        assert!(matches!(err, ChannelError::PayloadTooLarge { .. }));
        assert!(err.is_invalid_input());

        // One byte under the limit is merely large, not invalid.
        let payload = vec![0u8; producer.capacity() - HEADER_SIZE - crate::FRAME_ALIGNMENT];
        assert!(producer.send(&payload).unwrap());
    }

    #[test]
    fn capacity_accounting() {
        let (producer, consumer) = pair("capacity", 1);

        assert_eq!(producer.capacity(), 1 << 20);
        assert_eq!(consumer.capacity(), 1 << 20);
        assert_eq!(producer.free_contiguous(), producer.capacity());

        assert!(producer.send(&[7u8; 100]).unwrap());
        let expected = producer.capacity() - frame_size(100);
        assert_eq!(producer.free_contiguous(), expected);
        assert!(producer.free_contiguous() <= producer.capacity());

        let _ = drain_one(&consumer).unwrap();
        assert_eq!(producer.free_contiguous(), expected);
    }

    #[test]
    fn backpressure_until_consumer_frees_space() {
        let (producer, consumer) = pair("backpressure", 1);

        // 256 KiB frames: three fit, the fourth would land the cursors on
        // top of each other and must fail early.
        let len = (1 << 18) - HEADER_SIZE;
        let messages: Vec<Vec<u8>> = (0..4).map(|i| payload(0x10 + i as u8, len)).collect();

        assert!(producer.send(&messages[0]).unwrap());
        assert!(producer.send(&messages[1]).unwrap());
        assert!(producer.send(&messages[2]).unwrap());
        assert!(!producer.send(&messages[3]).unwrap());
        assert!(!producer.send(&messages[3]).unwrap());

        // Draining one message makes the same payload go through.
        assert_eq!(drain_one(&consumer).unwrap(), messages[0]);
        assert!(producer.send(&messages[3]).unwrap());

        for message in &messages[1..] {
            assert_eq!(drain_one(&consumer).unwrap(), *message);
        }
        assert_eq!(consumer.peek_next_size(), 0);
    }

    #[test]
    fn exact_fit_wraparound() {
        let (producer, consumer) = pair("exactfit", 1);

        // Four 256 KiB frames tile the 1 MiB region exactly; the fourth send
        // must wait for a receive, then lands flush against the physical end.
        let len = (1 << 18) - HEADER_SIZE;
        let messages: Vec<Vec<u8>> = (0..6).map(|i| payload(0x30 + i as u8, len)).collect();

        for message in &messages[..3] {
            assert!(producer.send(message).unwrap());
        }
        assert!(!producer.send(&messages[3]).unwrap());

        assert_eq!(drain_one(&consumer).unwrap(), messages[0]);
        assert!(producer.send(&messages[3]).unwrap());

        // The writer is now wrapped behind the reader.
        assert!(!producer.send(&messages[4]).unwrap());
        assert_eq!(drain_one(&consumer).unwrap(), messages[1]);
        assert!(producer.send(&messages[4]).unwrap());

        for message in &messages[2..5] {
            assert_eq!(drain_one(&consumer).unwrap(), *message);
        }
        assert_eq!(consumer.peek_next_size(), 0);

        // A full lap later the channel still works.
        assert!(producer.send(&messages[5]).unwrap());
        assert_eq!(drain_one(&consumer).unwrap(), messages[5]);
    }

    #[test]
    fn wrap_marker_integrity_and_peek_skip() {
        let (producer, consumer) = pair("marker", 1);

        // 300 032-byte frames do not tile the region: after three of them
        // the remaining 148 480-byte gap forces a wrap marker.
        let len = 300_000;
        let messages: Vec<Vec<u8>> = (0..4).map(|i| payload(0x50 + i as u8, len)).collect();

        for message in &messages[..3] {
            assert!(producer.send(message).unwrap());
        }
        // The gap cannot hold the fourth frame and nothing has been read.
        assert!(!producer.send(&messages[3]).unwrap());

        assert_eq!(drain_one(&consumer).unwrap(), messages[0]);
        // Still full: the run before the read cursor is exactly one frame,
        // and the cursors may not meet.
        assert!(!producer.send(&messages[3]).unwrap());

        assert_eq!(drain_one(&consumer).unwrap(), messages[1]);
        assert!(producer.send(&messages[3]).unwrap());

        // The next unread frame sits before the marker.
        assert_eq!(consumer.peek_next_size(), len);
        assert_eq!(drain_one(&consumer).unwrap(), messages[2]);

        // Now the read cursor faces the marker; peek must report the real
        // frame at the start of the region, and receive must deliver it
        // byte-for-byte.
        assert_eq!(consumer.peek_next_size(), len);
        assert_eq!(drain_one(&consumer).unwrap(), messages[3]);
        assert_eq!(consumer.peek_next_size(), 0);
    }

    #[test]
    fn consumer_requires_existing_segment() {
        let err = Channel::open(&unique_name("orphan"), 1, Role::Consumer).unwrap_err();
        assert!(matches!(err, ChannelError::SegmentNotFound(_)));
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        let err = Channel::open(&unique_name("toosmall"), 0, Role::Producer).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidCapacity { .. }));

        let err = Channel::open(&unique_name("toobig"), 2048, Role::Producer).unwrap_err();
        assert!(matches!(err, ChannelError::InvalidCapacity { .. }));
    }

    #[test]
    fn alternating_sizes_across_threads() {
        let (producer, consumer) = pair("alternating", 1);

        const ROUNDS: u64 = 5000;
        let sent_digests: Vec<u32> = {
            let mut digests = Vec::with_capacity((ROUNDS * 2) as usize);
            let mut seq: u64 = 0;
            for _ in 0..ROUNDS {
                for len in [10usize, 20] {
                    digests.push(crc32fast::hash(&stamped(seq, len)));
                    seq += 1;
                }
            }
            digests
        };

        let writer = std::thread::spawn(move || {
            let mut seq: u64 = 0;
            for _ in 0..ROUNDS {
                for len in [10usize, 20] {
                    let message = stamped(seq, len);
                    while !producer.send(&message).unwrap() {
                        std::thread::yield_now();
                    }
                    seq += 1;
                }
            }
        });

        let mut lengths = [0u64; 2];
        for seq in 0..ROUNDS * 2 {
            let message = loop {
                match drain_one(&consumer) {
                    Some(message) => break message,
                    None => std::thread::yield_now(),
                }
            };
            // Strict FIFO: the sequence stamp must match the receive index.
            assert_eq!(message, stamped(seq, message.len()));
            assert_eq!(crc32fast::hash(&message), sent_digests[seq as usize]);
            match message.len() {
                10 => lengths[0] += 1,
                20 => lengths[1] += 1,
                other => panic!("unexpected length {other}"),
            }
        }

        writer.join().unwrap();
        assert_eq!(lengths, [ROUNDS, ROUNDS]);
        assert_eq!(consumer.peek_next_size(), 0);
    }

    /// A payload of `len` bytes carrying its sequence number in the first
    /// eight bytes, the rest a deterministic fill.
    fn stamped(seq: u64, len: usize) -> Vec<u8> {
        let mut message = vec![0u8; len];
        message[..8].copy_from_slice(&seq.to_le_bytes());
        for (i, byte) in message[8..].iter_mut().enumerate() {
            *byte = (seq as u8).wrapping_add(i as u8);
        }
        message
    }
}
