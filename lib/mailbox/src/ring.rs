// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A circular byte queue carrying length-framed messages.
//!
//! Messages are stored as a little-endian `u16` length followed by the
//! payload, wrapping around the backing buffer as needed. The enqueue and
//! dequeue paths work on (up to) two slices so no message is ever copied
//! twice to handle the wrap.
//!
//! Capacity accounting includes the 2-byte frame header, so a mailbox
//! created with capacity `n` holds exactly `n` bytes of payload only when
//! messages are large; many small messages cost their headers too. This is
//! deliberate: it keeps "free space" an honest answer to "will this send
//! block".

/// Per-message framing overhead in bytes.
pub const FRAME_OVERHEAD: usize = 2;

/// Error returned when the queue cannot accommodate a message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingFull {
    /// Bytes (payload + frame) the rejected message needed.
    pub needed: usize,
}

/// A framed circular queue with owned backing storage.
#[derive(Clone, Debug)]
pub struct MsgRing {
    backing: Vec<u8>,
    head: usize,
    tail: usize,
    available: usize,
    messages: usize,
}

impl MsgRing {
    /// Creates an empty ring able to hold `capacity` bytes of frames.
    pub fn new(capacity: usize) -> Self {
        MsgRing {
            backing: vec![0; capacity],
            head: 0,
            tail: 0,
            available: 0,
            messages: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.backing.len()
    }

    /// Bytes currently queued, frame headers included.
    pub fn depth(&self) -> usize {
        self.available
    }

    /// Bytes that can still be enqueued, frame headers included.
    pub fn free(&self) -> usize {
        self.backing.len() - self.available
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages == 0
    }

    /// True if a message of `payload` bytes would fit right now.
    pub fn fits(&self, payload: usize) -> bool {
        payload + FRAME_OVERHEAD <= self.free()
    }

    /// Enqueues one message.
    pub fn push(&mut self, msg: &[u8]) -> Result<(), RingFull> {
        let needed = msg.len() + FRAME_OVERHEAD;
        if needed > self.free() || msg.len() > u16::MAX as usize {
            return Err(RingFull { needed });
        }
        let len_bytes = (msg.len() as u16).to_le_bytes();
        self.write_wrapped(&len_bytes);
        self.write_wrapped(msg);
        self.available += needed;
        self.messages += 1;
        Ok(())
    }

    /// Dequeues the oldest message, if any.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let msg = self.peek()?;
        let consumed = msg.len() + FRAME_OVERHEAD;
        self.tail = (self.tail + consumed) % self.backing.len().max(1);
        self.available -= consumed;
        self.messages -= 1;
        Some(msg)
    }

    /// Copies the oldest message without consuming it.
    pub fn peek(&self) -> Option<Vec<u8>> {
        if self.messages == 0 {
            return None;
        }
        let mut len_bytes = [0u8; FRAME_OVERHEAD];
        self.read_wrapped(self.tail, &mut len_bytes);
        let len = u16::from_le_bytes(len_bytes) as usize;
        let mut msg = vec![0u8; len];
        let payload_at = (self.tail + FRAME_OVERHEAD) % self.backing.len().max(1);
        self.read_wrapped(payload_at, &mut msg);
        Some(msg)
    }

    /// Writes `data` at the head, wrapping as needed. The caller has
    /// already verified the space exists.
    fn write_wrapped(&mut self, data: &[u8]) {
        let cap = self.backing.len();
        let first = (cap - self.head).min(data.len());
        let (d1, d2) = data.split_at(first);
        self.backing[self.head..self.head + first].copy_from_slice(d1);
        self.backing[..d2.len()].copy_from_slice(d2);
        self.head = (self.head + data.len()) % cap.max(1);
    }

    /// Reads `out.len()` bytes starting at `from`, wrapping as needed.
    fn read_wrapped(&self, from: usize, out: &mut [u8]) {
        let cap = self.backing.len();
        let first = (cap - from).min(out.len());
        let (o1, o2) = out.split_at_mut(first);
        o1.copy_from_slice(&self.backing[from..from + first]);
        o2.copy_from_slice(&self.backing[..o2.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_preserves_order_and_content() {
        let mut q = MsgRing::new(64);
        q.push(b"alpha").unwrap();
        q.push(b"beta").unwrap();
        q.push(b"gamma").unwrap();
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop().unwrap(), b"alpha");
        assert_eq!(q.pop().unwrap(), b"beta");
        assert_eq!(q.pop().unwrap(), b"gamma");
        assert!(q.pop().is_none());
        assert_eq!(q.depth(), 0);
    }

    #[test]
    fn full_ring_rejects_without_corruption() {
        let mut q = MsgRing::new(16);
        q.push(&[1; 6]).unwrap(); // 8 bytes with frame
        q.push(&[2; 6]).unwrap(); // 16 total: full
        assert_eq!(q.push(&[3; 1]), Err(RingFull { needed: 3 }));
        assert_eq!(q.pop().unwrap(), vec![1; 6]);
        assert_eq!(q.pop().unwrap(), vec![2; 6]);
    }

    #[test]
    fn messages_wrap_around_the_backing_buffer() {
        let mut q = MsgRing::new(16);
        // Advance head/tail to force a wrapped message.
        q.push(&[0xAA; 10]).unwrap();
        q.pop().unwrap();
        q.push(&[0xBB; 10]).unwrap(); // wraps
        assert_eq!(q.pop().unwrap(), vec![0xBB; 10]);
        assert!(q.is_empty());
    }

    #[test]
    fn peek_does_not_consume() {
        let mut q = MsgRing::new(32);
        q.push(b"once").unwrap();
        assert_eq!(q.peek().unwrap(), b"once");
        assert_eq!(q.peek().unwrap(), b"once");
        assert_eq!(q.len(), 1);
        assert_eq!(q.pop().unwrap(), b"once");
    }

    #[test]
    fn empty_message_is_legal() {
        let mut q = MsgRing::new(8);
        q.push(b"").unwrap();
        assert_eq!(q.pop().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn fits_matches_push_behavior() {
        let mut q = MsgRing::new(10);
        assert!(q.fits(8));
        assert!(!q.fits(9));
        q.push(&[0; 4]).unwrap();
        assert!(q.fits(2));
        assert!(!q.fits(3));
    }
}
