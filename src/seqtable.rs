//! Sequence tracking table (C4).
//!
//! Correlates an outbound "Send Message"-tunneled request with its
//! eventual response: 64 slots, round-robin allocation from `next_seq`,
//! no timer-based expiry — a stuck request simply occupies its slot
//! until the caller never calls `find()` for it, at which point the
//! table behaves as if 1/64th of its capacity is permanently lost. This
//! matches the original's fire-and-forget design (`bmc.c`'s sequence
//! table has no aging).

use crate::error::SeqTableError;

const TABLE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    inuse: bool,
    orig_seq: u8,
    orig_channel: u8,
    orig_sid: u32,
}

/// What a message looked like before `reserve()` rewrote its sequence
/// number, restored verbatim by `find()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored {
    pub orig_seq: u8,
    pub orig_channel: u8,
    pub orig_sid: u32,
}

pub struct SequenceTable {
    slots: [Slot; TABLE_SIZE],
    next_seq: usize,
}

impl Default for SequenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceTable {
    pub fn new() -> Self {
        SequenceTable {
            slots: [Slot::default(); TABLE_SIZE],
            next_seq: 0,
        }
    }

    /// Reserve a slot for `(orig_seq, orig_channel, orig_sid)`, returning
    /// the new sequence number the caller should stamp onto the outbound
    /// message. Scans at most `TABLE_SIZE` slots starting at `next_seq`.
    pub fn reserve(&mut self, orig_seq: u8, orig_channel: u8, orig_sid: u32) -> Result<u8, SeqTableError> {
        for offset in 0..TABLE_SIZE {
            let idx = (self.next_seq + offset) % TABLE_SIZE;
            if !self.slots[idx].inuse {
                self.slots[idx] = Slot {
                    inuse: true,
                    orig_seq,
                    orig_channel,
                    orig_sid,
                };
                self.next_seq = (idx + 1) % TABLE_SIZE;
                return Ok(idx as u8);
            }
        }
        Err(SeqTableError::OutOfSpace)
    }

    /// Look up and free the slot for `seq`, restoring the original
    /// fields that were stamped at `reserve()` time.
    pub fn find(&mut self, seq: u8) -> Result<Restored, SeqTableError> {
        let idx = seq as usize;
        if idx >= TABLE_SIZE || !self.slots[idx].inuse {
            return Err(SeqTableError::NotPresent);
        }
        let slot = self.slots[idx];
        self.slots[idx] = Slot::default();
        Ok(Restored {
            orig_seq: slot.orig_seq,
            orig_channel: slot.orig_channel,
            orig_sid: slot.orig_sid,
        })
    }
}
