//! The 4-slot MRU cache of recently emitted multi-byte fixups (§3, §4.2).
//!
//! This is a per-pass resource: one [`RelocQueue`] is owned by one
//! in-flight encode or decode of one subspace's fixup stream, and is
//! re-initialized at the start of each subspace (§5). There is no
//! module-level state, unlike the C original (§9 REDESIGN FLAGS).

use alloc::vec::Vec;

const SLOTS: usize = 4;

/// One cached fixup byte sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Slot {
    bytes: Vec<u8>,
}

/// The fixup-encoder/decoder MRU cache. Slot 0 is always most recently
/// used.
#[derive(Debug, Clone, Default)]
pub struct RelocQueue {
    slots: [Slot; SLOTS],
}

impl RelocQueue {
    /// An empty queue (§4.2 `init`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all slots; called at the start of each subspace's pass and
    /// after every buffer flush during encoding (§5).
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.bytes.clear();
        }
    }

    /// Linear scan for an equal-size, byte-equal entry (§4.2 `find`).
    pub fn find(&self, bytes: &[u8]) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| !slot.bytes.is_empty() && slot.bytes.as_slice() == bytes)
    }

    /// Returns the bytes cached at `idx`, if any (used by the decoder to
    /// resolve `R_PREV_FIXUP+idx`).
    pub fn get(&self, idx: usize) -> Option<&[u8]> {
        self.slots.get(idx).and_then(|slot| {
            if slot.bytes.is_empty() {
                None
            } else {
                Some(slot.bytes.as_slice())
            }
        })
    }

    /// Shifts slots `0..=2` to `1..=3`, drops slot 3, and writes `bytes`
    /// into slot 0 (§4.2 `insert`).
    pub fn insert(&mut self, bytes: &[u8]) {
        self.slots[3] = self.slots[2].clone();
        self.slots[2] = self.slots[1].clone();
        self.slots[1] = self.slots[0].clone();
        self.slots[0] = Slot {
            bytes: bytes.to_vec(),
        };
    }

    /// Moves slot `idx` to slot 0, sliding the intervening slots down by
    /// one. `idx == 0` is a no-op. `idx > 3` is a programming error
    /// (§4.2 `promote`).
    pub fn promote(&mut self, idx: usize) {
        assert!(idx < SLOTS, "reloc queue slot index out of range: {idx}");
        if idx == 0 {
            return;
        }
        let promoted = self.slots[idx].clone();
        for i in (1..=idx).rev() {
            self.slots[i] = self.slots[i - 1].clone();
        }
        self.slots[0] = promoted;
    }

    /// `find` followed by `insert`-or-`promote`, mirroring the encoder's
    /// `try_prev_fixup` contract (§4.2): returns the *pre-promotion*
    /// slot index `bytes` was cached at, if it was already cached — the
    /// caller emits `R_PREV_FIXUP+idx` with that index, since the
    /// opcode refers to the queue state as the decoder will see it
    /// *before* this lookup's implicit promotion — or `None` after
    /// inserting it fresh.
    pub fn try_prev_fixup(&mut self, bytes: &[u8]) -> Option<usize> {
        match self.find(bytes) {
            Some(idx) => {
                self.promote(idx);
                Some(idx)
            }
            None => {
                self.insert(bytes);
                None
            }
        }
    }
}
