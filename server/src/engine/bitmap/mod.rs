/*
 * Created on Wed Jan 10 2024
 *
 * This file is a part of Cachet
 * Cachet is a free and open-source in-memory cache store written by
 * Sayan Nandan ("the Author") with the vision to deliver raw throughput
 * on modern multi-core machines without giving up on safety or
 * observability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

#[cfg(test)]
mod tests;

/*
    slots bitmap
    ---
    A flat pool of slot indices handed out under MPMC contention. The pool is cut
    into shards of 14 slots; each shard is one atomic word carrying the in-use
    bits plus a used count, so acquire/release touch exactly one cache word and
    never take a lock. On CAS failure the search does NOT rescan the losing shard:
    it moves on and only restarts from the top if a full pass came up dry. The one
    guarantee on offer: an index handed to one caller is handed to nobody else
    until it is released.
*/

use {
    crate::{
        engine::sync::{ORD_ACQ, ORD_ACR},
        util::compiler,
    },
    core::sync::atomic::AtomicU64,
};

/// Slots tracked per shard word
pub const SHARD_SIZE: u64 = 14;
/// The "pool is dry" sentinel
pub const NO_SLOT: u64 = u64::MAX;

/// Used count: bits 16..23 (the in-use field owns bits 0..14)
const USED_SHIFT: u64 = 16;
const USED_UNIT: u64 = 1 << USED_SHIFT;
const USED_MASK: u64 = 0x7f;

/// First zero bit of a byte, `0xff` when the byte is saturated
const FIRST_ZERO: [u8; 256] = {
    let mut lut = [0xffu8; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut bit = 0u8;
        while bit < 8 {
            if byte & (1 << bit) == 0 {
                lut[byte] = bit;
                break;
            }
            bit += 1;
        }
        byte += 1;
    }
    lut
};

#[inline(always)]
fn shard_find_first_zero(word: u64) -> Option<u64> {
    let lo = FIRST_ZERO[(word & 0xff) as usize];
    if lo != 0xff {
        return Some(lo as u64);
    }
    // saturate the two bits past the field so they never report as free
    let hi = FIRST_ZERO[(((word >> 8) & 0x3f) | 0xc0) as usize];
    if hi != 0xff {
        return Some(8 + hi as u64);
    }
    None
}

#[inline(always)]
const fn shard_used(word: u64) -> u64 {
    (word >> USED_SHIFT) & USED_MASK
}

pub struct SlotsBitmap {
    size: u64,
    shards: Box<[AtomicU64]>,
}

impl SlotsBitmap {
    /// Initialize a pool of at least `size` slots (rounded up to a whole shard)
    pub fn new(size: u64) -> Self {
        assert_ne!(size, 0, "empty bitmap");
        let shards_count = size.div_ceil(SHARD_SIZE) as usize;
        let shards = (0..shards_count).map(|_| AtomicU64::new(0)).collect();
        Self {
            size: shards_count as u64 * SHARD_SIZE,
            shards,
        }
    }
    /// Number of slots in the pool
    pub fn len(&self) -> u64 {
        self.size
    }
    /// Grab the next free slot, scanning shards front to back
    pub fn next_available(&self) -> u64 {
        self.next_available_with_stripe(0, 1)
    }
    /// Grab the next free slot scanning shards `start, start+step, ...`; callers
    /// stripe by worker id to keep hot shards disjoint. Dry pool returns [`NO_SLOT`]
    pub fn next_available_with_stripe(&self, start: u16, step: u16) -> u64 {
        debug_assert_ne!(step, 0);
        loop {
            let mut lost_a_race = false;
            let mut shard_index = start as usize;
            while compiler::likely(shard_index < self.shards.len()) {
                let shard = &self.shards[shard_index];
                let word = shard.load(ORD_ACQ);
                if compiler::unlikely(shard_used(word) >= SHARD_SIZE) {
                    // saturated; the count may lag the bits but a stale skip only
                    // costs us this pass
                    shard_index += step as usize;
                    continue;
                }
                let Some(bit) = shard_find_first_zero(word) else {
                    shard_index += step as usize;
                    continue;
                };
                if shard
                    .compare_exchange(word, word | (1 << bit), ORD_ACR, ORD_ACQ)
                    .is_err()
                {
                    /*
                        somebody else moved this word under us. Rescanning it now is
                        how livelock starts, so move to the next shard instead and
                        remember to run one more pass from the top if this one ends
                        empty-handed
                    */
                    lost_a_race = true;
                    shard_index += step as usize;
                    continue;
                }
                shard.fetch_add(USED_UNIT, ORD_ACR);
                return shard_index as u64 * SHARD_SIZE + bit;
            }
            if !lost_a_race {
                return NO_SLOT;
            }
        }
    }
    /// Hand a slot back. Releasing a slot that is already free is a no-op
    pub fn release(&self, index: u64) {
        let shard = &self.shards[(index / SHARD_SIZE) as usize];
        let bit = 1u64 << (index % SHARD_SIZE);
        let mut word = shard.load(ORD_ACQ);
        loop {
            if compiler::unlikely(word & bit == 0) {
                return;
            }
            match shard.compare_exchange(word, word & !bit, ORD_ACR, ORD_ACQ) {
                Ok(_) => break,
                Err(now) => word = now,
            }
        }
        shard.fetch_sub(USED_UNIT, ORD_ACR);
    }
    /// Next in-use slot index `>= from`, [`NO_SLOT`] when the tail is clear. Used by
    /// snapshotters walking live entries
    pub fn iter_from(&self, from: u64) -> u64 {
        let mut index = from;
        while index < self.size {
            let word = self.shards[(index / SHARD_SIZE) as usize].load(ORD_ACQ);
            let bit = index % SHARD_SIZE;
            if word & (1 << bit) != 0 {
                return index;
            }
            index += 1;
        }
        NO_SLOT
    }
    #[cfg(test)]
    pub(super) fn is_set(&self, index: u64) -> bool {
        self.shards[(index / SHARD_SIZE) as usize].load(ORD_ACQ) & (1 << (index % SHARD_SIZE)) != 0
    }
}
