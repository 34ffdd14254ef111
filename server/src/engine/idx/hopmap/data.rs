/*
 * Created on Tue Jan 23 2024
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

//! Table geometry: the prime bucket ladder, the probe-depth schedule and the
//! backing arrays of one immutable-shape table generation

use {
    super::{
        group::{Group, Slot, GROUP_WIDTH},
        search::Searcher,
    },
    crate::engine::{hash::KeyHash, mem::FixedArray},
};

macro_rules! prime_ladder {
    ($($prime:literal),* $(,)?) => {
        /// The bucket count ladder. Every table generation uses one of these
        pub const PRIMES: &[u64] = &[$($prime),*];
        /// `number % prime` dispatched over the ladder so each arm folds to a
        /// constant-divisor modulo instead of a general division
        #[inline(always)]
        pub fn primenumbers_mod(number: u64, prime: u64) -> u64 {
            match prime {
                $($prime => number % $prime,)*
                _ => {
                    debug_assert!(false, "{prime} is not on the ladder");
                    number % prime
                }
            }
        }
    };
}

prime_ladder! {
    42, // not prime, but the answer
    101,
    307,
    677,
    1523,
    3389,
    7639,
    17203,
    26813,
    40213,
    60353,
    90529,
    135799,
    203669,
    305581,
    458377,
    687581,
    1031399,
    1547101,
    2320651,
    5221501,
    7832021,
    11748391,
    17622551,
    26433887,
    39650833,
    59476253,
    89214403,
    133821599,
    200732527,
    301099033,
    451649113,
    677472127,
    1016208581,
    1524312899,
    2286469357,
    3429704039,
    4294967291,
}

pub const PRIMES_MAX: u64 = 4294967291;

/// Whether a requested size can be served by the ladder at all
pub fn primenumbers_valid(number: u64) -> bool {
    number <= PRIMES_MAX
}

/// Smallest ladder entry `>= number`
pub fn primenumbers_next(number: u64) -> Option<u64> {
    PRIMES.iter().copied().find(|p| *p >= number)
}

/// Next ladder entry strictly above `prime`; `None` at the top
pub fn primenumbers_next_after(prime: u64) -> Option<u64> {
    PRIMES.iter().copied().find(|p| *p > prime)
}

/// Probe depth by table size. Small tables probe deeper since their collisions
/// cluster harder; the depth caps at 32 lines (32 × 14 = 448 slots)
const CACHELINES_TO_PROBE_MAP: &[(u64, u16)] = &[
    (42, 2),
    (3389, 4),
    (7639, 6),
    (17203, 7),
    (26813, 8),
    (40213, 9),
    (458377, 10),
    (2320651, 12),
    (17622551, 16),
    (89214403, 17),
    (133821599, 18),
    (PRIMES_MAX, 32),
];

pub fn cachelines_to_probe(buckets_count: u64) -> u16 {
    for (size, depth) in CACHELINES_TO_PROBE_MAP {
        if buckets_count <= *size {
            return *depth;
        }
    }
    32
}

/// One table generation. The shape (bucket count, probe depth, array lengths)
/// never changes once built; resize builds a new generation and retires this one
/// through the epoch GC
pub struct HopmapData {
    buckets_count: u64,
    buckets_count_real: u64,
    groups_count: u64,
    cachelines_to_probe: u16,
    searcher: Searcher,
    groups: FixedArray<Group>,
    slots: FixedArray<Slot>,
}

impl HopmapData {
    /// Build a generation with `buckets_count` (must sit on the ladder).
    /// `cachelines_to_probe` of 0 picks the depth from the size schedule
    pub fn new(buckets_count: u64, cachelines_to_probe_override: u16) -> Self {
        debug_assert!(PRIMES.contains(&buckets_count));
        let cachelines = if cachelines_to_probe_override == 0 {
            cachelines_to_probe(buckets_count)
        } else {
            cachelines_to_probe_override
        };
        // every bucket index must be able to host a full neighborhood, so the
        // allocation carries a tail of `cachelines` whole groups past the last
        // home group
        let last_home_group = (buckets_count - 1) / GROUP_WIDTH as u64;
        let groups_count = last_home_group + cachelines as u64;
        let buckets_count_real = groups_count * GROUP_WIDTH as u64;
        let (groups, slots) = unsafe {
            // UNSAFE(@ohsayan): the all-zeroes group/slot is the valid empty state
            (
                FixedArray::alloc_zeroed(groups_count as usize),
                FixedArray::alloc_zeroed(buckets_count_real as usize),
            )
        };
        Self {
            buckets_count,
            buckets_count_real,
            groups_count,
            cachelines_to_probe: cachelines,
            searcher: Searcher::pick(),
            groups,
            slots,
        }
    }
    #[inline(always)]
    pub fn buckets_count(&self) -> u64 {
        self.buckets_count
    }
    #[inline(always)]
    pub fn buckets_count_real(&self) -> u64 {
        self.buckets_count_real
    }
    #[inline(always)]
    pub fn groups_count(&self) -> u64 {
        self.groups_count
    }
    #[inline(always)]
    pub fn cachelines_to_probe(&self) -> u16 {
        self.cachelines_to_probe
    }
    #[inline(always)]
    pub fn searcher(&self) -> Searcher {
        self.searcher
    }
    /// Home bucket for a full hash
    #[inline(always)]
    pub fn bucket_index(&self, hash: KeyHash) -> u64 {
        primenumbers_mod(hash, self.buckets_count)
    }
    /// Neighborhood of a bucket index as a group range. The key, if present,
    /// lives nowhere else
    #[inline(always)]
    pub fn neighborhood(&self, index: u64) -> (u64, u64) {
        let start = index / GROUP_WIDTH as u64;
        (start, start + self.cachelines_to_probe as u64)
    }
    #[inline(always)]
    pub fn group(&self, group_index: u64) -> &Group {
        self.groups.get(group_index as usize)
    }
    #[inline(always)]
    pub fn slot(&self, slot_index: u64) -> &Slot {
        self.slots.get(slot_index as usize)
    }
    /// Home group for a key
    #[inline(always)]
    pub fn home_group(&self, hash: KeyHash) -> u64 {
        self.bucket_index(hash) / GROUP_WIDTH as u64
    }
    /// Sum of per-group in-use counts; exact only in quiescence
    pub fn live_count(&self) -> u64 {
        (0..self.groups_count).map(|g| self.group(g).used() as u64).sum()
    }
}

impl Drop for HopmapData {
    fn drop(&mut self) {
        // externally stored keys of live slots belong to this generation;
        // tombstoned ones were staged to the GC when they died
        for idx in 0..self.buckets_count_real {
            self.slot(idx).drop_owned_key();
        }
    }
}
