/*
 * Created on Sat Jan 06 2024
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

//! Key hashing. One t1ha2 pass per request: the full 64 bits pick the bucket, the
//! upper half doubles as the per-slot prefilter word

/// Fixed seed. Changing this invalidates nothing on disk (the core persists
/// nothing) but it must stay identical across all threads of one process
const T1HA2_SEED: u64 = 42;
/// Forced top bit of every stored half-hash; keeps `0` free as the empty sentinel
pub const HALF_HASH_HIGH_BIT: u32 = 0x8000_0000;

pub type KeyHash = u64;
pub type HalfHash = u32;

#[inline(always)]
pub fn hash_key(key: &[u8]) -> KeyHash {
    t1ha::t1ha2_atonce(key, T1HA2_SEED)
}

/// Fold a full hash into the 32-bit stored form. The top bit is forced so a raw
/// upper half of `0` still maps to a nonzero word
#[inline(always)]
pub const fn half_hash(hash: KeyHash) -> HalfHash {
    ((hash >> 32) as HalfHash) | HALF_HASH_HIGH_BIT
}
