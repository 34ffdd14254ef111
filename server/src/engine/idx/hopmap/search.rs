/*
 * Created on Thu Jan 25 2024
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

/*
    half-hash prefilter
    ---
    Compare one half-hash against a group's 14 stored words and return the match
    bitmap. The widest instruction set the CPU has is picked ONCE per table
    generation and stashed as a plain function pointer; the hot path never asks
    the CPU what it can do again. The SIMD paths read the hash words through raw
    loads that race with writers on purpose: a false candidate is thrown out by
    the flags/key confirmation that follows, and a missed candidate can't happen
    because callers load the live mask (acquire) before scanning.
*/

use {super::group::GROUP_WIDTH, crate::engine::hash::HalfHash};

/// All 14 candidate bits
pub const SEARCH_MASK_ALL: u32 = (1 << GROUP_WIDTH) - 1;

type SearchFn = unsafe fn(HalfHash, *const u32) -> u32;

#[derive(Clone, Copy)]
/// The per-generation prefilter dispatch
pub struct Searcher {
    f: SearchFn,
    name: &'static str,
}

impl Searcher {
    /// Detect once. AVX-512 rides behind the `nightly` feature like the rest of
    /// the bleeding edge
    pub fn pick() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            #[cfg(feature = "nightly")]
            if std::arch::is_x86_feature_detected!("avx512f") {
                return Self {
                    f: search_avx512,
                    name: "avx512f",
                };
            }
            if std::arch::is_x86_feature_detected!("avx2") {
                return Self {
                    f: search_avx2,
                    name: "avx2",
                };
            }
            // sse2 is x86_64 baseline
            Self {
                f: search_sse2,
                name: "sse2",
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self {
                f: search_scalar,
                name: "scalar",
            }
        }
    }
    #[cfg(test)]
    pub fn scalar() -> Self {
        Self {
            f: search_scalar,
            name: "scalar",
        }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    /// Match bitmap of `half` over the group's hash words.
    ///
    /// ## Safety
    /// `hashes` must point at [`GROUP_WIDTH`] readable `u32`s
    #[inline(always)]
    pub unsafe fn search(&self, half: HalfHash, hashes: *const u32) -> u32 {
        (self.f)(half, hashes)
    }
}

impl core::fmt::Debug for Searcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Searcher::{}", self.name)
    }
}

#[allow(dead_code)] // the non-simd fallback; x86_64 builds only reach it from tests
unsafe fn search_scalar(half: HalfHash, hashes: *const u32) -> u32 {
    let mut mask = 0;
    let mut i = 0;
    while i < GROUP_WIDTH {
        mask |= ((hashes.add(i).read_volatile() == half) as u32) << i;
        i += 1;
    }
    mask
}

#[cfg(target_arch = "x86_64")]
unsafe fn search_sse2(half: HalfHash, hashes: *const u32) -> u32 {
    use core::arch::x86_64::*;
    #[inline(always)]
    unsafe fn lane4(needle: __m128i, hashes: *const u32, offset: usize) -> u32 {
        let eq = _mm_cmpeq_epi32(
            _mm_loadu_si128(hashes.add(offset) as *const __m128i),
            needle,
        );
        (_mm_movemask_ps(_mm_castsi128_ps(eq)) as u32) << offset
    }
    let needle = _mm_set1_epi32(half as i32);
    // 0..4, 4..8, 8..12, 10..14: the overlap bits just OR in twice
    (lane4(needle, hashes, 0)
        | lane4(needle, hashes, 4)
        | lane4(needle, hashes, 8)
        | lane4(needle, hashes, 10))
        & SEARCH_MASK_ALL
}

#[cfg(target_arch = "x86_64")]
unsafe fn search_avx2(half: HalfHash, hashes: *const u32) -> u32 {
    #[target_feature(enable = "avx2")]
    unsafe fn imp(half: HalfHash, hashes: *const u32) -> u32 {
        use core::arch::x86_64::*;
        let needle = _mm256_set1_epi32(half as i32);
        let lo = _mm256_cmpeq_epi32(_mm256_loadu_si256(hashes as *const __m256i), needle);
        let hi = _mm256_cmpeq_epi32(
            _mm256_loadu_si256(hashes.add(6) as *const __m256i),
            needle,
        );
        let lo = _mm256_movemask_ps(_mm256_castsi256_ps(lo)) as u32;
        let hi = (_mm256_movemask_ps(_mm256_castsi256_ps(hi)) as u32) << 6;
        (lo | hi) & SEARCH_MASK_ALL
    }
    imp(half, hashes)
}

#[cfg(all(target_arch = "x86_64", feature = "nightly"))]
unsafe fn search_avx512(half: HalfHash, hashes: *const u32) -> u32 {
    #[target_feature(enable = "avx512f")]
    unsafe fn imp(half: HalfHash, hashes: *const u32) -> u32 {
        use core::arch::x86_64::*;
        // the masked load fault-suppresses the two lanes past the line
        let words = _mm512_maskz_loadu_epi32(SEARCH_MASK_ALL as __mmask16, hashes as *const i32);
        _mm512_mask_cmpeq_epu32_mask(
            SEARCH_MASK_ALL as __mmask16,
            words,
            _mm512_set1_epi32(half as i32),
        ) as u32
    }
    imp(half, hashes)
}
