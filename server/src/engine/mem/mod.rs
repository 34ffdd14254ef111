/*
 * Created on Fri Jan 05 2024
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

use {
    core::{
        alloc::Layout,
        ops::{Deref, DerefMut},
        ptr::NonNull,
    },
    std::alloc::{alloc_zeroed, dealloc},
};

#[derive(Debug, Default)]
#[cfg_attr(any(target_arch = "x86_64", target_arch = "aarch64"), repr(align(128)))]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64")),
    repr(align(64))
)]
/// Cache line padding to keep hot atomics from invalidating their neighbors.
/// 128B on x86_64 (spatial prefetcher pulls line pairs) and aarch64 (big.LITTLE
/// implementations disagree on the line size); 64B elsewhere
pub struct CachePadded<T> {
    data: T,
}

impl<T> CachePadded<T> {
    pub const fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

/// A zero-initialized heap array of `T` that keeps `T`'s own alignment (the bucket
/// arrays rely on `repr(align)` of their element type carrying through). Unlike a
/// `Vec` the block is never grown, moved or reallocated for the life of the value
pub struct FixedArray<T> {
    p: NonNull<T>,
    l: usize,
}

// safe because the array owns its block for its full lifetime
unsafe impl<T: Send> Send for FixedArray<T> {}
unsafe impl<T: Sync> Sync for FixedArray<T> {}

impl<T> FixedArray<T> {
    /// Allocate a zeroed block of `len` elements of `T`
    ///
    /// ## Safety
    /// The all-zeroes bit pattern must be a valid `T`. Elements never run their
    /// destructors; only the block itself is freed
    pub unsafe fn alloc_zeroed(len: usize) -> Self {
        let layout = Self::layout(len);
        let p = alloc_zeroed(layout);
        assert!(!p.is_null(), "alloc,0");
        Self {
            p: NonNull::new_unchecked(p as *mut T),
            l: len,
        }
    }
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.l
    }
    #[inline(always)]
    pub fn as_ptr(&self) -> *const T {
        self.p.as_ptr()
    }
    #[inline(always)]
    fn layout(len: usize) -> Layout {
        Layout::array::<T>(len).unwrap()
    }
    /// Get a reference to the element at `idx` without a bounds check
    ///
    /// ## Safety
    /// `idx` must be in bounds
    #[inline(always)]
    pub unsafe fn get_unchecked(&self, idx: usize) -> &T {
        &*self.p.as_ptr().add(idx)
    }
    #[inline(always)]
    pub fn get(&self, idx: usize) -> &T {
        assert!(idx < self.l);
        unsafe {
            // UNSAFE(@ohsayan): just bounds checked
            self.get_unchecked(idx)
        }
    }
}

impl<T> Drop for FixedArray<T> {
    fn drop(&mut self) {
        unsafe {
            // UNSAFE(@ohsayan): we allocated this block with this exact layout
            dealloc(self.p.as_ptr() as *mut u8, Self::layout(self.l))
        }
    }
}
