/*
 * Created on Wed Jan 24 2024
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
    bucket geometry
    ---
    One Group is one 64B cache line: an 8B header word plus 14 half-hashes. The
    parallel slot array carries the actual key/value records at 32B per slot (two
    slots per line). Everything a probe needs to reject a group (live bits,
    overflow count) or to scan it (the half-hashes) comes in with a single line
    fill.

    Publication discipline: a writer fills key, value and half-hash, then stores
    the slot flags with release and finally raises the live bit (also release).
    A reader masks SIMD matches with the live bits loaded *before* the hashes and
    confirms through an acquire load of the flags, so a match it acts on always
    carries fully-published data.
*/

use {
    crate::engine::{
        hash::HalfHash,
        sync::{Backoff, ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
    },
    core::{
        alloc::Layout,
        cell::UnsafeCell,
        ptr,
        sync::atomic::{AtomicU32, AtomicU64, AtomicU8},
    },
    std::alloc::{alloc, dealloc, handle_alloc_error},
};

/// Slots per cache line group
pub const GROUP_WIDTH: usize = 14;
/// Longest key stored inside the slot itself
pub const INLINE_KEY_MAX: usize = 23;

flags! {
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct SlotFlag: u8 {
        DELETED = 0x01,
        FILLED = 0x02,
        KEY_INLINE = 0x04,
    }
}

#[inline(always)]
pub const fn flag_has(flags: u8, flag: SlotFlag) -> bool {
    flags & flag.d() == flag.d()
}

#[inline(always)]
pub const fn flags_empty(flags: u8) -> bool {
    flags == 0
}

#[inline(always)]
pub const fn flag_live(flags: u8) -> bool {
    flag_has(flags, SlotFlag::FILLED) && !flag_has(flags, SlotFlag::DELETED)
}

/*
    header word layout:
      bits 0..14   live slot bitmap (masks SIMD candidates)
      bits 16..23  in-use count
      bit  24      line write lock
      bits 32..48  overflow count: how many inserts probed past this line before
                   landing. 0 is a probe's permission to stop
*/
const H_LIVE_MASK: u64 = (1 << GROUP_WIDTH) - 1;
const H_USED_SHIFT: u64 = 16;
const H_USED_UNIT: u64 = 1 << H_USED_SHIFT;
const H_USED_MASK: u64 = 0x7f;
const H_LOCK_BIT: u64 = 1 << 24;
const H_OVERFLOW_SHIFT: u64 = 32;
const H_OVERFLOW_UNIT: u64 = 1 << H_OVERFLOW_SHIFT;
const H_OVERFLOW_MASK: u64 = 0xffff;

#[repr(C, align(64))]
pub struct Group {
    header: AtomicU64,
    hashes: [AtomicU32; GROUP_WIDTH],
}

assertions! {
    sizeof!(Group) == 64,
    core::mem::align_of::<Group>() == 64,
}

impl Group {
    /// Live bitmap. Load this *before* scanning the hashes: the acquire pairs
    /// with the release in [`Self::live_set`] so a raised bit implies visible data
    #[inline(always)]
    pub fn live_mask(&self) -> u32 {
        (self.header.load(ORD_ACQ) & H_LIVE_MASK) as u32
    }
    #[inline(always)]
    pub fn used(&self) -> u8 {
        ((self.header.load(ORD_ACQ) >> H_USED_SHIFT) & H_USED_MASK) as u8
    }
    #[inline(always)]
    pub fn overflow(&self) -> u16 {
        ((self.header.load(ORD_ACQ) >> H_OVERFLOW_SHIFT) & H_OVERFLOW_MASK) as u16
    }
    #[inline(always)]
    pub fn overflow_incr(&self) {
        self.header.fetch_add(H_OVERFLOW_UNIT, ORD_ACR);
    }
    #[inline(always)]
    pub fn overflow_decr(&self) {
        debug_assert_ne!(self.overflow(), 0);
        self.header.fetch_sub(H_OVERFLOW_UNIT, ORD_ACR);
    }
    /// Publish a slot: live bit up, in-use count up
    #[inline(always)]
    pub fn live_set(&self, slot: usize) {
        self.header.fetch_or(1 << slot, ORD_REL);
        self.header.fetch_add(H_USED_UNIT, ORD_ACR);
    }
    /// Retract a slot: live bit down, in-use count down
    #[inline(always)]
    pub fn live_clear(&self, slot: usize) {
        self.header.fetch_and(!(1 << slot), ORD_ACR);
        self.header.fetch_sub(H_USED_UNIT, ORD_ACR);
    }
    #[inline(always)]
    pub fn hash_at(&self, slot: usize) -> HalfHash {
        self.hashes[slot].load(ORD_ACQ)
    }
    /// Store a half-hash. Line lock held; published by the flags/live stores
    #[inline(always)]
    pub fn hash_store(&self, slot: usize, hash: HalfHash) {
        self.hashes[slot].store(hash, ORD_RLX);
    }
    #[inline(always)]
    pub fn hashes_ptr(&self) -> *const u32 {
        self.hashes.as_ptr() as *const u32
    }
    /// Take the line write lock. Writers only; readers never come here
    pub fn lock(&self) -> GroupWriteGuard<'_> {
        let backoff = Backoff::new();
        while self.header.fetch_or(H_LOCK_BIT, ORD_ACR) & H_LOCK_BIT != 0 {
            backoff.snooze();
        }
        GroupWriteGuard { group: self }
    }
}

pub struct GroupWriteGuard<'a> {
    group: &'a Group,
}

impl Drop for GroupWriteGuard<'_> {
    fn drop(&mut self) {
        self.group.header.fetch_and(!H_LOCK_BIT, ORD_REL);
    }
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct ExternalKey {
    size: u32,
    /// self-describing block: `[size: u32][bytes]`
    block: *mut u8,
    /// first four key bytes, checked before chasing `block`
    prefix: [u8; 4],
}

union! {
    #[derive(Clone, Copy)]
    pub union SlotKey {
        inline: [u8; INLINE_KEY_MAX],
        external: ExternalKey,
    }
}

assertions! {
    sizeof!(SlotKey) == INLINE_KEY_MAX,
}

/// One key/value record. 32 bytes so a pair shares a cache line with nothing else
#[repr(C, align(32))]
pub struct Slot {
    flags: AtomicU8,
    key: UnsafeCell<SlotKey>,
    data: AtomicU64,
}

assertions! {
    sizeof!(Slot) == 32,
}

// the key union is only written under the line lock while the slot is dead, and
// only read back after an acquire on the flags observed it live
unsafe impl Send for Slot {}
unsafe impl Sync for Slot {}

const KEY_BLOCK_HDR: usize = sizeof!(u32);

impl Slot {
    #[inline(always)]
    pub fn flags(&self) -> u8 {
        self.flags.load(ORD_ACQ)
    }
    #[inline(always)]
    pub fn value(&self) -> u64 {
        self.data.load(ORD_ACQ)
    }
    #[inline(always)]
    pub fn value_cas(&self, current: u64, new: u64) -> bool {
        self.data
            .compare_exchange(current, new, ORD_ACR, ORD_ACQ)
            .is_ok()
    }
    /// Tombstone this slot. Returns the pre-image of the flags
    #[inline(always)]
    pub fn tombstone(&self) -> u8 {
        self.flags.fetch_or(SlotFlag::DELETED.d(), ORD_ACR)
    }
    /// Write the key and value of a dead slot, then publish it as filled.
    ///
    /// ## Safety
    /// The line lock must be held and the slot must not be live
    pub unsafe fn publish(&self, key: &[u8], value: u64) {
        let mut flags = SlotFlag::FILLED.d();
        if key.len() <= INLINE_KEY_MAX {
            let mut inline = [0u8; INLINE_KEY_MAX];
            inline[..key.len()].copy_from_slice(key);
            (*self.key.get()).inline = inline;
            flags |= SlotFlag::KEY_INLINE.d();
        } else {
            let block = alloc_key_block(key);
            let mut prefix = [0u8; 4];
            prefix.copy_from_slice(&key[..4]);
            (*self.key.get()).external = ExternalKey {
                size: key.len() as u32,
                block,
                prefix,
            };
        }
        self.data.store(value, ORD_RLX);
        // the release store publishes the key bytes and the value in one go
        self.flags.store(flags, ORD_REL);
    }
    /// Compare the stored key against `key`.
    ///
    /// ## Safety
    /// `flags` must be a live observation of this slot's flags (acquire-loaded)
    #[inline]
    pub unsafe fn key_matches(&self, key: &[u8], flags: u8) -> bool {
        if flag_has(flags, SlotFlag::KEY_INLINE) {
            if key.len() > INLINE_KEY_MAX {
                return false;
            }
            let inline = &(*self.key.get()).inline;
            // inline keys are zero padded, so the tail must be clear for a match
            inline[..key.len()] == *key && inline[key.len()..].iter().all(|b| *b == 0)
        } else {
            let external = (*self.key.get()).external;
            // copy the packed fields out before comparing
            let (size, prefix) = (external.size, external.prefix);
            size as usize == key.len()
                && prefix == key[..4]
                && key_block_bytes(external.block) == key
        }
    }
    /// The stored key bytes.
    ///
    /// ## Safety
    /// Same contract as [`Self::key_matches`]; the returned slice is only valid
    /// while the slot stays live
    pub unsafe fn key_bytes<'a>(&'a self, flags: u8) -> &'a [u8] {
        if flag_has(flags, SlotFlag::KEY_INLINE) {
            let inline = &(*self.key.get()).inline;
            let len = INLINE_KEY_MAX - inline.iter().rev().take_while(|b| **b == 0).count();
            &inline[..len]
        } else {
            key_block_bytes((*self.key.get()).external.block)
        }
    }
    /// The external key block of a slot that just died, if it has one. The caller
    /// owns handing it to the GC
    pub fn retired_key_block(&self, flags: u8) -> Option<*mut u8> {
        if flag_has(flags, SlotFlag::KEY_INLINE) || flags_empty(flags) {
            None
        } else {
            Some(unsafe {
                // UNSAFE(@ohsayan): !KEY_INLINE on a once-live slot means the
                // external arm is the initialized one
                (*self.key.get()).external.block
            })
        }
    }
    /// Free the external key of a still-live slot; table teardown only
    pub(super) fn drop_owned_key(&self) {
        let flags = self.flags.load(ORD_ACQ);
        if flag_live(flags) && !flag_has(flags, SlotFlag::KEY_INLINE) {
            unsafe {
                // UNSAFE(@ohsayan): live and external, so the block is ours
                dealloc_key_block((*self.key.get()).external.block)
            }
        }
    }
}

/// Allocate a self-describing key block: `[len: u32][bytes]`
fn alloc_key_block(key: &[u8]) -> *mut u8 {
    let layout = key_block_layout(key.len());
    unsafe {
        // UNSAFE(@ohsayan): layout is never zero sized (header)
        let block = alloc(layout);
        if block.is_null() {
            handle_alloc_error(layout);
        }
        ptr::write_unaligned(block as *mut u32, key.len() as u32);
        ptr::copy_nonoverlapping(key.as_ptr(), block.add(KEY_BLOCK_HDR), key.len());
        block
    }
}

/// Free a block produced by [`alloc_key_block`]. Also the body of the GC
/// destructor for the key block object class
///
/// ## Safety
/// `block` must be an unfreed [`alloc_key_block`] result
pub unsafe fn dealloc_key_block(block: *mut u8) {
    let len = ptr::read_unaligned(block as *const u32) as usize;
    dealloc(block, key_block_layout(len));
}

unsafe fn key_block_bytes<'a>(block: *const u8) -> &'a [u8] {
    let len = ptr::read_unaligned(block as *const u32) as usize;
    core::slice::from_raw_parts(block.add(KEY_BLOCK_HDR), len)
}

fn key_block_layout(len: usize) -> Layout {
    Layout::array::<u8>(KEY_BLOCK_HDR + len).unwrap()
}
