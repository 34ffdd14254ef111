/*
 * Created on Mon Jan 29 2024
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

pub mod data;
pub mod group;
mod resize;
pub mod search;
#[cfg(test)]
mod tests;

/*
    concurrent neighborhood map
    ---
    Fixed-address open addressing: a key's bucket is `t1ha2(key) mod prime`, and
    the record lives somewhere in the bounded run of cache line groups starting at
    that bucket's line (the neighborhood). A group's 14 half-hashes are scanned
    with one SIMD compare; only surviving candidates get a real key compare.
    Readers take no locks at all: they ride on the publication order (hash, key,
    value, then flags and the live bit with release). Writers serialize per line
    through a single header bit.

    A probe may stop at the first group whose overflow count is zero: inserts bump
    that count on every line they probe past before landing, so a zero proves no
    key homed at or before this line ever skipped over it.

    Two writers can race to create the same key in two different slots; that is a
    known hole in search-then-create without a global lock. The verify pass after
    every fresh insert closes it: rescan the neighborhood and tombstone the copy
    at the higher index. The pass is part of the protocol, not an optimization --
    skipping it breaks the at-most-one-live-slot-per-key invariant.
*/

use {
    self::{
        data::HopmapData,
        group::{flag_live, Slot, GROUP_WIDTH},
    },
    crate::engine::{
        config::TableConfig,
        error::{OpError, OpResult},
        gc::{self, object_type, ring::Staged},
        hash::{self, HalfHash, KeyHash},
        sync::{Backoff, ORD_ACQ},
    },
    core::{
        ptr,
        sync::atomic::{AtomicBool, AtomicPtr},
    },
};

/// The storage table. One per keyspace, created at boot, dropped at shutdown
/// (after the epoch GC has drained; teardown order is the embedder's contract)
pub struct Hopmap {
    config: TableConfig,
    current: AtomicPtr<HopmapData>,
    old: AtomicPtr<HopmapData>,
    resizing: AtomicBool,
}

impl Hopmap {
    pub fn new(config: TableConfig) -> Self {
        assert!(
            data::primenumbers_valid(config.initial_size),
            "requested table size is beyond the ladder"
        );
        let prime = data::primenumbers_next(config.initial_size.max(1)).unwrap();
        let boot = Box::into_raw(Box::new(HopmapData::new(
            prime,
            config.cachelines_to_probe,
        )));
        log::debug!(
            "hopmap: init with {prime} buckets ({} requested)",
            config.initial_size
        );
        Self {
            config,
            current: AtomicPtr::new(boot),
            old: AtomicPtr::new(ptr::null_mut()),
            resizing: AtomicBool::new(false),
        }
    }
    #[inline(always)]
    pub(super) fn cur(&self) -> &HopmapData {
        unsafe {
            // UNSAFE(@ohsayan): never null, and retired generations outlive
            // every reader through the epoch GC
            &*self.current.load(ORD_ACQ)
        }
    }
    #[inline(always)]
    pub(super) fn old_gen(&self) -> Option<&HopmapData> {
        let old = self.old.load(ORD_ACQ);
        if old.is_null() {
            None
        } else {
            Some(unsafe {
                // UNSAFE(@ohsayan): non-null old is detached only after drain,
                // then retired through the epoch GC
                &*old
            })
        }
    }
}

// read path
impl Hopmap {
    /// The stored value, unless the key is absent or tombstoned
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        let hash = hash::hash_key(key);
        let half = hash::half_hash(hash);
        if let Some(found) = Self::read_in(self.cur(), hash, half, key) {
            return Some(found);
        }
        // mid-resize the record may still sit in the previous generation
        self.old_gen()
            .and_then(|old| Self::read_in(old, hash, half, key))
    }
    pub fn contains(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }
    fn read_in(data: &HopmapData, hash: KeyHash, half: HalfHash, key: &[u8]) -> Option<u64> {
        let (_, _, slot) = Self::probe(data, hash, half, key)?;
        let value = slot.value();
        // the slot may have tombstoned under us between the match and the value
        // load; a dead recheck means the delete wins the race
        if flag_live(slot.flags()) {
            Some(value)
        } else {
            None
        }
    }
    /// Find the live slot holding `key`, if any. Lock-free
    fn probe<'a>(
        data: &'a HopmapData,
        hash: KeyHash,
        half: HalfHash,
        key: &[u8],
    ) -> Option<(u64, usize, &'a Slot)> {
        let (start, end) = data.neighborhood(data.bucket_index(hash));
        let searcher = data.searcher();
        for g in start..end {
            let group = data.group(g);
            // live mask BEFORE the hash words; see the publication order note
            let live = group.live_mask();
            let mut cand = unsafe {
                // UNSAFE(@ohsayan): a group's hash array is GROUP_WIDTH words
                searcher.search(half, group.hashes_ptr())
            } & live;
            while cand != 0 {
                let i = cand.trailing_zeros() as usize;
                cand &= cand - 1;
                let slot = data.slot(g * GROUP_WIDTH as u64 + i as u64);
                let flags = slot.flags();
                if flag_live(flags)
                    && unsafe {
                        // UNSAFE(@ohsayan): flags is an acquire observation of a live slot
                        slot.key_matches(key, flags)
                    }
                {
                    return Some((g, i, slot));
                }
            }
            if group.overflow() == 0 {
                // no key homed at or before this line lives past it
                return None;
            }
        }
        None
    }
}

// write path
impl Hopmap {
    /// Insert or update. False only on a soft neighborhood-full (resize disabled
    /// or the ladder is exhausted)
    pub fn set(&self, key: &[u8], value: u64) -> bool {
        self.set_inner(key, value).is_ok()
    }
    pub fn set_inner(&self, key: &[u8], value: u64) -> OpResult<()> {
        let hash = hash::hash_key(key);
        let half = hash::half_hash(hash);
        let backoff = Backoff::new();
        let mut resized = false;
        loop {
            let data = self.cur();
            if let Some((_, _, slot)) = Self::probe(data, hash, half, key) {
                if Self::update_value(slot, value) {
                    return Ok(());
                }
                // tombstoned under us; the delete won, now we insert fresh
                backoff.snooze();
                continue;
            }
            match Self::insert(data, hash, half, key, value) {
                Ok((g, i)) => {
                    Self::verify_unique(data, hash, half, key, g, i);
                    return Ok(());
                }
                Err(OpError::NeighborhoodFull) if self.config.can_auto_resize && !resized => {
                    resized = true;
                    match self.upsize_begin() {
                        // either we grew the table or someone else already is;
                        // both mean the current generation changed, so retry
                        Ok(()) | Err(OpError::ResizeInProgress) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
    /// CAS the new value over whatever is there. False if the slot died
    fn update_value(slot: &Slot, value: u64) -> bool {
        loop {
            if !flag_live(slot.flags()) {
                return false;
            }
            let current = slot.value();
            if slot.value_cas(current, value) {
                return true;
            }
            // CAS lost to another writer: their success is our forward progress,
            // so just go around with the fresh value
        }
    }
    /// Claim a dead slot in the neighborhood and publish the record into it
    fn insert(
        data: &HopmapData,
        hash: KeyHash,
        half: HalfHash,
        key: &[u8],
        value: u64,
    ) -> OpResult<(u64, usize)> {
        let (start, end) = data.neighborhood(data.bucket_index(hash));
        for g in start..end {
            let group = data.group(g);
            if group.used() as usize == GROUP_WIDTH {
                continue;
            }
            let guard = group.lock();
            for i in 0..GROUP_WIDTH {
                let slot = data.slot(g * GROUP_WIDTH as u64 + i as u64);
                // a dead slot is fair game: never-used (empty) or tombstoned
                if flag_live(slot.flags()) {
                    continue;
                }
                // overflow goes up on every line we probed past, and BEFORE the
                // record becomes findable, so no probe can stop short of it
                for skipped in start..g {
                    data.group(skipped).overflow_incr();
                }
                group.hash_store(i, half);
                unsafe {
                    // UNSAFE(@ohsayan): line locked, slot dead
                    slot.publish(key, value);
                }
                group.live_set(i);
                drop(guard);
                return Ok((g, i));
            }
            drop(guard);
        }
        Err(OpError::NeighborhoodFull)
    }
    /// The mandatory second look after a fresh insert: if a racing writer landed
    /// the same key at a lower index, our copy is the one that dies
    fn verify_unique(
        data: &HopmapData,
        hash: KeyHash,
        half: HalfHash,
        key: &[u8],
        g: u64,
        i: usize,
    ) {
        let our_index = g * GROUP_WIDTH as u64 + i as u64;
        let (start, _) = data.neighborhood(data.bucket_index(hash));
        let searcher = data.searcher();
        for g2 in start..=g {
            let group = data.group(g2);
            let live = group.live_mask();
            let mut cand = unsafe {
                // UNSAFE(@ohsayan): a group's hash array is GROUP_WIDTH words
                searcher.search(half, group.hashes_ptr())
            } & live;
            while cand != 0 {
                let i2 = cand.trailing_zeros() as usize;
                cand &= cand - 1;
                let index2 = g2 * GROUP_WIDTH as u64 + i2 as u64;
                if index2 >= our_index {
                    // only older (lower) copies outrank us, and slots come out
                    // of the candidate mask in ascending order
                    return;
                }
                let slot2 = data.slot(index2);
                let flags2 = slot2.flags();
                if flag_live(flags2)
                    && unsafe {
                        // UNSAFE(@ohsayan): flags2 is an acquire observation
                        slot2.key_matches(key, flags2)
                    }
                {
                    // duplicate at a lower index: retract ourselves and defer to it
                    Self::retract(data, start, g, i);
                    return;
                }
            }
        }
    }
    /// Tombstone or vanish: true if we were the ones to kill the slot
    fn retract(data: &HopmapData, home: u64, g: u64, i: usize) -> bool {
        let slot = data.slot(g * GROUP_WIDTH as u64 + i as u64);
        let prev = slot.tombstone();
        if !flag_live(prev) {
            return false;
        }
        data.group(g).live_clear(i);
        // the half-hash and key stay in place: later probers must keep seeing
        // "occupied, not matching" until the slot is reborn or the table dies
        if let Some(block) = slot.retired_key_block(prev) {
            if !gc::stage_object(object_type::KEY_BLOCK, block) {
                unsafe {
                    // UNSAFE(@ohsayan): no collector is wired up on this thread,
                    // so ownership never left us
                    group::dealloc_key_block(block)
                }
            }
        }
        for skipped in home..g {
            data.group(skipped).overflow_decr();
        }
        true
    }
    /// Tombstone the key. False when it was not present. Mid-resize the record
    /// can exist in both generations (a migration in flight), so both get the axe
    pub fn delete(&self, key: &[u8]) -> bool {
        let hash = hash::hash_key(key);
        let half = hash::half_hash(hash);
        let data = self.cur();
        let mut died = false;
        if let Some((g, i, _)) = Self::probe(data, hash, half, key) {
            died |= Self::retract(data, data.home_group(hash), g, i);
        }
        if let Some(old) = self.old_gen() {
            if let Some((g, i, _)) = Self::probe(old, hash, half, key) {
                died |= Self::retract(old, old.home_group(hash), g, i);
            }
        }
        died
    }
}

// iteration
impl Hopmap {
    /// Walk every live record. Snapshot-style: concurrent writes may or may not
    /// be observed, and mid-resize a record can surface from either generation
    pub fn iter<F: FnMut(&[u8], u64)>(&self, mut f: F) {
        Self::iter_in(self.cur(), &mut f);
        if let Some(old) = self.old_gen() {
            Self::iter_in(old, &mut f);
        }
    }
    fn iter_in(data: &HopmapData, f: &mut impl FnMut(&[u8], u64)) {
        for index in 0..data.buckets_count_real() {
            let slot = data.slot(index);
            let flags = slot.flags();
            if flag_live(flags) {
                let value = slot.value();
                let key = unsafe {
                    // UNSAFE(@ohsayan): live observation; bytes stay valid while
                    // the epoch GC holds reclamation back
                    slot.key_bytes(flags)
                };
                f(key, value);
            }
        }
    }
    /// Live record count. Exact only in quiescence
    pub fn len(&self) -> u64 {
        self.cur().live_count() + self.old_gen().map_or(0, HopmapData::live_count)
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Hopmap {
    fn drop(&mut self) {
        unsafe {
            // UNSAFE(@ohsayan): sole live owner; the embedder drained the GC first
            drop(Box::from_raw(self.current.load(ORD_ACQ)));
            let old = self.old.load(ORD_ACQ);
            if !old.is_null() {
                drop(Box::from_raw(old));
            }
        }
    }
}

// gc wiring

/// Destructor for [`object_type::KEY_BLOCK`]
pub fn key_block_destructor(batch: &[Staged]) {
    for staged in batch {
        unsafe {
            // UNSAFE(@ohsayan): staged key blocks come from Slot::publish
            group::dealloc_key_block(staged.object)
        }
    }
}

/// Destructor for [`object_type::TABLE_DATA`]
pub fn table_data_destructor(batch: &[Staged]) {
    for staged in batch {
        unsafe {
            // UNSAFE(@ohsayan): retired generations are leaked boxes
            drop(Box::from_raw(staged.object as *mut HopmapData));
        }
    }
}

/// Register this module's object classes with the (already initialized) GC
/// registry. Part of boot, right after [`gc::registry_init`]
pub fn register_gc_object_types() {
    gc::register_object_type_destructor(object_type::KEY_BLOCK, key_block_destructor);
    gc::register_object_type_destructor(object_type::TABLE_DATA, table_data_destructor);
}
