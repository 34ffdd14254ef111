/*
 * Created on Thu Feb 01 2024
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
    non-blocking resize
    ---
    Two-phase and never stop-the-world. Phase one (begin): allocate the next
    generation off the prime ladder and swing `current` over to it; the previous
    generation stays reachable through `old`. From here every write lands in the
    new generation, and reads/deletes check both. Phase two (migrate): some
    driver (a background fiber upstairs) walks the old generation in bounded
    steps, re-inserting records that the write traffic hasn't shadowed yet, then
    finishes by detaching the drained old generation and retiring it through the
    epoch GC, because probes may still be walking its lines.
*/

use {
    super::{
        data::{self, HopmapData},
        group::{flag_live, GROUP_WIDTH},
        Hopmap,
    },
    crate::engine::{
        error::{OpError, OpResult},
        gc::{self, object_type},
        hash,
        sync::{ORD_ACQ, ORD_ACR, ORD_REL},
    },
    core::ptr,
};

impl Hopmap {
    /// Swing writes onto a bigger generation. `ResizeInProgress` if another
    /// thread already did; `NeighborhoodFull` at the top of the ladder
    pub fn upsize_begin(&self) -> OpResult<()> {
        if self
            .resizing
            .compare_exchange(false, true, ORD_ACR, ORD_ACQ)
            .is_err()
        {
            return Err(OpError::ResizeInProgress);
        }
        let current_ptr = self.current.load(ORD_ACQ);
        let current = unsafe {
            // UNSAFE(@ohsayan): never null
            &*current_ptr
        };
        let Some(next_prime) = data::primenumbers_next_after(current.buckets_count()) else {
            self.resizing.store(false, ORD_REL);
            return Err(OpError::NeighborhoodFull);
        };
        let next = Box::into_raw(Box::new(HopmapData::new(
            next_prime,
            self.config.cachelines_to_probe,
        )));
        log::info!(
            "hopmap: resize begin, {} -> {next_prime} buckets",
            current.buckets_count()
        );
        // order matters: expose the old generation before any write can land in
        // the new one, or a reader could miss a record in the gap
        self.old.store(current_ptr, ORD_REL);
        self.current.store(next, ORD_REL);
        Ok(())
    }
    /// Move up to `budget` live records from the old generation into the current
    /// one. True once the old generation has nothing live left
    pub fn upsize_migrate(&self, budget: usize) -> bool {
        let Some(old) = self.old_gen() else {
            return true;
        };
        let mut moved = 0usize;
        for index in 0..old.buckets_count_real() {
            if moved == budget {
                return false;
            }
            let slot = old.slot(index);
            let flags = slot.flags();
            if !flag_live(flags) {
                continue;
            }
            let value = slot.value();
            let key = unsafe {
                // UNSAFE(@ohsayan): live observation, reclamation held back
                slot.key_bytes(flags)
            };
            let hash = hash::hash_key(key);
            let half = hash::half_hash(hash);
            // a write that raced ahead of us owns the key now; only absent keys
            // get carried over
            let target = self.cur();
            if Self::probe(target, hash, half, key).is_none() {
                match Self::insert(target, hash, half, key, value) {
                    Ok((g, i)) => Self::verify_unique(target, hash, half, key, g, i),
                    Err(_) => {
                        // new generation full on this neighborhood: leave the
                        // record where it is; a later pass (or a bigger table)
                        // picks it up
                        continue;
                    }
                }
            }
            let home = old.home_group(hash);
            Self::retract(old, home, index / GROUP_WIDTH as u64, (index % GROUP_WIDTH as u64) as usize);
            moved += 1;
        }
        old.live_count() == 0
    }
    /// Detach and retire the drained old generation. True when no old generation
    /// remains attached (whether we detached it or it was already gone)
    pub fn upsize_finish(&self) -> bool {
        let old_ptr = self.old.load(ORD_ACQ);
        if old_ptr.is_null() {
            return true;
        }
        let drained = unsafe {
            // UNSAFE(@ohsayan): still attached, so still alive
            (*old_ptr).live_count() == 0
        };
        if !drained {
            return false;
        }
        self.old.store(ptr::null_mut(), ORD_REL);
        // concurrent probes may still be inside those lines; the epoch GC decides
        // when the memory is truly cold
        if !gc::stage_object(object_type::TABLE_DATA, old_ptr as *mut u8) {
            unsafe {
                // UNSAFE(@ohsayan): no collector wired on this thread; ownership
                // never left us
                drop(Box::from_raw(old_ptr));
            }
        }
        self.resizing.store(false, ORD_REL);
        log::info!("hopmap: resize complete");
        true
    }
    /// Drive a whole resize to completion on the calling thread. Boot/test
    /// convenience; production drives `upsize_migrate` in bounded steps
    pub fn upsize_now(&self) -> OpResult<()> {
        self.upsize_begin()?;
        while !self.upsize_migrate(usize::MAX) {}
        assert!(self.upsize_finish());
        Ok(())
    }
}
