/*
 * Created on Thu Jan 11 2024
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
    super::{SlotsBitmap, NO_SLOT, SHARD_SIZE},
    std::{
        collections::HashSet,
        sync::{Arc, RwLock},
        thread::{self, JoinHandle},
    },
};

#[test]
fn single_shard_drains_then_dries() {
    let bmp = SlotsBitmap::new(SHARD_SIZE);
    let mut seen = HashSet::new();
    for _ in 0..SHARD_SIZE {
        let slot = bmp.next_available();
        assert_ne!(slot, NO_SLOT);
        assert!(slot < SHARD_SIZE);
        assert!(seen.insert(slot), "slot {slot} handed out twice");
    }
    // pool dry: the 15th ask fails
    assert_eq!(bmp.next_available(), NO_SLOT);
}

#[test]
fn released_slot_comes_back() {
    let bmp = SlotsBitmap::new(SHARD_SIZE);
    for _ in 0..SHARD_SIZE {
        assert_ne!(bmp.next_available(), NO_SLOT);
    }
    bmp.release(7);
    assert_eq!(bmp.next_available(), 7);
    assert_eq!(bmp.next_available(), NO_SLOT);
}

#[test]
fn release_is_idempotent() {
    let bmp = SlotsBitmap::new(SHARD_SIZE * 2);
    let slot = bmp.next_available();
    bmp.release(slot);
    bmp.release(slot);
    // the double release must not have conjured a phantom free slot elsewhere
    let mut seen = HashSet::new();
    loop {
        let s = bmp.next_available();
        if s == NO_SLOT {
            break;
        }
        assert!(seen.insert(s));
    }
    assert_eq!(seen.len() as u64, bmp.len());
}

#[test]
fn size_rounds_up_to_whole_shards() {
    let bmp = SlotsBitmap::new(20);
    assert_eq!(bmp.len(), SHARD_SIZE * 2);
}

#[test]
fn iter_walks_set_bits_only() {
    let bmp = SlotsBitmap::new(SHARD_SIZE * 4);
    let mut allocated = vec![];
    for _ in 0..10 {
        allocated.push(bmp.next_available());
    }
    bmp.release(allocated[3]);
    bmp.release(allocated[8]);
    let mut walked = vec![];
    let mut pos = 0;
    loop {
        pos = bmp.iter_from(pos);
        if pos == NO_SLOT {
            break;
        }
        walked.push(pos);
        pos += 1;
    }
    let expect: Vec<u64> = allocated
        .iter()
        .copied()
        .filter(|s| *s != allocated[3] && *s != allocated[8])
        .collect();
    assert_veceq!(walked, expect);
}

#[test]
fn striped_search_stays_on_its_residue() {
    let bmp = SlotsBitmap::new(SHARD_SIZE * 8);
    // worker 1 of 4: shards 1, 5
    let a = bmp.next_available_with_stripe(1, 4);
    assert_eq!(a / SHARD_SIZE, 1);
    for _ in 1..SHARD_SIZE {
        bmp.next_available_with_stripe(1, 4);
    }
    let b = bmp.next_available_with_stripe(1, 4);
    assert_eq!(b / SHARD_SIZE, 5);
}

const SPAM_THREADS: u64 = 8;
const SPAM_PER_THREAD: u64 = 256;

#[test]
fn multispam_unique_grants() {
    let bmp = Arc::new(SlotsBitmap::new(SPAM_THREADS * SPAM_PER_THREAD));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<Vec<u64>>> = (0..SPAM_THREADS)
        .map(|tid| {
            let this_token = token.clone();
            let this_bmp = bmp.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let _token = this_token.read();
                    (0..SPAM_PER_THREAD)
                        .map(|_| this_bmp.next_available())
                        .collect()
                })
                .unwrap()
        })
        .collect();
    // rush everyone into the pool at once
    drop(hold);
    let mut all = HashSet::new();
    for t in threads {
        for slot in t.join().unwrap() {
            assert_ne!(slot, NO_SLOT);
            assert!(all.insert(slot), "slot {slot} granted twice");
        }
    }
    // drain the round-up tail of the last shard, then the pool must be dry
    loop {
        let slot = bmp.next_available();
        if slot == NO_SLOT {
            break;
        }
        assert!(all.insert(slot));
    }
    assert_eq!(all.len() as u64, bmp.len());
}

#[test]
fn multispam_churn_never_double_grants() {
    let bmp = Arc::new(SlotsBitmap::new(SHARD_SIZE * 2));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<()>> = (0..4u64)
        .map(|tid| {
            let this_token = token.clone();
            let this_bmp = bmp.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let _token = this_token.read();
                    for _ in 0..4096 {
                        let slot = this_bmp.next_available();
                        if slot != NO_SLOT {
                            // we own it; nobody else may see it until release
                            assert!(this_bmp.is_set(slot));
                            this_bmp.release(slot);
                        }
                    }
                })
                .unwrap()
        })
        .collect();
    drop(hold);
    threads
        .into_iter()
        .for_each(|t| t.join().unwrap());
    // all churned slots went back
    let mut free = 0;
    loop {
        if bmp.next_available() == NO_SLOT {
            break;
        }
        free += 1;
    }
    assert_eq!(free, bmp.len());
}
