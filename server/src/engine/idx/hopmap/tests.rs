/*
 * Created on Fri Feb 02 2024
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
    super::{
        data,
        group::{flag_has, SlotFlag, GROUP_WIDTH, INLINE_KEY_MAX},
        Hopmap,
    },
    crate::engine::{config::TableConfig, gc, hash},
    rand::Rng,
    std::{
        collections::{HashMap, HashSet},
        sync::{Arc, RwLock},
        thread::{self, JoinHandle},
    },
};

fn small() -> Hopmap {
    Hopmap::new(TableConfig::new(5, false))
}

/// `want` keys that all share one home group in `t`'s current generation
fn colliding_keys(t: &Hopmap, want: usize) -> (u64, Vec<String>) {
    let data = t.cur();
    let mut by_home: HashMap<u64, Vec<String>> = HashMap::new();
    for n in 0u64.. {
        let key = format!("collide-{n}");
        let home = data.home_group(hash::hash_key(key.as_bytes()));
        let keys = by_home.entry(home).or_default();
        keys.push(key);
        if keys.len() == want {
            return (home, by_home.remove(&home).unwrap());
        }
    }
    unreachable!()
}

fn probe_flags(t: &Hopmap, key: &[u8]) -> Option<u8> {
    let hash = hash::hash_key(key);
    let half = hash::half_hash(hash);
    Hopmap::probe(t.cur(), hash, half, key).map(|(_, _, slot)| slot.flags())
}

// laws

#[test]
fn set_get_delete_roundtrip() {
    let t = small();
    assert!(t.set(b"cachet v2", 12345));
    assert_eq!(t.get(b"cachet v2"), Some(12345));
    assert!(t.delete(b"cachet v2"));
    assert_eq!(t.get(b"cachet v2"), None);
    assert_eq!(t.len(), 0);
}

#[test]
fn set_twice_updates_in_place() {
    let t = small();
    assert!(t.set(b"test key 1", 12345));
    assert!(t.set(b"test key 1", 54321));
    assert_eq!(t.get(b"test key 1"), Some(54321));
    assert_eq!(t.len(), 1);
}

#[test]
fn delete_absent_is_false() {
    let t = small();
    assert!(!t.delete(b"never set"));
    assert_eq!(t.get(b"never set"), None);
}

#[test]
fn tombstoned_slot_is_reborn() {
    let t = small();
    assert!(t.set(b"phoenix", 1));
    assert!(t.delete(b"phoenix"));
    assert!(t.set(b"phoenix", 2));
    assert_eq!(t.get(b"phoenix"), Some(2));
    assert_eq!(t.len(), 1);
}

#[test]
fn empty_table_reads() {
    let t = small();
    assert_eq!(t.get(b"anything"), None);
    assert!(t.is_empty());
}

// key representation

#[test]
fn inline_key_boundary() {
    let t = small();
    let k_inline = [b'a'; INLINE_KEY_MAX];
    let k_external = [b'b'; INLINE_KEY_MAX + 1];
    assert!(t.set(&k_inline, 1));
    assert!(t.set(&k_external, 2));
    assert!(flag_has(
        probe_flags(&t, &k_inline).unwrap(),
        SlotFlag::KEY_INLINE
    ));
    assert!(!flag_has(
        probe_flags(&t, &k_external).unwrap(),
        SlotFlag::KEY_INLINE
    ));
    assert_eq!(t.get(&k_inline), Some(1));
    assert_eq!(t.get(&k_external), Some(2));
    // external keys go through the staged-block path on death
    assert!(t.delete(&k_external));
    assert_eq!(t.get(&k_external), None);
    assert_eq!(t.get(&k_inline), Some(1));
}

#[test]
fn long_keys_roundtrip() {
    let t = Hopmap::new(TableConfig::new(1000, false));
    for n in 0..64u64 {
        let key = format!("a rather long key that will never fit inline #{n:04}");
        assert!(t.set(key.as_bytes(), n));
    }
    for n in 0..64u64 {
        let key = format!("a rather long key that will never fit inline #{n:04}");
        assert_eq!(t.get(key.as_bytes()), Some(n));
    }
    assert_eq!(t.len(), 64);
}

#[test]
fn prefix_cousins_do_not_cross_match() {
    let t = small();
    let a = [b'x'; 30];
    let mut b = [b'x'; 30];
    b[29] = b'y';
    assert!(t.set(&a, 1));
    assert!(t.set(&b, 2));
    assert_eq!(t.get(&a), Some(1));
    assert_eq!(t.get(&b), Some(2));
}

// neighborhood behavior

#[test]
fn neighborhood_full_is_soft() {
    // one line to probe, 14 slots: the 15th collider must be refused
    let t = Hopmap::new(TableConfig {
        initial_size: 5,
        can_auto_resize: false,
        cachelines_to_probe: 1,
    });
    let (_, keys) = colliding_keys(&t, GROUP_WIDTH + 1);
    for key in &keys[..GROUP_WIDTH] {
        assert!(t.set(key.as_bytes(), 7));
    }
    assert!(!t.set(keys[GROUP_WIDTH].as_bytes(), 7));
    // nothing was corrupted by the refusal
    assert_eq!(t.len(), GROUP_WIDTH as u64);
    // freeing one slot lets the refused key in
    assert!(t.delete(keys[0].as_bytes()));
    assert!(t.set(keys[GROUP_WIDTH].as_bytes(), 7));
}

#[test]
fn probers_walk_over_tombstones() {
    // default depth for a 42 bucket table is 2 lines; 15 colliders overflow the
    // home line by exactly one record
    let t = small();
    let (home, keys) = colliding_keys(&t, GROUP_WIDTH + 1);
    for (n, key) in keys.iter().enumerate() {
        assert!(t.set(key.as_bytes(), n as u64));
    }
    assert_eq!(t.cur().group(home).overflow(), 1);
    // kill a home-line record: the overflowed record must stay reachable even
    // though a probe now crosses a tombstone to get to it
    assert!(t.delete(keys[0].as_bytes()));
    assert_eq!(t.get(keys[GROUP_WIDTH].as_bytes()), Some(GROUP_WIDTH as u64));
    // and the tombstone is reused before the neighborhood grows again
    assert!(t.set(keys[0].as_bytes(), 99));
    assert_eq!(t.get(keys[0].as_bytes()), Some(99));
    // retiring the overflowed record drops the overflow count back to zero
    assert!(t.delete(keys[GROUP_WIDTH].as_bytes()));
    assert_eq!(t.cur().group(home).overflow(), 0);
}

#[test]
fn filled_slots_have_nonzero_hashes_in_bounds() {
    let t = Hopmap::new(TableConfig::new(100, false));
    for n in 0..80u64 {
        assert!(t.set(format!("inv-{n}").as_bytes(), n));
    }
    let data = t.cur();
    let mut live_slots = 0;
    for g in 0..data.groups_count() {
        let group = data.group(g);
        let live = group.live_mask();
        for i in 0..GROUP_WIDTH {
            if live & (1 << i) != 0 {
                live_slots += 1;
                let half = group.hash_at(i);
                assert_ne!(half, 0);
                // every stored word carries the forced top bit
                assert_ne!(half & hash::HALF_HASH_HIGH_BIT, 0);
                // and the record sits inside its own neighborhood
                let slot = data.slot(g * GROUP_WIDTH as u64 + i as u64);
                let flags = slot.flags();
                let key = unsafe { slot.key_bytes(flags) };
                let (start, end) = data.neighborhood(data.bucket_index(hash::hash_key(key)));
                assert!(g >= start && g < end, "record escaped its neighborhood");
            }
        }
    }
    assert_eq!(live_slots, 80);
}

// geometry

#[test]
fn prime_ladder_lookup() {
    assert_eq!(data::primenumbers_next(5), Some(42));
    assert_eq!(data::primenumbers_next(42), Some(42));
    assert_eq!(data::primenumbers_next(43), Some(101));
    assert_eq!(data::primenumbers_next_after(42), Some(101));
    assert_eq!(data::primenumbers_next_after(data::PRIMES_MAX), None);
    assert!(data::primenumbers_valid(data::PRIMES_MAX));
    assert!(!data::primenumbers_valid(data::PRIMES_MAX + 1));
}

#[test]
fn prime_mod_matches_generic_mod() {
    for prime in data::PRIMES {
        for n in [0u64, 1, 41, 42, 1523, u32::MAX as u64, u64::MAX] {
            assert_eq!(data::primenumbers_mod(n, *prime), n % *prime);
        }
    }
}

#[test]
fn probe_depth_schedule() {
    multi_assert_eq!(data::cachelines_to_probe(42) => 2);
    multi_assert_eq!(data::cachelines_to_probe(1523), data::cachelines_to_probe(3389) => 4);
    multi_assert_eq!(data::cachelines_to_probe(17203) => 7);
    multi_assert_eq!(data::cachelines_to_probe(133821599) => 18);
    multi_assert_eq!(data::cachelines_to_probe(data::PRIMES_MAX) => 32);
}

#[test]
fn neighborhood_stays_in_allocation() {
    for initial in [5u64, 100, 5000, 100_000] {
        let t = Hopmap::new(TableConfig::new(initial, false));
        let data = t.cur();
        // the worst home bucket still fits a whole neighborhood
        let (_, end) = data.neighborhood(data.buckets_count() - 1);
        assert!(end <= data.groups_count());
        assert_eq!(
            data.buckets_count_real(),
            data.groups_count() * GROUP_WIDTH as u64
        );
    }
}

// iteration

#[test]
fn iter_sees_every_live_record_once() {
    let t = Hopmap::new(TableConfig::new(500, false));
    let mut model = HashMap::new();
    for n in 0..200u64 {
        let key = if n % 3 == 0 {
            format!("iter-long-key-{n:0>32}")
        } else {
            format!("iter-{n}")
        };
        t.set(key.as_bytes(), n);
        model.insert(key.into_bytes(), n);
    }
    // tombstones must not surface
    for n in (0..200u64).step_by(5) {
        let key = if n % 3 == 0 {
            format!("iter-long-key-{n:0>32}")
        } else {
            format!("iter-{n}")
        };
        t.delete(key.as_bytes());
        model.remove(key.as_bytes());
    }
    let mut walked = HashMap::new();
    t.iter(|key, value| {
        assert!(walked.insert(key.to_vec(), value).is_none(), "dup in iter");
    });
    assert_eq!(walked, model);
}

// single-threaded model fuzz

#[test]
fn model_fuzz() {
    let t = Hopmap::new(TableConfig::new(1000, false));
    let mut model: HashMap<Vec<u8>, u64> = HashMap::new();
    let mut rng = rand::thread_rng();
    for op in 0..20_000u64 {
        let n = rng.gen_range(0..384u32);
        let key = if n % 4 == 0 {
            format!("fuzz-key-with-an-external-tail-{n:0>28}")
        } else {
            format!("fuzz-{n}")
        }
        .into_bytes();
        match rng.gen_range(0..4u8) {
            0 | 1 => {
                assert!(t.set(&key, op), "unexpected neighborhood-full");
                model.insert(key, op);
            }
            2 => {
                assert_eq!(t.delete(&key), model.remove(&key).is_some());
            }
            _ => {
                assert_eq!(t.get(&key), model.get(&key).copied());
            }
        }
    }
    assert_eq!(t.len(), model.len() as u64);
    for (key, value) in &model {
        assert_eq!(t.get(key), Some(*value));
    }
}

// resize

#[test]
fn explicit_upsize_carries_everything() {
    let t = Hopmap::new(TableConfig::new(5, false));
    for n in 0..20u64 {
        assert!(t.set(format!("carry-{n}").as_bytes(), n));
    }
    let before = t.cur().buckets_count();
    t.upsize_now().unwrap();
    assert!(t.cur().buckets_count() > before);
    assert!(t.old_gen().is_none());
    for n in 0..20u64 {
        assert_eq!(t.get(format!("carry-{n}").as_bytes()), Some(n));
    }
    assert_eq!(t.len(), 20);
}

#[test]
fn reads_and_writes_span_generations_mid_resize() {
    let t = Hopmap::new(TableConfig::new(5, false));
    for n in 0..10u64 {
        assert!(t.set(format!("gen-{n}").as_bytes(), n));
    }
    t.upsize_begin().unwrap();
    // nothing migrated yet: every record must still be reachable via the old
    // generation
    for n in 0..10u64 {
        assert_eq!(t.get(format!("gen-{n}").as_bytes()), Some(n));
    }
    // a write lands in the new generation and shadows the old record
    assert!(t.set(b"gen-3", 333));
    assert_eq!(t.get(b"gen-3"), Some(333));
    // a delete reaches across both generations
    assert!(t.delete(b"gen-7"));
    assert_eq!(t.get(b"gen-7"), None);
    while !t.upsize_migrate(4) {}
    assert!(t.upsize_finish());
    assert_eq!(t.get(b"gen-3"), Some(333));
    assert_eq!(t.get(b"gen-7"), None);
    assert_eq!(t.len(), 9);
}

#[test]
fn auto_resize_grows_under_pressure() {
    crate::engine::test_utils::init_logging();
    let t = Hopmap::new(TableConfig::new(5, true));
    for n in 0..400u64 {
        let key = format!("grow-{n}");
        // a full neighborhood swings the table mid-set; an unfinished previous
        // resize can still refuse, in which case we play the background driver
        while !t.set(key.as_bytes(), n) {
            while !t.upsize_migrate(256) {}
            assert!(t.upsize_finish());
        }
    }
    // settle any in-flight generation
    if t.old_gen().is_some() {
        while !t.upsize_migrate(256) {}
        assert!(t.upsize_finish());
    }
    assert!(t.cur().buckets_count() > 42);
    assert_eq!(t.len(), 400);
    for n in 0..400u64 {
        assert_eq!(t.get(format!("grow-{n}").as_bytes()), Some(n));
    }
}

// gc integration

#[test]
fn delete_stages_external_keys_to_the_gc() {
    let state = gc::EpochGcThread::new(gc::object_type::KEY_BLOCK);
    gc::thread_register_local(&state);
    let t = small();
    let key = [b'k'; 40];
    assert!(t.set(&key, 1));
    assert!(t.delete(&key));
    // the block went to the rings, not the allocator
    assert!(state.has_staged());
    state.advance_epoch_by_one();
    assert_eq!(state.collect_all(super::key_block_destructor), 1);
    gc::thread_unregister_local(gc::object_type::KEY_BLOCK);
}

#[test]
fn finished_resize_stages_the_old_generation() {
    let state = gc::EpochGcThread::new(gc::object_type::TABLE_DATA);
    gc::thread_register_local(&state);
    let t = Hopmap::new(TableConfig::new(5, false));
    assert!(t.set(b"one", 1));
    t.upsize_now().unwrap();
    assert!(state.has_staged());
    state.advance_epoch_by_one();
    assert_eq!(state.collect_all(super::table_data_destructor), 1);
    gc::thread_unregister_local(gc::object_type::TABLE_DATA);
    assert_eq!(t.get(b"one"), Some(1));
}

// concurrency

const SPAM_THREADS: usize = 4;
const SPAM_OPS: usize = 10_000;
const SPAM_KEYS: usize = 128;

#[test]
fn multispam_striped_keys() {
    let t = Arc::new(Hopmap::new(TableConfig::new(100_000, false)));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<HashMap<Vec<u8>, u64>>> = (0..SPAM_THREADS)
        .map(|tid| {
            let this_t = t.clone();
            let this_token = token.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let _token = this_token.read();
                    let mut rng = rand::thread_rng();
                    let mut model: HashMap<Vec<u8>, u64> = HashMap::new();
                    for op in 0..SPAM_OPS {
                        let n = rng.gen_range(0..SPAM_KEYS);
                        // stripes are disjoint, so this thread's view of its own
                        // keys is authoritative even mid-chaos
                        let key = format!("t{tid}-key-{n}").into_bytes();
                        match rng.gen_range(0..4u8) {
                            0 | 1 => {
                                assert!(this_t.set(&key, op as u64));
                                model.insert(key, op as u64);
                            }
                            2 => {
                                assert_eq!(this_t.delete(&key), model.remove(&key).is_some());
                            }
                            _ => {
                                assert_eq!(this_t.get(&key), model.get(&key).copied());
                            }
                        }
                    }
                    model
                })
                .unwrap()
        })
        .collect();
    // superb intercore traffic
    drop(hold);
    let mut survivors = 0u64;
    for handle in threads {
        let model = handle.join().unwrap();
        survivors += model.len() as u64;
        for (key, value) in model {
            assert_eq!(t.get(&key), Some(value));
        }
    }
    // set-then-not-deleted keys all hold exactly one live slot
    assert_eq!(t.len(), survivors);
}

#[test]
fn multispam_one_contested_key() {
    let t = Arc::new(Hopmap::new(TableConfig::new(100, false)));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<()>> = (0..8usize)
        .map(|tid| {
            let this_t = t.clone();
            let this_token = token.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let _token = this_token.read();
                    let mut rng = rand::thread_rng();
                    for i in 0..2000u64 {
                        if rng.gen_bool(0.7) {
                            this_t.set(b"contested", tid as u64 * 1_000_000 + i);
                        } else {
                            this_t.delete(b"contested");
                        }
                    }
                })
                .unwrap()
        })
        .collect();
    drop(hold);
    threads.into_iter().for_each(|h| h.join().unwrap());
    // the insert-then-verify protocol must leave at most one live slot behind
    let live = t.get(b"contested").is_some() as u64;
    assert_eq!(t.len(), live);
    let mut seen = HashSet::new();
    t.iter(|key, _| {
        assert!(seen.insert(key.to_vec()));
    });
    assert_eq!(seen.len() as u64, live);
}
