/*
 * Created on Mon Jan 15 2024
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

pub mod ring;
pub mod worker;

/*
    epoch based reclamation
    ---
    Readers run against the table without locks, so nothing that a reader might
    still be looking at can be freed eagerly. Instead, every worker thread keeps a
    per-object-type epoch counter that it bumps *between* requests (the one rule
    that makes all of this sound: never advance while holding a pointer obtained
    before the advance). Memory that goes unreachable is staged, tagged with the
    staging thread's epoch; the reclamation worker destructs a staged object only
    once that thread's epoch has moved strictly past the tag, which proves the
    staging was a previous "generation" and no reader kept a pointer across it.

    Destructors are registered per object type in a process-lifetime registry with
    explicit init/teardown; `main` owns both calls.
*/

use {
    self::ring::{RingList, Staged},
    crate::engine::sync::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
    core::sync::atomic::{AtomicBool, AtomicU64},
    parking_lot::{Mutex, RwLock},
    std::{cell::RefCell, sync::Arc},
};

/// Object class ids are dense small integers; this is the registry width
pub const OBJECT_TYPE_MAX: usize = 8;
/// Most staged records handed to a destructor callback in one call
pub const DESTRUCTOR_BATCH: usize = 64;

pub type ObjectType = u8;
/// A destructor receives up to [`DESTRUCTOR_BATCH`] staged records
pub type DestructorFn = fn(&[Staged]);

/// Well-known object classes. Embedders may register their own past these
pub mod object_type {
    use super::ObjectType;
    /// an externally stored key block retired by delete/update
    pub const KEY_BLOCK: ObjectType = 0;
    /// a whole table snapshot retired by resize
    pub const TABLE_DATA: ObjectType = 1;
    /// entry index records (small)
    pub const ENTRY_INDEX_SMALL: ObjectType = 2;
    /// entry index records (large)
    pub const ENTRY_INDEX_LARGE: ObjectType = 3;
}

// registry

static DESTRUCTORS: RwLock<Option<[Option<DestructorFn>; OBJECT_TYPE_MAX]>> = RwLock::new(None);

/// Bring the destructor registry up. Called once, from `main`, before any thread
/// stages anything
pub fn registry_init() {
    let mut reg = DESTRUCTORS.write();
    assert!(reg.is_none(), "gc registry double init");
    *reg = Some([None; OBJECT_TYPE_MAX]);
}

/// Tear the registry down on shutdown. All workers must have terminated and been
/// drained by now
pub fn registry_teardown() {
    let mut reg = DESTRUCTORS.write();
    assert!(reg.is_some(), "gc registry teardown without init");
    *reg = None;
}

/// Register the destructor for one object class. Called once per class at init
pub fn register_object_type_destructor(ty: ObjectType, destructor: DestructorFn) {
    let mut reg = DESTRUCTORS.write();
    let table = reg.as_mut().expect("gc registry not initialized");
    assert!(table[ty as usize].is_none(), "object type registered twice");
    table[ty as usize] = Some(destructor);
}

pub fn unregister_object_type_destructor(ty: ObjectType) {
    let mut reg = DESTRUCTORS.write();
    let table = reg.as_mut().expect("gc registry not initialized");
    table[ty as usize] = None;
}

pub(super) fn destructor_for(ty: ObjectType) -> Option<DestructorFn> {
    (*DESTRUCTORS.read())
        .as_ref()
        .and_then(|table| table[ty as usize])
}

// per-thread state

/// The reclamation state one worker thread keeps for one object class
pub struct EpochGcThread {
    object_type: ObjectType,
    epoch: AtomicU64,
    terminated: AtomicBool,
    staged: RingList,
}

impl EpochGcThread {
    pub fn new(object_type: ObjectType) -> Arc<Self> {
        Arc::new(Self {
            object_type,
            epoch: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
            staged: RingList::new(),
        })
    }
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }
    #[inline(always)]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(ORD_ACQ)
    }
    /// Stage a retired object. Owning thread only; the pointer is the GC's from
    /// here on
    pub fn stage(&self, object: *mut u8) -> bool {
        self.staged.push(Staged {
            object,
            epoch: self.epoch.load(ORD_RLX),
        });
        true
    }
    /// Advance this thread's epoch off the cycle counter. Only legal between
    /// requests, when the thread holds no pointers into shared structures
    pub fn advance_epoch_tsc(&self) {
        let now = clock_epoch();
        // the counter only ever has to be monotonic; if the clock stalls below a
        // previous reading, fall back to a plain bump
        let cur = self.epoch.load(ORD_RLX);
        if now > cur {
            self.epoch.store(now, ORD_REL);
        } else {
            self.epoch.fetch_add(1, ORD_ACR);
        }
    }
    /// Advance this thread's epoch by exactly one. Same holding rule as
    /// [`Self::advance_epoch_tsc`]
    pub fn advance_epoch_by_one(&self) {
        self.epoch.fetch_add(1, ORD_ACR);
    }
    /// Mark this state dead. The reclamation worker drains what is left and then
    /// unlinks it
    pub fn terminate(&self) {
        self.terminated.store(true, ORD_REL);
    }
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(ORD_ACQ)
    }
    /// Destroy every staged object whose tag is strictly older than this thread's
    /// current epoch. Reclamation worker only. Returns the number destructed
    pub fn collect_all(&self, destructor: DestructorFn) -> u64 {
        let horizon = self.epoch.load(ORD_ACQ);
        let mut collected = 0u64;
        let mut batch = [Staged {
            object: core::ptr::null_mut(),
            epoch: 0,
        }; DESTRUCTOR_BATCH];
        let mut batch_len = 0usize;
        loop {
            let ripe = match self.staged.peek() {
                Some(staged) if staged.epoch < horizon => Some(staged),
                _ => None,
            };
            match ripe {
                Some(staged) => {
                    self.staged.advance();
                    batch[batch_len] = staged;
                    batch_len += 1;
                    if batch_len == DESTRUCTOR_BATCH {
                        destructor(&batch[..batch_len]);
                        collected += batch_len as u64;
                        batch_len = 0;
                    }
                }
                None => {
                    if batch_len != 0 {
                        destructor(&batch[..batch_len]);
                        collected += batch_len as u64;
                    }
                    return collected;
                }
            }
        }
    }
    #[cfg(test)]
    pub(crate) fn has_staged(&self) -> bool {
        !self.staged.is_empty()
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn clock_epoch() -> u64 {
    unsafe {
        // UNSAFE(@ohsayan): rdtsc has no safety preconditions
        core::arch::x86_64::_rdtsc()
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn clock_epoch() -> u64 {
    use std::{sync::OnceLock, time::Instant};
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

// per-object-type registry of thread states

/// The set of worker thread states for one object class. The reclamation worker
/// walks a snapshot of this list; `change_epoch` lets it cache that snapshot
/// until registration actually changes
pub struct EpochGc {
    object_type: ObjectType,
    threads: Mutex<Vec<Arc<EpochGcThread>>>,
    change_epoch: AtomicU64,
}

impl EpochGc {
    pub fn new(object_type: ObjectType) -> Arc<Self> {
        Arc::new(Self {
            object_type,
            threads: Mutex::new(Vec::new()),
            change_epoch: AtomicU64::new(1),
        })
    }
    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }
    /// Attach a worker's state to this class. Called on worker startup
    pub fn register_thread(&self, thread: &Arc<EpochGcThread>) {
        debug_assert_eq!(thread.object_type, self.object_type);
        self.threads.lock().push(thread.clone());
        self.change_epoch.fetch_add(1, ORD_ACR);
    }
    /// Detach a worker's state. The reclamation worker calls this once a
    /// terminated state has been fully drained
    pub fn unregister_thread(&self, thread: &EpochGcThread) {
        self.threads
            .lock()
            .retain(|t| !core::ptr::eq(t.as_ref(), thread));
        self.change_epoch.fetch_add(1, ORD_ACR);
    }
    pub fn change_epoch(&self) -> u64 {
        self.change_epoch.load(ORD_ACQ)
    }
    pub fn snapshot_threads(&self) -> Vec<Arc<EpochGcThread>> {
        self.threads.lock().clone()
    }
}

// thread local wiring

thread_local! {
    static LOCAL_STATES: RefCell<[Option<Arc<EpochGcThread>>; OBJECT_TYPE_MAX]> =
        RefCell::new([const { None }; OBJECT_TYPE_MAX]);
}

/// Make `thread` this OS thread's staging target for its object class
pub fn thread_register_local(thread: &Arc<EpochGcThread>) {
    LOCAL_STATES.with(|states| {
        states.borrow_mut()[thread.object_type as usize] = Some(thread.clone());
    })
}

/// Drop this OS thread's staging target for `ty`
pub fn thread_unregister_local(ty: ObjectType) {
    LOCAL_STATES.with(|states| {
        states.borrow_mut()[ty as usize] = None;
    })
}

/// Stage a retired object against the calling thread's registered state. False
/// means the thread never registered for this class and the caller still owns
/// the pointer
pub fn stage_object(ty: ObjectType, object: *mut u8) -> bool {
    LOCAL_STATES.with(|states| match &states.borrow()[ty as usize] {
        Some(thread) => thread.stage(object),
        None => false,
    })
}

/// Advance the calling thread's epoch for every class it is registered against.
/// Called between requests
pub fn thread_advance_epochs() {
    LOCAL_STATES.with(|states| {
        for state in states.borrow().iter().flatten() {
            state.advance_epoch_tsc();
        }
    })
}
