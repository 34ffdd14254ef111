/*
 * Created on Tue Jan 16 2024
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
    staged object rings
    ---
    The channel between one worker thread and the reclamation worker: a singly
    linked, append-only list of fixed-capacity SPSC rings. The worker thread is
    the only producer (stages at the tail ring, appends a fresh ring when the
    tail fills up); the reclamation worker is the only consumer (drains from the
    head ring, unlinks rings it has emptied that are no longer the tail). Neither
    side ever blocks the other.
*/

use {
    crate::engine::{
        mem::CachePadded,
        sync::{ORD_ACQ, ORD_REL, ORD_RLX},
    },
    core::{
        cell::UnsafeCell,
        mem::MaybeUninit,
        ptr,
        sync::atomic::{AtomicPtr, AtomicUsize},
    },
};

/// Capacity of one ring. Overflow is not an error; it just links a new ring
pub const RING_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One retired object: the pointer and the staging thread's epoch when it was
/// handed over
pub struct Staged {
    pub object: *mut u8,
    pub epoch: u64,
}

// safe because a staged pointer is exclusively owned by the GC from the moment
// it is staged
unsafe impl Send for Staged {}
unsafe impl Sync for Staged {}

struct Ring {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: [UnsafeCell<MaybeUninit<Staged>>; RING_CAPACITY],
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots: [const { UnsafeCell::new(MaybeUninit::uninit()) }; RING_CAPACITY],
        }
    }
    /// Producer side. False means full
    fn push(&self, item: Staged) -> bool {
        let tail = self.tail.load(ORD_RLX);
        if tail - self.head.load(ORD_ACQ) == RING_CAPACITY {
            return false;
        }
        unsafe {
            // UNSAFE(@ohsayan): tail slot is unpublished, so we're the only one touching it
            (*self.slots[tail % RING_CAPACITY].get()).write(item);
        }
        self.tail.store(tail + 1, ORD_REL);
        true
    }
    /// Consumer side. Leaves the item in place
    fn peek(&self) -> Option<Staged> {
        let head = self.head.load(ORD_RLX);
        if head == self.tail.load(ORD_ACQ) {
            return None;
        }
        Some(unsafe {
            // UNSAFE(@ohsayan): the acquire on tail published this slot
            (*self.slots[head % RING_CAPACITY].get()).assume_init_read()
        })
    }
    /// Consumer side; pairs with a successful [`Self::peek`]
    fn advance(&self) {
        self.head.store(self.head.load(ORD_RLX) + 1, ORD_REL);
    }
    fn is_empty(&self) -> bool {
        self.head.load(ORD_RLX) == self.tail.load(ORD_ACQ)
    }
}

struct RingNode {
    ring: Ring,
    next: AtomicPtr<RingNode>,
}

impl RingNode {
    fn boxed() -> *mut Self {
        Box::into_raw(Box::new(Self {
            ring: Ring::new(),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

pub struct RingList {
    head: AtomicPtr<RingNode>,
    tail: AtomicPtr<RingNode>,
}

unsafe impl Send for RingList {}
unsafe impl Sync for RingList {}

impl RingList {
    pub fn new() -> Self {
        let node = RingNode::boxed();
        Self {
            head: AtomicPtr::new(node),
            tail: AtomicPtr::new(node),
        }
    }
    /// Producer side: stage an object, linking a fresh ring if the tail is full
    pub fn push(&self, item: Staged) {
        let tail = unsafe {
            // UNSAFE(@ohsayan): the tail node is never unlinked by the consumer
            &*self.tail.load(ORD_RLX)
        };
        if tail.ring.push(item) {
            return;
        }
        let new = RingNode::boxed();
        unsafe {
            // UNSAFE(@ohsayan): we own the node; it isn't published yet
            assert!((*new).ring.push(item));
        }
        // publish: link first so the consumer can always walk to the new tail
        tail.next.store(new, ORD_REL);
        self.tail.store(new, ORD_REL);
    }
    /// Consumer side: the earliest staged object, if any. Walks over (and frees)
    /// rings the consumer has already emptied
    pub fn peek(&self) -> Option<Staged> {
        loop {
            let head_ptr = self.head.load(ORD_RLX);
            let head = unsafe {
                // UNSAFE(@ohsayan): head is only ever moved by us (the consumer)
                &*head_ptr
            };
            if let Some(item) = head.ring.peek() {
                return Some(item);
            }
            // empty: if this isn't the tail, the producer has moved on and will
            // never touch this node again; unlink and reclaim it
            if head_ptr == self.tail.load(ORD_ACQ) {
                return None;
            }
            let next = head.next.load(ORD_ACQ);
            if next.is_null() {
                // tail moved but the link isn't visible yet
                return None;
            }
            self.head.store(next, ORD_RLX);
            unsafe {
                // UNSAFE(@ohsayan): unlinked; both sides are done with it
                drop(Box::from_raw(head_ptr));
            }
        }
    }
    /// Consumer side; pairs with a successful [`Self::peek`]
    pub fn advance(&self) {
        unsafe {
            // UNSAFE(@ohsayan): head is only ever moved by us (the consumer)
            (*self.head.load(ORD_RLX)).ring.advance()
        }
    }
    pub fn is_empty(&self) -> bool {
        let head_ptr = self.head.load(ORD_ACQ);
        unsafe {
            // UNSAFE(@ohsayan): nodes reachable from head are alive
            let head = &*head_ptr;
            head.ring.is_empty() && head.next.load(ORD_ACQ).is_null()
        }
    }
}

impl Drop for RingList {
    fn drop(&mut self) {
        let mut node = self.head.load(ORD_RLX);
        while !node.is_null() {
            let next = unsafe { (*node).next.load(ORD_RLX) };
            unsafe {
                // UNSAFE(@ohsayan): sole live owner
                drop(Box::from_raw(node));
            }
            node = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(n: usize) -> Staged {
        Staged {
            object: n as *mut u8,
            epoch: n as u64,
        }
    }

    #[test]
    fn empty_peek() {
        let list = RingList::new();
        assert_eq!(list.peek(), None);
        assert!(list.is_empty());
    }

    #[test]
    fn fifo_across_ring_boundaries() {
        let list = RingList::new();
        // four rings worth
        for i in 0..RING_CAPACITY * 4 {
            list.push(staged(i));
        }
        for i in 0..RING_CAPACITY * 4 {
            let item = list.peek().unwrap();
            assert_eq!(item, staged(i));
            list.advance();
        }
        assert_eq!(list.peek(), None);
    }

    #[test]
    fn interleaved_spsc() {
        use std::{sync::Arc, thread};
        let list = Arc::new(RingList::new());
        let consumer_list = list.clone();
        const N: usize = RING_CAPACITY * 8;
        let producer = thread::spawn(move || {
            for i in 0..N {
                list.push(staged(i));
            }
        });
        let consumer = thread::spawn(move || {
            let mut expect = 0;
            while expect < N {
                if let Some(item) = consumer_list.peek() {
                    assert_eq!(item, staged(expect));
                    consumer_list.advance();
                    expect += 1;
                }
            }
        });
        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
