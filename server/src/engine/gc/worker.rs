/*
 * Created on Wed Jan 17 2024
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
    super::{destructor_for, EpochGc, EpochGcThread},
    crate::engine::sync::{ORD_ACQ, ORD_REL},
    core::sync::atomic::AtomicBool,
    std::{
        sync::Arc,
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// The reclamation service: one named background thread sweeping every object
/// class on a fixed cadence. Worker threads never free shared memory themselves;
/// they stage and move on, and this thread settles the bill
pub struct GcWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct ClassSweep {
    gc: Arc<EpochGc>,
    seen_change_epoch: u64,
    threads: Vec<Arc<EpochGcThread>>,
}

impl ClassSweep {
    fn new(gc: Arc<EpochGc>) -> Self {
        Self {
            gc,
            seen_change_epoch: 0,
            threads: Vec::new(),
        }
    }
    /// Rebuild the cached thread snapshot only when registration changed
    fn refresh(&mut self) {
        let now = self.gc.change_epoch();
        if now != self.seen_change_epoch {
            self.threads = self.gc.snapshot_threads();
            self.seen_change_epoch = now;
        }
    }
    fn sweep(&mut self) -> u64 {
        self.refresh();
        let Some(destructor) = destructor_for(self.gc.object_type()) else {
            return 0;
        };
        let mut collected = 0;
        let mut unlinked = false;
        for thread in &self.threads {
            collected += thread.collect_all(destructor);
            if thread.is_terminated() {
                // the owner is gone and will stage nothing more: one final epoch
                // bump ages everything still in the rings, then drain and unlink
                thread.advance_epoch_by_one();
                collected += thread.collect_all(destructor);
                self.gc.unregister_thread(thread);
                unlinked = true;
            }
        }
        if unlinked {
            // force a snapshot rebuild next sweep
            self.seen_change_epoch = 0;
        }
        collected
    }
}

impl GcWorker {
    const THREAD_NAME: &'static str = "gc-reclaim";
    /// Boot the reclamation worker over the given object classes
    pub fn start(classes: Vec<Arc<EpochGc>>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_signal = stop.clone();
        let handle = thread::Builder::new()
            .name(Self::THREAD_NAME.into())
            .spawn(move || Self::reclaim_loop(classes, interval, stop_signal))
            .expect("failed to spawn the reclamation worker");
        log::info!("gc: reclamation worker online");
        Self {
            stop,
            handle: Some(handle),
        }
    }
    fn reclaim_loop(classes: Vec<Arc<EpochGc>>, interval: Duration, stop: Arc<AtomicBool>) {
        let mut sweeps: Vec<ClassSweep> = classes.into_iter().map(ClassSweep::new).collect();
        loop {
            let mut collected = 0;
            for sweep in &mut sweeps {
                collected += sweep.sweep();
            }
            if collected != 0 {
                log::debug!("gc: reclaimed {collected} object(s)");
            }
            if stop.load(ORD_ACQ) {
                break;
            }
            thread::park_timeout(interval);
        }
        // one last settling sweep so a clean shutdown leaves nothing staged by
        // terminated workers
        let mut collected = 0;
        for sweep in &mut sweeps {
            collected += sweep.sweep();
        }
        log::info!("gc: reclamation worker offline ({collected} object(s) in final sweep)");
    }
    /// Stop and join the worker
    pub fn stop(mut self) {
        self.signal_and_join();
    }
    fn signal_and_join(&mut self) {
        self.stop.store(true, ORD_REL);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.signal_and_join();
    }
}
