/*
 * Created on Mon Feb 05 2024
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

//! The configuration surface of the storage core. The outer layer owns reading and
//! validating actual config files; by the time values reach this crate they are
//! plain structs (all of them `Deserialize` so that layer can lift them straight
//! out of its document tree)

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
/// Table sizing and resize policy
pub struct TableConfig {
    /// requested minimum bucket count; the table rounds this up the prime ladder
    pub initial_size: u64,
    /// whether a neighborhood-full set may grow the table instead of failing
    pub can_auto_resize: bool,
    /// probe depth override in cache lines; 0 picks the depth from the table size
    #[serde(default)]
    pub cachelines_to_probe: u16,
}

impl TableConfig {
    pub const fn new(initial_size: u64, can_auto_resize: bool) -> Self {
        Self {
            initial_size,
            can_auto_resize,
            cachelines_to_probe: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
/// The worker layout the server was booted with. The core only cares about the
/// population count: it sizes bitmap search stripes so workers don't contend on
/// the same shards
pub struct WorkerMap {
    pub cpu_mask: u64,
}

impl WorkerMap {
    pub const fn new(cpu_mask: u64) -> Self {
        Self { cpu_mask }
    }
    /// Number of pinned worker threads
    pub const fn worker_count(&self) -> u16 {
        self.cpu_mask.count_ones() as u16
    }
    /// Recommended `(start, step)` pair for striping bitmap searches by worker
    pub const fn bitmap_stripe(&self, worker_id: u16) -> (u16, u16) {
        let step = if self.worker_count() == 0 {
            1
        } else {
            self.worker_count()
        };
        (worker_id % step, step)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Which keys the evictor above the core is allowed to drop. The core only exposes
/// iteration and delete; enforcement lives upstairs
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Ttl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct KeysEvictionConfig {
    pub policy: EvictionPolicy,
    /// restrict eviction to keys that actually carry a TTL
    #[serde(default)]
    pub only_ttl: bool,
}
