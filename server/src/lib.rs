/*
 * Created on Mon Jan 01 2024
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

//! # Cachet
//!
//! The `cachetd` crate is Cachet's storage engine: the concurrent, fixed-address,
//! neighborhood-probing hash table that backs the cache server, the slot bitmap
//! allocator that value arenas draw from, and the epoch based reclamation layer
//! that lets lock-free readers run against writers. The outer server (protocol,
//! TLS, scheduler, snapshots) consumes this crate through the interfaces exposed
//! by [`engine`].

#[macro_use]
pub mod util;
pub mod engine;

pub use engine::{
    bitmap::SlotsBitmap,
    config::TableConfig,
    error::{OpError, OpResult},
    idx::Hopmap,
};
