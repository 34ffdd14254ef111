/*
 * Created on Wed Jan 03 2024
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

#![deny(unreachable_patterns)]

#[macro_use]
pub mod macros;
pub mod bitmap;
pub mod config;
pub mod error;
pub mod gc;
pub mod hash;
pub mod idx;
pub mod mem;
pub mod sync;
#[cfg(test)]
pub mod test_utils;

/*
    A word on tests:

    Most of the structures in this crate are mutated by racing threads at runtime, so
    most assertions you can write are only atomically correct at a point in time. The
    tests emulate quiescent states (start gates, op-count bounds, per-thread key
    stripes) to keep the assertions deterministic; don't read more into them.
*/
