/*
 * Created on Thu Jan 04 2024
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

pub type OpResult<T> = Result<T, OpError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
/// Errors that the storage core reports across its boundary. The core itself never
/// logs; the caller decides what a failure means for the request at hand
pub enum OpError {
    /// Key absent on a get/delete
    NotFound,
    /// A set found no free slot within the probeable neighborhood of the home bucket
    NeighborhoodFull,
    /// Transient; the table was swapped under the op and it must retry on the new one
    ResizeInProgress,
    /// A CAS observed a state the protocol rules out. Debug builds assert before
    /// this is ever returned
    Invariant,
}
