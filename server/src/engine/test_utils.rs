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

use std::sync::Once;

static GC_REGISTRY: Once = Once::new();

/// Route engine logs into the capture-aware harness logger. Opt in with
/// `RUST_LOG=debug` as usual
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The GC destructor registry is a process singleton with a double-init trip
/// wire, and the test harness runs everything in one process: every test that
/// needs the registry goes through here
pub fn ensure_gc_registry() {
    GC_REGISTRY.call_once(|| {
        super::gc::registry_init();
        super::idx::hopmap::register_gc_object_types();
    });
}
