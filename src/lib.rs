// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! A concurrent, versioned, in-memory DNS resource-record database.
//!
//! Reliquary stores DNS RRsets per owner name, in one of two roles
//! chosen at construction time:
//!
//! * **Zone role**: authoritative zone storage with transactional
//!   updates. Writers open a version, make changes, and commit or roll
//!   back; concurrent readers each see a consistent snapshot, never a
//!   partial write. This is a multi-version concurrency control (MVCC)
//!   scheme: each RRset keeps a chain of immutable per-version
//!   snapshots, and old snapshots are reclaimed once no open version
//!   can see them.
//! * **Cache role**: a shared resolver cache with TTL-based expiry,
//!   credibility (trust) ranking, negative caching, and LRU-driven
//!   eviction under memory pressure.
//!
//! The centerpiece is the [`db`] module. The [`name`] and [`rr`]
//! modules provide the domain-name and record-data building blocks,
//! and [`dispatch`] provides the maintenance work queue that the
//! database uses to defer lock-order-sensitive cleanup.

pub mod class;
pub mod db;
pub mod dispatch;
pub mod name;
pub mod rr;

mod util;

pub use class::Class;
