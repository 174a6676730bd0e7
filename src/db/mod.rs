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

//! The concurrent, versioned resource-record database.
//!
//! ## Roles
//!
//! A database is constructed in one of two roles, which share the node
//! and snapshot machinery but differ in how data ages:
//!
//! * In the **zone role** ([`Role::Zone`]), the database holds
//!   authoritative data, and changes are transactional. A writer opens
//!   a version with [`Db::new_version`], makes its changes, and closes
//!   the version with [`Db::close_version`] to commit or roll back.
//!   Readers pin a snapshot with [`Db::current_version`] and observe
//!   exactly the state as of the most recent commit at or before their
//!   serial, never a partial write. Rollback never removes anything a
//!   reader might be looking at: it marks the transaction's snapshots
//!   ignored, and cleanup reclaims them later.
//!
//! * In the **cache role** ([`Role::Cache`]), the database is a shared
//!   resolver cache. There are no versions; instead, entries carry a
//!   TTL expiry, a [`Trust`](crate::rr::Trust) ranking that decides
//!   whether new data may replace old, and negative entries that
//!   record the *nonexistence* of a name or type. Each lock shard
//!   keeps an expiry heap and an LRU list, and when the cache is told
//!   it is over its memory budget ([`Db::set_overmem`]), insertions
//!   opportunistically evict the oldest entries of neighboring shards.
//!
//! ## Locking
//!
//! Node data is partitioned into lock shards by a hash of the owner
//! name. The lock hierarchy, from the outside in, is: the tree-wide
//! read/write lock (structural changes take it in write mode), then a
//! node's shard lock, then the database-wide lock guarding version
//! bookkeeping. Code never acquires these out of order, and never
//! upgrades a held lock in place.
//!
//! ## Collaborators
//!
//! The byte-slab codec the database stores its record data in is
//! [`RdataSlab`](crate::rr::RdataSlab); the deferred-maintenance queue
//! is a [`Dispatcher`](crate::dispatch::Dispatcher). Without a
//! dispatcher, cleanup that would otherwise be deferred runs
//! synchronously under the tree write lock.

use std::fmt;
use std::sync::Arc;

use crate::rr::{RdataSlab, SlabError, Trust, Ttl, Type};

mod header;
mod heap;
mod lru;
mod node;
mod shard;
mod store;
mod tree;
mod version;

pub use node::{Node, NodeRef};
pub use store::{Db, DbConfig};
pub use version::{ReadVersion, WriteVersion};

use header::ChainKey;

/// How many seconds past its TTL expiry a cache entry is still served.
///
/// Clients with a "virtual time" up to this far in the past see
/// records that would otherwise have expired. Beyond the slack, a
/// lookup treats the entry as gone (and marks it for cleanup).
pub const VIRTUAL_TIME_SLACK: u64 = 300;

////////////////////////////////////////////////////////////////////////
// ROLES AND OPTIONS                                                  //
////////////////////////////////////////////////////////////////////////

/// The role a database serves, fixed at construction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Authoritative zone storage with transactional updates.
    Zone,
    /// A shared resolver cache with TTL expiry and LRU eviction.
    Cache,
}

/// Options for [`Db::add_rdataset`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AddOptions {
    /// Union the new RRset with the existing one instead of replacing
    /// it (zone role).
    pub merge: bool,

    /// With `merge`: fail unless the new records are all absent from
    /// the existing RRset.
    pub exact: bool,

    /// With `merge`: fail unless the new TTL matches the existing one.
    pub exact_ttl: bool,

    /// Treat the data as locally configured, overriding any trust
    /// comparison (cache role).
    pub force: bool,

    /// The database is being bulk-loaded: no version bookkeeping is
    /// needed and replaced RRsets are freed immediately (zone role).
    pub loading: bool,
}

////////////////////////////////////////////////////////////////////////
// RRSET INPUT                                                        //
////////////////////////////////////////////////////////////////////////

/// An RRset to be stored: the input to [`Db::add_rdataset`] and
/// [`Db::subtract_rdataset`].
///
/// The owner name is not part of the structure; it is determined by
/// the node the RRset is added to.
#[derive(Clone, Debug)]
pub struct Rrset {
    pub rr_type: Type,
    pub ttl: Ttl,
    pub trust: Trust,
    pub rdatas: RdataSlab,
}

impl Rrset {
    /// Creates an `Rrset` with the given type and TTL, trusted as
    /// locally loaded data. Cache callers set
    /// [`trust`](Rrset::trust) to match the data's provenance.
    pub fn new(rr_type: Type, ttl: Ttl, rdatas: RdataSlab) -> Self {
        Self {
            rr_type,
            ttl,
            trust: Trust::Ultimate,
            rdatas,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// OPERATION OUTCOMES                                                 //
////////////////////////////////////////////////////////////////////////

/// The outcome of [`Db::add_rdataset`].
#[derive(Debug)]
pub enum AddOutcome {
    /// The data was stored (or, in the cache role, refreshed the
    /// identical RRset already present).
    Added(Answer),

    /// The insertion had no visible effect: the existing data is at
    /// least as trusted and fresh.
    Unchanged(Answer),
}

/// The outcome of [`Db::delete_rdataset`].
#[derive(Debug)]
pub enum DeleteOutcome {
    /// A deletion marker now covers the type.
    Deleted,

    /// The type was already absent; nothing changed.
    Unchanged,
}

/// The outcome of [`Db::subtract_rdataset`].
#[derive(Debug)]
pub enum SubtractOutcome {
    /// Some records were removed; the remaining RRset is returned.
    Changed(Answer),

    /// Every record was removed; the type no longer exists.
    RemovedRrset,

    /// None of the given records were present; nothing changed.
    Unchanged,
}

/// The outcome of a zone lookup ([`Db::find`]).
#[derive(Debug)]
pub enum ZoneLookup {
    /// The name and type exist.
    Found(NodeRef, Answer),

    /// The name exists and owns a CNAME record (and the requested type
    /// was not the CNAME itself).
    Cname(NodeRef, Answer),

    /// The name exists but the type does not.
    NoRecords(NodeRef),

    /// The name does not exist.
    NxDomain,
}

/// The outcome of a cache lookup ([`Db::cache_find`]).
#[derive(Debug)]
pub enum CacheLookup {
    /// A live (or within-slack) positive entry was found.
    Found(NodeRef, Answer),

    /// A live negative entry covers the requested type, or the entire
    /// name (NXDOMAIN).
    Negative(NodeRef, Answer),

    /// Nothing usable is cached.
    NotFound,
}

////////////////////////////////////////////////////////////////////////
// ANSWERS                                                            //
////////////////////////////////////////////////////////////////////////

/// One RRset as bound by a lookup or insertion: an immutable snapshot
/// plus its metadata. The record data is shared, not copied, so
/// binding is cheap and unaffected by later changes to the database.
#[derive(Clone)]
pub struct Answer {
    chain_key: ChainKey,
    ttl: Ttl,
    trust: Trust,
    nxdomain: bool,
    rotation: u32,
    rdatas: Arc<RdataSlab>,
}

impl Answer {
    pub(in crate::db) fn new(
        chain_key: ChainKey,
        ttl: Ttl,
        trust: Trust,
        nxdomain: bool,
        rotation: u32,
        rdatas: Arc<RdataSlab>,
    ) -> Self {
        Self {
            chain_key,
            ttl,
            trust,
            nxdomain,
            rotation,
            rdatas,
        }
    }

    /// The RR type of the data. For negative answers this is the
    /// covered type (see [`Answer::is_negative`]).
    pub fn rr_type(&self) -> Type {
        if self.chain_key.is_negative() {
            self.chain_key.covers()
        } else {
            self.chain_key.base()
        }
    }

    /// Whether this answer proves nonexistence rather than providing
    /// data.
    pub fn is_negative(&self) -> bool {
        self.chain_key.is_negative()
    }

    /// Whether this answer proves the entire name does not exist.
    pub fn is_nxdomain(&self) -> bool {
        self.nxdomain
    }

    /// The TTL of the RRset. In the cache role this is the remaining
    /// time to live as of the lookup.
    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// The credibility of the data.
    pub fn trust(&self) -> Trust {
        self.trust
    }

    /// The number of times this snapshot has been bound. Responders
    /// that rotate through an RRset's records ("cyclic" ordering) use
    /// this as the starting offset.
    pub fn rotation(&self) -> u32 {
        self.rotation
    }

    /// The record data.
    pub fn rdatas(&self) -> &RdataSlab {
        &self.rdatas
    }
}

impl fmt::Debug for Answer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Answer")
            .field("rr_type", &self.chain_key)
            .field("ttl", &self.ttl)
            .field("trust", &self.trust)
            .field("rdatas", &self.rdatas)
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise during database operations.
///
/// Benign outcomes (a no-op insert or delete, an expired lookup) are
/// reported through the outcome enums, not through this type; and
/// invariant violations (closing a version that is not open, opening a
/// second concurrent writer) are programming errors that panic rather
/// than surface here.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    /// The change would leave a node owning both a CNAME and ordinary
    /// data at the same version.
    CnameAndOther,

    /// An exact merge or subtraction did not find the RRset in the
    /// required state.
    NotExact,
}

impl From<SlabError> for Error {
    fn from(error: SlabError) -> Self {
        match error {
            SlabError::NotExact => Self::NotExact,
            // Overlong RDATA cannot reach the database: slabs are built
            // from already-validated Rdata.
            SlabError::RdataTooLong => unreachable!(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::CnameAndOther => {
                f.write_str("a CNAME may not coexist with other data at the same name")
            }
            Self::NotExact => {
                f.write_str("the RRset does not permit an exact merge or subtraction")
            }
        }
    }
}

impl std::error::Error for Error {}
