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

//! The [`Header`] structure: one immutable snapshot of one RR type's
//! data at one node, for one transaction serial.
//!
//! Headers form two orthogonal singly linked chains at each node. The
//! *type chain* links the top header of each stored type through the
//! [`next`](Header::next) field. The *version chain* of a type links
//! progressively older snapshots through the [`down`](Header::down)
//! field; serials are non-increasing along it. A reader at serial `S`
//! observes, for each type, the first header with serial ≤ `S` that is
//! not marked [`IGNORE`](Attributes::IGNORE) — and if that header is
//! marked [`NONEXISTENT`](Attributes::NONEXISTENT), the type does not
//! exist at `S`.
//!
//! Headers live in a per-shard [`Slab`](slab::Slab) arena, so chain
//! links, heap positions, and LRU links are slab keys rather than
//! pointers.

use std::sync::Arc;

use crate::rr::{RdataSlab, Timestamp, Trust, Ttl, Type};

use super::node::Node;
use super::version::Serial;

/// The key of a [`Header`] within its shard's arena.
pub(super) type HeaderKey = usize;

////////////////////////////////////////////////////////////////////////
// CHAIN KEYS                                                         //
////////////////////////////////////////////////////////////////////////

/// Identifies a type chain at a node.
///
/// For ordinary data this is just the RR type. Negative cache entries
/// (proofs that a type, or an entire name, does not exist) are keyed by
/// the type they *cover* instead, with a base type of zero. The two
/// halves are packed into a `u32`, so that a negative entry covering
/// type `T` and positive data of type `T` can be matched against one
/// another cheaply during insertion.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub(super) struct ChainKey(u32);

impl ChainKey {
    /// The chain key of a negative entry covering every type (an
    /// NXDOMAIN or NODATA-for-ANY proof).
    pub const NCACHE_ANY: ChainKey = ChainKey(255 /* ANY */ << 16);

    /// The chain key for positive data of type `rr_type`.
    pub fn positive(rr_type: Type) -> Self {
        Self(u16::from(rr_type) as u32)
    }

    /// The chain key for a negative entry covering `covers`.
    pub fn negative(covers: Type) -> Self {
        Self((u16::from(covers) as u32) << 16)
    }

    /// The base RR type (zero for negative entries).
    pub fn base(self) -> Type {
        Type::from((self.0 & 0xffff) as u16)
    }

    /// The covered RR type (zero for positive entries).
    pub fn covers(self) -> Type {
        Type::from((self.0 >> 16) as u16)
    }

    /// Returns whether this key denotes a negative entry.
    pub fn is_negative(self) -> bool {
        self.0 & 0xffff == 0 && self.0 != 0
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_negative() {
            write!(f, "!{}", self.covers())
        } else {
            write!(f, "{}", self.base())
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ATTRIBUTES                                                         //
////////////////////////////////////////////////////////////////////////

/// Attribute bits of a [`Header`].
#[derive(Clone, Copy, Default, Eq, PartialEq)]
pub(super) struct Attributes(u16);

impl Attributes {
    /// The header records the *absence* of its type (a deletion
    /// marker, or a negative cache entry with no data).
    pub const NONEXISTENT: Attributes = Attributes(0x0001);

    /// The header has expired or been superseded and awaits cleanup
    /// (cache role).
    pub const STALE: Attributes = Attributes(0x0002);

    /// The header belongs to a rolled-back transaction and must not be
    /// observed by any reader.
    pub const IGNORE: Attributes = Attributes(0x0004);

    /// The header must not be evicted early under memory pressure; it
    /// may only expire through its TTL.
    pub const RETAIN: Attributes = Attributes(0x0008);

    /// The header is a proof that the entire name does not exist.
    pub const NXDOMAIN: Attributes = Attributes(0x0010);

    /// The header is tracked by the zone's re-signing heap.
    pub const RESIGN: Attributes = Attributes(0x0020);

    /// The header is a negative cache entry.
    pub const NEGATIVE: Attributes = Attributes(0x0100);

    pub fn contains(self, other: Attributes) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Attributes) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Attributes {
    type Output = Attributes;

    fn bitor(self, other: Attributes) -> Attributes {
        Attributes(self.0 | other.0)
    }
}

impl std::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////
// HEADERS                                                            //
////////////////////////////////////////////////////////////////////////

/// One immutable snapshot of one RR type's data at one node for one
/// serial. See the [module documentation](self) for the chain
/// structure.
///
/// All fields are guarded by the owning shard's lock.
pub(super) struct Header {
    /// The chain this header belongs to.
    pub chain_key: ChainKey,

    /// The serial of the transaction that created this header. Always
    /// [`Serial::CACHE`] in the cache role.
    pub serial: Serial,

    /// The record TTL as provided by the caller.
    pub ttl: Ttl,

    /// When this header's data expires (cache role: insertion time
    /// plus TTL).
    pub expiry: Timestamp,

    /// When this RRset must be re-signed (zone role, RESIGN headers
    /// only).
    pub resign: Timestamp,

    /// The credibility of the data (cache role).
    pub trust: Trust,

    pub attributes: Attributes,

    /// The record data. Empty for NONEXISTENT headers.
    pub slab: Arc<RdataSlab>,

    /// The owning node, for shard and lock lookup only; the header is
    /// reached *from* the node's chains, never the other way around.
    pub node: Arc<Node>,

    /// The top header of the next type chain at the node. Meaningful
    /// only while this header is the top of its own chain.
    pub next: Option<HeaderKey>,

    /// The next older snapshot of the same type.
    pub down: Option<HeaderKey>,

    /// Position in the shard's expiry heap, if tracked.
    pub heap_index: Option<usize>,

    /// LRU list links (cache role).
    pub lru_prev: Option<HeaderKey>,
    pub lru_next: Option<HeaderKey>,
    pub lru_linked: bool,

    /// When this header was last returned by a lookup (cache role).
    pub last_used: Timestamp,

    /// Monotonically increased every time this header is bound, so
    /// that responses can rotate through the RRset's records
    /// ("cyclic" rrset-order). Precision is unimportant, so lookups
    /// update it without further synchronization.
    pub bind_count: u32,
}

impl Header {
    /// Creates a header with the given identity; links and tracking
    /// fields start out detached.
    pub fn new(
        chain_key: ChainKey,
        serial: Serial,
        ttl: Ttl,
        expiry: Timestamp,
        trust: Trust,
        attributes: Attributes,
        slab: Arc<RdataSlab>,
        node: Arc<Node>,
    ) -> Self {
        Self {
            chain_key,
            serial,
            ttl,
            expiry,
            resign: Timestamp::default(),
            trust,
            attributes,
            slab,
            node,
            next: None,
            down: None,
            heap_index: None,
            lru_prev: None,
            lru_next: None,
            lru_linked: false,
            last_used: Timestamp::default(),
            bind_count: 0,
        }
    }

    /// Returns whether this header records existing data (i.e. is not
    /// a deletion marker).
    pub fn exists(&self) -> bool {
        !self.attributes.contains(Attributes::NONEXISTENT)
    }

    pub fn is_stale(&self) -> bool {
        self.attributes.contains(Attributes::STALE)
    }

    pub fn is_ignored(&self) -> bool {
        self.attributes.contains(Attributes::IGNORE)
    }

    pub fn is_negative(&self) -> bool {
        self.attributes.contains(Attributes::NEGATIVE)
    }

    pub fn must_retain(&self) -> bool {
        self.attributes.contains(Attributes::RETAIN)
    }

    pub fn has_resign(&self) -> bool {
        self.attributes.contains(Attributes::RESIGN)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
