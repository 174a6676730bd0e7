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

//! The node lock shards and the header-chain store.
//!
//! Node state is partitioned into [`LockBucket`]s by a hash of the
//! owner name. Each bucket's mutex guards everything about the nodes
//! that hash to it: their header chains and dirty flags, the arena the
//! headers live in, the bucket's dead-node list, and (in the cache
//! role) its LRU list and expiry heap. Unrelated names therefore
//! mutate concurrently, while all chain surgery for one node is
//! serialized.
//!
//! The chain algorithms here are the core of the storage engine:
//! [`add_header`](BucketData::add_header) implements copy-on-write
//! insertion with merge, trust, and negative-cache handling;
//! [`visible_in_chain`](BucketData::visible_in_chain) implements the
//! reader-visibility rule; and the two `clean_*_node` functions
//! reclaim snapshots that no reader can see any longer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::rr::{Timestamp, Trust, Ttl, Type};

use super::header::{Attributes, ChainKey, Header, HeaderKey};
use super::heap::{ExpiryHeap, HeapKey};
use super::lru::LruList;
use super::node::{Node, NodeId};
use super::version::Serial;
use super::{AddOptions, Error, Role};

////////////////////////////////////////////////////////////////////////
// LOCK BUCKETS                                                       //
////////////////////////////////////////////////////////////////////////

/// One lock shard.
pub(super) struct LockBucket {
    pub data: Mutex<BucketData>,

    /// The number of nodes in this bucket with a nonzero reference
    /// count. Maintained on every zero-to-one and one-to-zero node
    /// transition, which happen only under the bucket lock.
    pub references: AtomicUsize,

    /// Set when the database begins tearing down.
    pub exiting: AtomicBool,
}

impl LockBucket {
    pub fn new(role: Role) -> Self {
        Self {
            data: Mutex::new(BucketData::new(role)),
            references: AtomicUsize::new(0),
            exiting: AtomicBool::new(false),
        }
    }
}

/// Per-node chain state, keyed by [`NodeId`] in the owning bucket.
#[derive(Default)]
pub(super) struct ChainState {
    /// The top header of the first type chain.
    pub head: Option<HeaderKey>,

    /// Whether a chain at this node needs cleaning (it holds ignored,
    /// stale, or superseded headers). Lets the lazy cleanup find work
    /// without walking every chain.
    pub dirty: bool,
}

/// Everything a bucket's mutex guards.
pub(super) struct BucketData {
    role: Role,
    pub headers: Slab<Header>,
    pub chains: HashMap<NodeId, ChainState>,

    /// Nodes with no references and no data that could not be removed
    /// from the tree when they became idle (the tree write lock was
    /// not available). Removed in batches later.
    pub dead: Vec<Arc<Node>>,

    /// Cache-role LRU list; least recently used headers at the tail.
    pub lru: LruList,

    /// Expiry heap: TTL order in the cache role, re-signing order in
    /// the zone role.
    pub heap: ExpiryHeap,
}

/// The context an insertion runs in.
#[derive(Clone, Copy)]
pub(super) struct AddContext {
    pub role: Role,
    pub serial: Serial,
    /// Whether the insertion belongs to an open writer version.
    pub versioned: bool,
    pub options: AddOptions,
    pub now: Timestamp,
}

/// What [`BucketData::add_header`] did.
#[derive(Debug)]
pub(super) struct Inserted {
    /// The header now covering the type: the newly linked one, or the
    /// existing one if nothing changed. `None` only when deleting an
    /// absent type.
    pub header: Option<HeaderKey>,

    /// The insertion had no visible effect.
    pub unchanged: bool,

    /// The new snapshot was stacked on top of an older one, which must
    /// be retained for older readers and possible rollback.
    pub version_dirty: bool,
}

impl Inserted {
    fn unchanged(header: Option<HeaderKey>) -> Self {
        Self {
            header,
            unchanged: true,
            version_dirty: false,
        }
    }

    fn added(header: HeaderKey, version_dirty: bool) -> Self {
        Self {
            header: Some(header),
            unchanged: false,
            version_dirty,
        }
    }
}

impl BucketData {
    pub fn new(role: Role) -> Self {
        let heap_key = match role {
            Role::Cache => HeapKey::Expiry,
            Role::Zone => HeapKey::Resign,
        };
        Self {
            role,
            headers: Slab::new(),
            chains: HashMap::new(),
            dead: Vec::new(),
            lru: LruList::new(),
            heap: ExpiryHeap::new(heap_key),
        }
    }

    ////////////////////////////////////////////////////////////////////
    // CHAIN ACCESS                                                   //
    ////////////////////////////////////////////////////////////////////

    pub fn chain_head(&self, node_id: NodeId) -> Option<HeaderKey> {
        self.chains.get(&node_id).and_then(|chain| chain.head)
    }

    fn set_chain_head(&mut self, node_id: NodeId, head: Option<HeaderKey>) {
        self.chains.entry(node_id).or_default().head = head;
    }

    pub fn has_data(&self, node_id: NodeId) -> bool {
        self.chain_head(node_id).is_some()
    }

    pub fn is_dirty(&self, node_id: NodeId) -> bool {
        self.chains.get(&node_id).map_or(false, |chain| chain.dirty)
    }

    pub fn mark_dirty(&mut self, node_id: NodeId) {
        if let Some(chain) = self.chains.get_mut(&node_id) {
            chain.dirty = true;
        }
    }

    fn clear_dirty(&mut self, node_id: NodeId) {
        if let Some(chain) = self.chains.get_mut(&node_id) {
            chain.dirty = false;
        }
    }

    /// Discards the chain bookkeeping of a node that is leaving the
    /// database. All of its headers must already be gone.
    pub fn remove_node_state(&mut self, node_id: NodeId) {
        if let Some(chain) = self.chains.remove(&node_id) {
            debug_assert!(chain.head.is_none());
        }
    }

    /// Returns the top header of the chain matching `key`, if any.
    pub fn find_top(&self, node_id: NodeId, key: ChainKey) -> Option<HeaderKey> {
        let mut cursor = self.chain_head(node_id);
        while let Some(top) = cursor {
            if self.headers[top].chain_key == key {
                return Some(top);
            }
            cursor = self.headers[top].next;
        }
        None
    }

    /// Walks down a version chain to the header a reader at `serial`
    /// observes: the first snapshot with serial ≤ `serial` that is not
    /// ignored. The caller decides what a NONEXISTENT result means.
    pub fn visible_in_chain(&self, top: HeaderKey, serial: Serial) -> Option<HeaderKey> {
        let mut cursor = Some(top);
        while let Some(key) = cursor {
            let header = &self.headers[key];
            if header.serial <= serial && !header.is_ignored() {
                return Some(key);
            }
            cursor = header.down;
        }
        None
    }

    /// Combines [`find_top`](Self::find_top) and
    /// [`visible_in_chain`](Self::visible_in_chain), additionally
    /// requiring the visible header to record existing data.
    pub fn visible_existing(
        &self,
        node_id: NodeId,
        key: ChainKey,
        serial: Serial,
    ) -> Option<HeaderKey> {
        let top = self.find_top(node_id, key)?;
        let visible = self.visible_in_chain(top, serial)?;
        self.headers[visible].exists().then_some(visible)
    }

    ////////////////////////////////////////////////////////////////////
    // HEADER LIFETIME AND TRACKING                                   //
    ////////////////////////////////////////////////////////////////////

    /// Removes a header from the arena and from any tracking
    /// structures (heap, LRU) it is in. Chain links to it must already
    /// be gone.
    pub fn free_header(&mut self, key: HeaderKey) {
        let Self {
            headers, lru, heap, ..
        } = self;
        if headers[key].lru_linked {
            lru.unlink(headers, key);
        }
        if let Some(index) = headers[key].heap_index {
            heap.delete(headers, index);
        }
        headers.remove(key);
    }

    /// Changes a header's expiry, keeping its heap position correct.
    pub fn set_expiry(&mut self, key: HeaderKey, ttl: Ttl, expiry: Timestamp) {
        let Self { headers, heap, .. } = self;
        let header = &mut headers[key];
        let old_expiry = header.expiry;
        header.ttl = ttl;
        header.expiry = expiry;
        let heap_index = header.heap_index;
        if expiry != old_expiry {
            if let Some(index) = heap_index {
                heap.resift(headers, index);
            }
        }
    }

    /// Changes a header's re-signing deadline, keeping its heap
    /// position correct (zone role).
    pub fn set_resign(&mut self, key: HeaderKey, resign: Timestamp) {
        let Self { headers, heap, .. } = self;
        let header = &mut headers[key];
        header.resign = resign;
        header.attributes.insert(Attributes::RESIGN);
        let heap_index = header.heap_index;
        match heap_index {
            Some(index) => heap.resift(headers, index),
            None => heap.insert(headers, key),
        }
    }

    /// Marks a header dead for readers: TTL forced to zero and the
    /// stale bit set. The chain is left for the lazy cleanup.
    pub fn stale_header(&mut self, key: HeaderKey) {
        self.set_expiry(key, Ttl::ZERO, Timestamp::default());
        self.headers[key].attributes.insert(Attributes::STALE);
    }

    /// Takes a header off the LRU list, if it is on it.
    pub fn unlink_lru(&mut self, key: HeaderKey) {
        let Self { headers, lru, .. } = self;
        if headers[key].lru_linked {
            lru.unlink(headers, key);
        }
    }

    /// Puts a header (back) at the head of the LRU list.
    pub fn relink_lru(&mut self, key: HeaderKey) {
        let Self { headers, lru, .. } = self;
        if !headers[key].lru_linked {
            lru.prepend(headers, key);
        }
    }

    /// Starts tracking a freshly linked header in the bucket's
    /// role-dependent structures.
    fn track_header(&mut self, key: HeaderKey) {
        match self.role {
            Role::Cache => {
                let Self {
                    headers, lru, heap, ..
                } = self;
                lru.prepend(headers, key);
                heap.insert(headers, key);
            }
            Role::Zone => {
                if self.headers[key].has_resign() {
                    let Self { headers, heap, .. } = self;
                    heap.insert(headers, key);
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // INSERTION                                                      //
    ////////////////////////////////////////////////////////////////////

    /// Adds `new` to `node`'s chains, implementing merge modes, cache
    /// trust rules, and negative-cache interactions. The caller holds
    /// the bucket lock and has already recorded a changed-list entry
    /// for versioned insertions.
    pub fn add_header(
        &mut self,
        node: &Arc<Node>,
        mut new: Header,
        ctx: AddContext,
    ) -> Result<Inserted, Error> {
        let node_id = node.id;
        let new_nx = !new.exists();
        let is_cache = ctx.role == Role::Cache;

        // A CNAME and ordinary data may not coexist at one name. The
        // check runs before any linking so a refused insertion leaves
        // no trace.
        if ctx.versioned && !new_nx && self.cname_conflict(node_id, new.chain_key, ctx.serial) {
            return Err(Error::CnameAndOther);
        }

        // Cache-role preliminaries: negative entries interact with the
        // positive data they cover, and vice versa.
        let mut negtype = None;
        let mut fresh_ncache_any = false;
        if is_cache && !new_nx {
            if new.is_negative() {
                let covers = new.chain_key.covers();
                if covers == Type::ANY {
                    // An NXDOMAIN (or NODATA-for-ANY) proof makes every
                    // other entry at the node unusable.
                    let mut cursor = self.chain_head(node_id);
                    while let Some(top) = cursor {
                        cursor = self.headers[top].next;
                        self.stale_header(top);
                    }
                    self.mark_dirty(node_id);
                    fresh_ncache_any = true;
                } else {
                    negtype = Some(ChainKey::positive(covers));
                }
            } else {
                // Positive data arriving under a live NXDOMAIN proof:
                // the more trusted of the two wins.
                if let Some(ncache) = self.find_top(node_id, ChainKey::NCACHE_ANY) {
                    let header = &self.headers[ncache];
                    if header.exists() && header.expiry > ctx.now {
                        if new.trust < header.trust {
                            return Ok(Inserted::unchanged(Some(ncache)));
                        }
                        self.stale_header(ncache);
                        self.mark_dirty(node_id);
                    }
                }
                negtype = Some(ChainKey::negative(new.chain_key.base()));
            }
        }

        // Find the chain the new header belongs to. A fresh NXDOMAIN
        // proof always starts its own chain (everything else was just
        // staled).
        let mut top_prev = None;
        let mut topheader = None;
        if !fresh_ncache_any {
            let mut cursor = self.chain_head(node_id);
            while let Some(top) = cursor {
                let top_key = self.headers[top].chain_key;
                if top_key == new.chain_key || Some(top_key) == negtype {
                    topheader = Some(top);
                    break;
                }
                top_prev = Some(top);
                cursor = self.headers[top].next;
            }
        }

        // Ignored headers from a rolled-back transaction may sit above
        // the first real snapshot; skip them.
        let mut existing = topheader;
        while let Some(key) = existing {
            if self.headers[key].is_ignored() {
                existing = self.headers[key].down;
            } else {
                break;
            }
        }

        if let Some(existing) = existing {
            let existing_nx = !self.headers[existing].exists();

            // Deleting an already-absent type has no effect.
            if existing_nx && new_nx {
                return Ok(Inserted::unchanged(Some(existing)));
            }

            // Cache data no more trusted than live existing data has
            // no effect either.
            if is_cache
                && new.trust < self.headers[existing].trust
                && (self.headers[existing].expiry > ctx.now || existing_nx)
            {
                return Ok(Inserted::unchanged(Some(existing)));
            }

            // Union with the existing RRset when asked to (and when
            // both sides actually hold data).
            if ctx.options.merge && !existing_nx && !new_nx {
                debug_assert!(ctx.serial >= self.headers[existing].serial);
                if ctx.options.exact_ttl && new.ttl != self.headers[existing].ttl {
                    return Err(Error::NotExact);
                }
                let merged = self.headers[existing]
                    .slab
                    .merge(&new.slab, ctx.options.exact)?;
                new.slab = Arc::new(merged);
                if ctx.options.loading
                    && new.has_resign()
                    && self.headers[existing].has_resign()
                    && self.headers[existing].resign < new.resign
                {
                    new.resign = self.headers[existing].resign;
                }
            }

            // Replacing a live NS (or address) RRset with identical
            // records must not reset the entry's position in the
            // trust/LRU order; refresh the TTL in place instead. This
            // keeps resolvers from being re-pinned to old servers by
            // every response.
            if is_cache
                && self.headers[existing].expiry > ctx.now
                && matches!(
                    new.chain_key.base(),
                    Type::NS | Type::A | Type::AAAA
                )
                && !existing_nx
                && !new_nx
                && self.headers[existing].trust >= new.trust
                && self.headers[existing].slab.set_equal(&new.slab)
            {
                if self.headers[existing].expiry > new.expiry {
                    self.set_expiry(existing, new.ttl, new.expiry);
                }
                return Ok(Inserted::added(existing, false));
            }

            // Become the new top of the chain.
            let top = topheader.unwrap();
            debug_assert!(!ctx.versioned || ctx.serial >= self.headers[top].serial);
            let top_next = self.headers[top].next;
            if ctx.options.loading {
                // Nothing can be reading the old header during a bulk
                // load, so no version chain is kept.
                new.next = top_next;
                new.down = None;
                let new_key = self.headers.insert(new);
                self.link_top(node_id, top_prev, new_key);
                self.unlink_down_chain(top);
                self.free_header(top);
                self.track_header(new_key);
                Ok(Inserted::added(new_key, false))
            } else {
                new.next = top_next;
                new.down = Some(top);
                let new_key = self.headers.insert(new);
                self.link_top(node_id, top_prev, new_key);
                self.mark_dirty(node_id);
                if is_cache {
                    // The replaced snapshot is dead immediately; there
                    // are no cache versions to keep it for.
                    self.stale_header(top);
                }
                self.track_header(new_key);
                Ok(Inserted::added(new_key, ctx.versioned))
            }
        } else {
            // No live header of this type.

            // Deleting a type that does not exist has no effect.
            if new_nx {
                return Ok(Inserted::unchanged(None));
            }

            if let Some(top) = topheader {
                // The chain exists but consists entirely of ignored
                // headers; stack on top of it.
                debug_assert!(!ctx.options.loading);
                debug_assert!(!ctx.versioned || ctx.serial >= self.headers[top].serial);
                let top_next = self.headers[top].next;
                new.next = top_next;
                new.down = Some(top);
                let new_key = self.headers.insert(new);
                self.link_top(node_id, top_prev, new_key);
                self.mark_dirty(node_id);
                self.track_header(new_key);
                Ok(Inserted::added(new_key, ctx.versioned))
            } else {
                // A brand new chain at the head of the type list.
                new.next = self.chain_head(node_id);
                new.down = None;
                let new_key = self.headers.insert(new);
                self.set_chain_head(node_id, Some(new_key));
                self.track_header(new_key);
                Ok(Inserted::added(new_key, false))
            }
        }
    }

    /// Points the type chain's incoming link (the previous top's
    /// `next`, or the chain-list head) at `new_top`.
    fn link_top(&mut self, node_id: NodeId, top_prev: Option<HeaderKey>, new_top: HeaderKey) {
        match top_prev {
            Some(prev) => self.headers[prev].next = Some(new_top),
            None => self.set_chain_head(node_id, Some(new_top)),
        }
    }

    /// Frees the entire `down` chain of `top`, leaving `top` itself in
    /// place.
    fn unlink_down_chain(&mut self, top: HeaderKey) {
        let mut cursor = self.headers[top].down.take();
        while let Some(key) = cursor {
            cursor = self.headers[key].down;
            self.free_header(key);
        }
    }

    /// Returns whether inserting data keyed `new_key` at `serial`
    /// would make a CNAME coexist with ordinary data.
    fn cname_conflict(&self, node_id: NodeId, new_key: ChainKey, serial: Serial) -> bool {
        if new_key.is_negative() {
            return false;
        }
        let adding_cname = new_key.base() == Type::CNAME;
        if !adding_cname && new_key.base().may_coexist_with_cname() {
            return false;
        }
        let mut cursor = self.chain_head(node_id);
        while let Some(top) = cursor {
            let header = &self.headers[top];
            cursor = header.next;
            let key = header.chain_key;
            if key.is_negative() || key == new_key {
                continue;
            }
            let conflicting = if adding_cname {
                !key.base().may_coexist_with_cname()
            } else {
                key.base() == Type::CNAME
            };
            if conflicting && self.visible_existing(node_id, key, serial).is_some() {
                return true;
            }
        }
        false
    }

    ////////////////////////////////////////////////////////////////////
    // ROLLBACK AND CLEANING                                          //
    ////////////////////////////////////////////////////////////////////

    /// Marks every header created at `serial` ignored, so that no
    /// reader observes the rolled-back transaction. The headers are
    /// physically reclaimed later by [`clean_zone_node`]
    /// (Self::clean_zone_node).
    pub fn rollback_node(&mut self, node_id: NodeId, serial: Serial) {
        let mut make_dirty = false;
        let mut cursor = self.chain_head(node_id);
        while let Some(top) = cursor {
            cursor = self.headers[top].next;
            let mut down = Some(top);
            while let Some(key) = down {
                let header = &mut self.headers[key];
                if header.serial == serial {
                    header.attributes.insert(Attributes::IGNORE);
                    make_dirty = true;
                }
                down = header.down;
            }
        }
        if make_dirty {
            self.mark_dirty(node_id);
        }
    }

    /// Reclaims everything unreachable at a cache node: entire version
    /// chains (the cache never needs them) and stale or nonexistent
    /// tops.
    pub fn clean_cache_node(&mut self, node_id: NodeId) {
        let mut top_prev = None;
        let mut cursor = self.chain_head(node_id);
        while let Some(top) = cursor {
            let top_next = self.headers[top].next;
            self.unlink_down_chain(top);
            if self.headers[top].is_stale() || !self.headers[top].exists() {
                self.unlink_top(node_id, top_prev, top_next);
                self.free_header(top);
            } else {
                top_prev = Some(top);
            }
            cursor = top_next;
        }
        self.clear_dirty(node_id);
        self.drop_empty_chain(node_id);
    }

    /// Reclaims headers at a zone node that no open version can see:
    /// ignored headers, duplicate serials, and snapshots strictly
    /// older than `least_serial` — but never the most recent live
    /// snapshot of a type.
    pub fn clean_zone_node(&mut self, node_id: NodeId, least_serial: Serial) {
        let mut still_dirty = false;
        let mut top_prev = None;
        let mut cursor = self.chain_head(node_id);
        while let Some(top) = cursor {
            let top_next = self.headers[top].next;

            // First strip ignored and duplicate-serial headers out of
            // the version chain.
            let mut dparent = top;
            let mut down = self.headers[top].down;
            while let Some(key) = down {
                let down_next = self.headers[key].down;
                debug_assert!(self.headers[key].serial <= self.headers[dparent].serial);
                if self.headers[key].serial == self.headers[dparent].serial
                    || self.headers[key].is_ignored()
                {
                    self.headers[dparent].down = down_next;
                    self.free_header(key);
                } else {
                    dparent = key;
                }
                down = down_next;
            }

            // The top itself may be ignored; replace it with its
            // predecessor, or drop the chain.
            let mut current = top;
            if self.headers[current].is_ignored() {
                match self.headers[current].down {
                    None => {
                        self.unlink_top(node_id, top_prev, top_next);
                        self.free_header(current);
                        cursor = top_next;
                        continue;
                    }
                    Some(promoted) => {
                        self.link_top(node_id, top_prev, promoted);
                        self.headers[promoted].next = top_next;
                        self.free_header(current);
                        current = promoted;
                    }
                }
            }

            // Cut the chain below the GC horizon: find the first
            // snapshot older than every open version and free it and
            // everything beneath it.
            let mut dparent = current;
            let mut down = self.headers[current].down;
            while let Some(key) = down {
                if self.headers[key].serial < least_serial {
                    break;
                }
                dparent = key;
                down = self.headers[key].down;
            }
            if let Some(first_old) = down {
                self.headers[dparent].down = None;
                let mut doomed = Some(first_old);
                while let Some(key) = doomed {
                    doomed = self.headers[key].down;
                    self.free_header(key);
                }
            }

            // The top snapshot may predate the horizon too, but it is
            // the current version of its type and must stay — unless
            // it is a deletion marker with nothing beneath it.
            if self.headers[current].down.is_some() {
                still_dirty = true;
                top_prev = Some(current);
            } else if !self.headers[current].exists() {
                self.unlink_top(node_id, top_prev, top_next);
                self.free_header(current);
            } else {
                top_prev = Some(current);
            }
            cursor = top_next;
        }
        if !still_dirty {
            self.clear_dirty(node_id);
        }
        self.drop_empty_chain(node_id);
    }

    /// Unlinks a top header from the type list (the inverse of
    /// [`link_top`](Self::link_top)).
    fn unlink_top(
        &mut self,
        node_id: NodeId,
        top_prev: Option<HeaderKey>,
        top_next: Option<HeaderKey>,
    ) {
        match top_prev {
            Some(prev) => self.headers[prev].next = top_next,
            None => self.set_chain_head(node_id, top_next),
        }
    }

    /// Discards the chain entry once every header at the node is gone.
    fn drop_empty_chain(&mut self, node_id: NodeId) {
        if let Some(chain) = self.chains.get(&node_id) {
            if chain.head.is_none() {
                self.chains.remove(&node_id);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // DEAD NODES                                                     //
    ////////////////////////////////////////////////////////////////////

    /// Queues an idle, data-free node for later removal from the tree.
    pub fn push_dead(&mut self, node: Arc<Node>) {
        debug_assert!(!node.on_dead_list.load(Ordering::Relaxed));
        node.on_dead_list.store(true, Ordering::Relaxed);
        self.dead.push(node);
    }

    /// Removes a node from the dead list (it is being used again).
    pub fn unlink_dead(&mut self, node: &Node) {
        if let Some(position) = self.dead.iter().position(|dead| dead.id == node.id) {
            let node = self.dead.swap_remove(position);
            node.on_dead_list.store(false, Ordering::Relaxed);
        }
    }

    /// Takes up to `limit` nodes off the dead list.
    pub fn take_dead(&mut self, limit: usize) -> Vec<Arc<Node>> {
        let taken: Vec<Arc<Node>> = {
            let split = self.dead.len().saturating_sub(limit);
            self.dead.split_off(split)
        };
        for node in &taken {
            node.on_dead_list.store(false, Ordering::Relaxed);
        }
        taken
    }

    pub fn has_dead(&self) -> bool {
        !self.dead.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use crate::name::Name;
    use crate::rr::RdataSlab;

    use super::*;

    const NODE: NodeId = 7;

    fn node() -> Arc<Node> {
        Arc::new(Node::new(NODE, "test.".parse::<Name>().unwrap(), 0))
    }

    fn slab(rdatas: &[&[u8]]) -> Arc<RdataSlab> {
        let mut slab = RdataSlab::new();
        for &octets in rdatas {
            slab.push(octets.try_into().unwrap());
        }
        Arc::new(slab)
    }

    fn zone_header(node: &Arc<Node>, rr_type: Type, serial: u64, rdatas: &[&[u8]]) -> Header {
        Header::new(
            ChainKey::positive(rr_type),
            Serial::FIRST.nth(serial),
            Ttl::from(3600),
            Timestamp::default(),
            Trust::Ultimate,
            Attributes::default(),
            slab(rdatas),
            node.clone(),
        )
    }

    fn deletion_marker(node: &Arc<Node>, rr_type: Type, serial: u64) -> Header {
        Header::new(
            ChainKey::positive(rr_type),
            Serial::FIRST.nth(serial),
            Ttl::ZERO,
            Timestamp::default(),
            Trust::Ultimate,
            Attributes::NONEXISTENT,
            Arc::new(RdataSlab::new()),
            node.clone(),
        )
    }

    fn zone_ctx(serial: u64) -> AddContext {
        AddContext {
            role: Role::Zone,
            serial: Serial::FIRST.nth(serial),
            versioned: true,
            options: AddOptions::default(),
            now: Timestamp::default(),
        }
    }

    impl Serial {
        /// Returns the serial `n` steps after this one (tests only).
        fn nth(self, n: u64) -> Serial {
            let mut serial = self;
            for _ in 0..n {
                serial = serial.next();
            }
            serial
        }
    }

    #[test]
    fn readers_see_their_serial() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        bucket
            .add_header(&node, zone_header(&node, Type::A, 0, &[&[1, 1, 1, 1]]), zone_ctx(0))
            .unwrap();
        bucket
            .add_header(&node, zone_header(&node, Type::A, 2, &[&[2, 2, 2, 2]]), zone_ctx(2))
            .unwrap();

        // A reader at serial 1 sees the serial-1 snapshot; a reader at
        // serial 3 sees the serial-3 snapshot.
        let old = bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST)
            .unwrap();
        assert!(bucket.headers[old].slab.contains((&[1u8, 1, 1, 1]).into()));
        let new = bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST.nth(2))
            .unwrap();
        assert!(bucket.headers[new].slab.contains((&[2u8, 2, 2, 2]).into()));
    }

    #[test]
    fn deletion_markers_hide_a_type() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        bucket
            .add_header(&node, zone_header(&node, Type::A, 0, &[&[1, 1, 1, 1]]), zone_ctx(0))
            .unwrap();
        bucket
            .add_header(&node, deletion_marker(&node, Type::A, 2), zone_ctx(2))
            .unwrap();

        assert!(bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST)
            .is_some());
        assert!(bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST.nth(2))
            .is_none());
    }

    #[test]
    fn deleting_an_absent_type_is_unchanged() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        for _ in 0..2 {
            let inserted = bucket
                .add_header(&node, deletion_marker(&node, Type::AAAA, 0), zone_ctx(0))
                .unwrap();
            assert!(inserted.unchanged);
        }
    }

    #[test]
    fn rollback_hides_and_cleaning_reclaims() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        bucket
            .add_header(&node, zone_header(&node, Type::A, 0, &[&[1, 1, 1, 1]]), zone_ctx(0))
            .unwrap();
        bucket
            .add_header(&node, zone_header(&node, Type::A, 1, &[&[9, 9, 9, 9]]), zone_ctx(1))
            .unwrap();

        bucket.rollback_node(NODE, Serial::FIRST.nth(1));
        assert!(bucket.is_dirty(NODE));

        // The rolled-back snapshot is invisible even to its own serial.
        let visible = bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST.nth(1))
            .unwrap();
        assert!(bucket
            .headers[visible]
            .slab
            .contains((&[1u8, 1, 1, 1]).into()));

        let before = bucket.headers.len();
        bucket.clean_zone_node(NODE, Serial::FIRST);
        assert_eq!(bucket.headers.len(), before - 1);
        assert!(!bucket.is_dirty(NODE));
    }

    #[test]
    fn cleaning_respects_the_gc_horizon() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        for serial in 0..4 {
            bucket
                .add_header(
                    &node,
                    zone_header(&node, Type::A, serial, &[&[serial as u8]]),
                    zone_ctx(serial),
                )
                .unwrap();
        }

        // With open versions back to serial 3, snapshots 1 and 2 are
        // reclaimable but 3 and 4 are not.
        bucket.clean_zone_node(NODE, Serial::FIRST.nth(2));
        assert!(bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST.nth(2))
            .is_some());
        assert!(bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST.nth(3))
            .is_some());
        assert_eq!(bucket.headers.len(), 2);
    }

    #[test]
    fn cname_conflicts_are_refused_without_linking() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        bucket
            .add_header(&node, zone_header(&node, Type::A, 0, &[&[1, 1, 1, 1]]), zone_ctx(0))
            .unwrap();

        let cname = Header::new(
            ChainKey::positive(Type::CNAME),
            Serial::FIRST.nth(1),
            Ttl::from(3600),
            Timestamp::default(),
            Trust::Ultimate,
            Attributes::default(),
            slab(&[b"\x05alias\x04test\x00"]),
            node.clone(),
        );
        let before = bucket.headers.len();
        assert_eq!(
            bucket.add_header(&node, cname, zone_ctx(1)).unwrap_err(),
            Error::CnameAndOther,
        );
        assert_eq!(bucket.headers.len(), before);

        // RRSIG, however, may coexist with anything.
        let rrsig = zone_header(&node, Type::RRSIG, 1, &[&[0xab]]);
        assert!(bucket.add_header(&node, rrsig, zone_ctx(1)).is_ok());
    }

    #[test]
    fn merge_unions_with_the_visible_rrset() {
        let node = node();
        let mut bucket = BucketData::new(Role::Zone);
        bucket
            .add_header(&node, zone_header(&node, Type::A, 0, &[&[1, 1, 1, 1]]), zone_ctx(0))
            .unwrap();

        let mut ctx = zone_ctx(1);
        ctx.options.merge = true;
        let inserted = bucket
            .add_header(&node, zone_header(&node, Type::A, 1, &[&[2, 2, 2, 2]]), ctx)
            .unwrap();
        let merged = inserted.header.unwrap();
        assert_eq!(bucket.headers[merged].slab.count(), 2);

        // The pre-merge snapshot is still there for older readers.
        let old = bucket
            .visible_existing(NODE, ChainKey::positive(Type::A), Serial::FIRST)
            .unwrap();
        assert_eq!(bucket.headers[old].slab.count(), 1);
    }
}
