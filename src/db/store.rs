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

//! The [`Db`] facade.
//!
//! This module ties the pieces together: it owns the shard array, the
//! namespace tree behind the tree-wide rwlock, and the version
//! bookkeeping behind the database-wide lock, and it implements the
//! public operations by acquiring those locks in the fixed order
//! (tree, then shard, then database) and delegating to the chain
//! algorithms in the shard module.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::{debug, info};

use crate::class::Class;
use crate::dispatch::Dispatcher;
use crate::name::Name;
use crate::rr::{RdataSlab, Timestamp, Trust, Ttl, Type};

use super::header::{Attributes, ChainKey, Header, HeaderKey};
use super::node::{Node, NodeId, NodeRef};
use super::shard::{AddContext, BucketData, Inserted, LockBucket};
use super::tree::NameTree;
use super::version::{Changed, ReadVersion, Serial, Version, WriteVersion};
use super::{
    AddOptions, AddOutcome, Answer, CacheLookup, DeleteOutcome, Error, Role, Rrset,
    SubtractOutcome, ZoneLookup, VIRTUAL_TIME_SLACK,
};

/// The default shard count for zone databases. Prime, to spread
/// consecutive hash values.
pub const DEFAULT_ZONE_SHARDS: usize = 7;

/// The default shard count for cache databases. The tradeoff: too few
/// shards means lock contention, too many means the per-shard LRU
/// lists are short and eviction picks entries prematurely.
pub const DEFAULT_CACHE_SHARDS: usize = 16;

/// How many dead nodes one batched cleanup pass removes per shard.
const DEAD_NODE_BATCH: usize = 10;

/// How many entries one overmem purge may evict.
const OVERMEM_PURGE_BUDGET: usize = 2;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION                                                      //
////////////////////////////////////////////////////////////////////////

/// Configuration for a [`Db`].
pub struct DbConfig {
    pub role: Role,
    pub class: Class,

    /// The apex of the stored zone (zone role) or the root (cache
    /// role). Names outside it are not stored.
    pub origin: Name,

    /// The number of lock shards. Must be at least two.
    pub shards: usize,

    /// Cache role: a lookup refreshes an entry's LRU position only if
    /// at least this many seconds have passed since the last refresh.
    /// Zero (the default) refreshes on every lookup; a nonzero value
    /// trades recency precision for less lock traffic.
    pub lru_update_interval: u64,

    /// Where to defer lock-order-sensitive cleanup. Without one, such
    /// cleanup runs synchronously under the tree write lock.
    pub dispatcher: Option<Arc<Dispatcher>>,
}

impl DbConfig {
    /// Configuration for an authoritative zone database with the given
    /// apex.
    pub fn zone(origin: Name) -> Self {
        Self {
            role: Role::Zone,
            class: Class::IN,
            origin,
            shards: DEFAULT_ZONE_SHARDS,
            lru_update_interval: 0,
            dispatcher: None,
        }
    }

    /// Configuration for a resolver cache database.
    pub fn cache() -> Self {
        Self {
            role: Role::Cache,
            class: Class::IN,
            origin: Name::root(),
            shards: DEFAULT_CACHE_SHARDS,
            lru_update_interval: 0,
            dispatcher: None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// DATABASE STRUCTURE                                                 //
////////////////////////////////////////////////////////////////////////

/// A concurrent, versioned resource-record database.
///
/// `Db` is a handle: cloning attaches another reference to the same
/// database, and the database is torn down when the last handle
/// (including those held internally by [`NodeRef`]s, version handles,
/// and scheduled maintenance) goes away.
pub struct Db {
    inner: Arc<DbInner>,
}

impl Clone for Db {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct DbInner {
    role: Role,
    class: Class,
    origin: Name,
    lru_update_interval: u64,
    dispatcher: Option<Arc<Dispatcher>>,

    /// The namespace tree. Read mode suffices for lookups; making
    /// nodes appear or disappear requires write mode.
    tree: RwLock<NameTree>,

    /// The node lock shards.
    buckets: Vec<LockBucket>,

    /// Version bookkeeping, behind the database-wide lock.
    versions: Mutex<VersionList>,

    next_node_id: AtomicU64,

    /// Whether the cache has been told it is over its memory budget.
    overmem: AtomicBool,
}

struct VersionList {
    current_serial: Serial,
    least_serial: Serial,
    next_serial: Serial,
    current_version: Arc<Version>,
    future_version: Option<Arc<Version>>,

    /// Open (committed but still referenced) versions, most recent
    /// first. The current version is always present.
    open: Vec<Arc<Version>>,
}

impl Drop for DbInner {
    fn drop(&mut self) {
        for bucket in &self.buckets {
            bucket.exiting.store(true, Ordering::Release);
            debug_assert_eq!(bucket.references.load(Ordering::Acquire), 0);
        }
        if let Ok(tree) = self.tree.get_mut() {
            tree.clear();
        }
        debug!("freeing database {}", self.origin);
    }
}

impl Db {
    /// Creates a database from `config`.
    pub fn create(config: DbConfig) -> Self {
        assert!(config.shards >= 2, "a database needs at least two shards");
        let current_version = Arc::new(Version::new(Serial::FIRST, 1, false));
        Self {
            inner: Arc::new(DbInner {
                role: config.role,
                class: config.class,
                origin: config.origin,
                lru_update_interval: config.lru_update_interval,
                dispatcher: config.dispatcher,
                tree: RwLock::new(NameTree::new()),
                buckets: (0..config.shards)
                    .map(|_| LockBucket::new(config.role))
                    .collect(),
                versions: Mutex::new(VersionList {
                    current_serial: Serial::FIRST,
                    least_serial: Serial::FIRST,
                    next_serial: Serial::FIRST.next(),
                    current_version: current_version.clone(),
                    future_version: None,
                    open: vec![current_version],
                }),
                next_node_id: AtomicU64::new(0),
                overmem: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the role this database serves.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Returns the class of the stored records.
    pub fn class(&self) -> Class {
        self.inner.class
    }

    /// Returns the origin name (the zone apex, or the root for a
    /// cache).
    pub fn origin(&self) -> &Name {
        &self.inner.origin
    }

    /// Returns the number of names currently in the database,
    /// including names whose data has been deleted but whose nodes
    /// have not yet been reclaimed.
    pub fn node_count(&self) -> usize {
        self.inner.tree.read().unwrap().len()
    }

    /// Tells a cache database whether it is over its memory budget.
    /// While set, insertions opportunistically evict old entries.
    pub fn set_overmem(&self, overmem: bool) {
        assert_eq!(self.inner.role, Role::Cache);
        self.inner.overmem.store(overmem, Ordering::Release);
    }

    /// Returns the names present in the database, in no particular
    /// order. Walkers that must visit every node (zone transfers,
    /// validation passes) drive their per-node lookups with this.
    pub fn names(&self) -> Vec<Name> {
        let tree = self.inner.tree.read().unwrap();
        tree.iter().map(|node| node.name.clone()).collect()
    }

    fn locknum(&self, name: &Name) -> usize {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        (hasher.finish() % self.inner.buckets.len() as u64) as usize
    }

    fn bucket(&self, node: &Node) -> &LockBucket {
        &self.inner.buckets[node.locknum]
    }

    ////////////////////////////////////////////////////////////////////
    // NODE LOOKUP AND LIFECYCLE                                      //
    ////////////////////////////////////////////////////////////////////

    /// Finds the node for `name`, optionally creating it (and any
    /// wildcard bookkeeping its name implies). Returns `None` when the
    /// name is absent and `create` is false, or when the name lies
    /// outside the database's origin.
    pub fn find_node(&self, name: &Name, create: bool) -> Option<NodeRef> {
        if !name.eq_or_subdomain_of(&self.inner.origin) {
            return None;
        }

        {
            let tree = self.inner.tree.read().unwrap();
            if let Some(node) = tree.find(name) {
                self.reactivate_node(&node, None);
                return Some(NodeRef {
                    db: self.clone(),
                    node,
                });
            }
        }
        if !create {
            return None;
        }

        let mut tree = self.inner.tree.write().unwrap();
        let (node, created) = tree.get_or_insert_with(name, || {
            Arc::new(Node::new(
                self.inner.next_node_id.fetch_add(1, Ordering::Relaxed),
                name.clone(),
                self.locknum(name),
            ))
        });
        if created && name.is_wildcard() {
            self.add_wildcard_magic(&mut tree, name);
        }
        self.reactivate_node(&node, Some(&mut *tree));
        Some(NodeRef {
            db: self.clone(),
            node,
        })
    }

    /// For wildcard matching to work, the parent of a wildcard name
    /// must exist and carry the wildcard and find-callback flags, so
    /// that lookups descending through it know to consider synthesis.
    fn add_wildcard_magic(&self, tree: &mut NameTree, name: &Name) {
        let parent = match name.parent() {
            Some(parent) => parent,
            None => return,
        };
        let (node, _) = tree.get_or_insert_with(&parent, || {
            Arc::new(Node::new(
                self.inner.next_node_id.fetch_add(1, Ordering::Relaxed),
                parent.clone(),
                self.locknum(&parent),
            ))
        });
        node.wild.store(true, Ordering::Relaxed);
        node.find_callback.store(true, Ordering::Relaxed);
    }

    /// Takes a reference to a node that was just found in the tree,
    /// pulling it off the dead list if it was queued there. When the
    /// caller already holds the tree write lock, this is also a cheap
    /// opportunity to retire other dead nodes of the shard.
    fn reactivate_node(&self, node: &Arc<Node>, tree: Option<&mut NameTree>) {
        let bucket = self.bucket(node);
        let mut data = bucket.data.lock().unwrap();
        self.new_reference(bucket, &data, node);
        if node.on_dead_list.load(Ordering::Relaxed) {
            data.unlink_dead(node);
        }
        if let Some(tree) = tree {
            if data.has_dead() {
                self.cleanup_dead_nodes(tree, &mut data);
            }
        }
    }

    /// Increments a node's reference count. The caller must hold the
    /// node's shard lock (witnessed by `_data`): the zero-to-one
    /// transition updates the shard's aggregate counter, which must
    /// not race with the transition back to zero.
    fn new_reference(&self, bucket: &LockBucket, _data: &BucketData, node: &Node) {
        debug_assert!(!bucket.exiting.load(Ordering::Acquire));
        let previous = node.references.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            bucket.references.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Clones an existing handle's reference. The count is already
    /// nonzero, so no shard bookkeeping can change and no lock is
    /// needed.
    pub(super) fn attach_node(&self, node: &Arc<Node>) -> NodeRef {
        let previous = node.references.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0);
        NodeRef {
            db: self.clone(),
            node: node.clone(),
        }
    }

    /// Releases a handle's reference.
    pub(super) fn release_node(&self, node: &Arc<Node>) {
        let bucket = self.bucket(node);
        let mut data = bucket.data.lock().unwrap();
        self.decrement_reference(bucket, &mut data, node, None, None, false);
    }

    /// Decrements a node's reference count, and on the transition to
    /// zero cleans the node and retires it if it no longer holds data.
    ///
    /// Deleting the node from the tree needs the tree write lock. If
    /// the caller holds it, it is passed in; otherwise a try-lock is
    /// attempted — the lock hierarchy notwithstanding, a *try* cannot
    /// deadlock — and on failure the node is queued on the shard's
    /// dead list for a later batched pass.
    ///
    /// Returns the next node to prune, when the removal left an
    /// ancestor a childless leaf and the caller is the pruning task
    /// itself.
    fn decrement_reference(
        &self,
        bucket: &LockBucket,
        data: &mut BucketData,
        node: &Arc<Node>,
        least_serial: Option<Serial>,
        tree: Option<&mut NameTree>,
        pruning: bool,
    ) -> Option<Arc<Node>> {
        let previous = node.references.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous >= 1);
        if previous > 1 {
            return None;
        }
        bucket.references.fetch_sub(1, Ordering::AcqRel);

        if data.is_dirty(node.id) {
            match self.inner.role {
                Role::Cache => data.clean_cache_node(node.id),
                Role::Zone => {
                    let least = least_serial
                        .unwrap_or_else(|| self.inner.versions.lock().unwrap().least_serial);
                    data.clean_zone_node(node.id, least);
                }
            }
        }
        if data.has_data(node.id) {
            return None;
        }

        match tree {
            Some(tree) => self.retire_node(data, tree, node, pruning),
            None => match self.inner.tree.try_write() {
                Ok(mut tree) => self.retire_node(data, &mut tree, node, pruning),
                Err(_) => {
                    if node.current_references() == 0
                        && !node.on_dead_list.load(Ordering::Relaxed)
                    {
                        data.push_dead(node.clone());
                    }
                    None
                }
            },
        }
    }

    /// Removes an idle, data-free node from the tree. The caller holds
    /// the tree write lock. See
    /// [`decrement_reference`](Self::decrement_reference) for the
    /// return value.
    fn retire_node(
        &self,
        data: &mut BucketData,
        tree: &mut NameTree,
        node: &Arc<Node>,
        pruning: bool,
    ) -> Option<Arc<Node>> {
        if node.current_references() > 0 {
            return None;
        }
        if node.on_dead_list.load(Ordering::Relaxed) {
            data.unlink_dead(node);
        }
        let outcome = tree.delete(&node.name);
        if outcome.removed.is_none() {
            return None;
        }
        data.remove_node_state(node.id);
        debug!("decrement_reference: delete from tree: {}", node.name);

        let parent = outcome.parent_leaf?;
        if pruning {
            return Some(parent);
        }
        // The parent may hash to a different shard, whose lock we must
        // not take while holding this one; recursing is deferred to
        // the maintenance worker instead.
        if let Some(dispatcher) = &self.inner.dispatcher {
            let db = self.clone();
            let start = parent.clone();
            if dispatcher.schedule(move || db.prune_tree(start)).is_err() {
                info!(
                    "failed to schedule tree pruning; {} left for later cleanup",
                    parent.name(),
                );
            }
        }
        None
    }

    /// The deferred pruning task: walks up from a node whose last
    /// child has disappeared, retiring each ancestor that is an
    /// unreferenced, data-free, childless leaf. Every step re-takes a
    /// reference first, so a concurrently reactivated ancestor simply
    /// survives.
    fn prune_tree(&self, start: Arc<Node>) {
        let mut tree = self.inner.tree.write().unwrap();
        let mut candidate = Some(start);
        while let Some(node) = candidate {
            if !tree.is_leaf(&node.name) {
                // Someone hung a new child below this node; pruning
                // stops here.
                return;
            }
            let bucket = self.bucket(&node);
            let mut data = bucket.data.lock().unwrap();
            self.new_reference(bucket, &data, &node);
            if node.on_dead_list.load(Ordering::Relaxed) {
                data.unlink_dead(&node);
            }
            candidate =
                self.decrement_reference(bucket, &mut data, &node, None, Some(&mut *tree), true);
        }
    }

    /// Retires a batch of dead nodes of one shard. The caller holds
    /// the tree write lock and the shard lock.
    fn cleanup_dead_nodes(&self, tree: &mut NameTree, data: &mut BucketData) {
        for node in data.take_dead(DEAD_NODE_BATCH) {
            debug_assert_eq!(node.current_references(), 0);
            debug_assert!(!data.has_data(node.id));
            let outcome = tree.delete(&node.name);
            if outcome.removed.is_some() {
                data.remove_node_state(node.id);
            }
        }
    }

    /// The deferred dead-node sweep: retires dead nodes of every
    /// shard, rescheduling itself while any remain.
    fn sweep_dead_nodes(&self) {
        let mut again = false;
        {
            let mut tree = self.inner.tree.write().unwrap();
            for bucket in &self.inner.buckets {
                let mut data = bucket.data.lock().unwrap();
                self.cleanup_dead_nodes(&mut tree, &mut data);
                again = again || data.has_dead();
            }
        }
        if again {
            if let Some(dispatcher) = &self.inner.dispatcher {
                let db = self.clone();
                let _ = dispatcher.schedule(move || db.sweep_dead_nodes());
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // VERSIONS                                                       //
    ////////////////////////////////////////////////////////////////////

    /// Opens a writer version with the next serial.
    ///
    /// Only one writer may be open at a time; opening a second is a
    /// programming error and panics.
    pub fn new_version(&self) -> WriteVersion {
        assert_eq!(self.inner.role, Role::Zone, "caches are not versioned");
        let mut versions = self.inner.versions.lock().unwrap();
        if versions.future_version.is_some() {
            // Release the lock before dying, so that the open writer
            // can still be rolled back during unwinding.
            drop(versions);
            panic!("a writer version is already open");
        }
        let serial = versions.next_serial;
        versions.next_serial = serial.next();
        let version = Arc::new(Version::new(serial, 1, true));
        versions.future_version = Some(version.clone());
        WriteVersion {
            db: self.clone(),
            version: Some(version),
        }
    }

    /// Attaches to the current version for reading.
    pub fn current_version(&self) -> ReadVersion {
        assert_eq!(self.inner.role, Role::Zone, "caches are not versioned");
        let versions = self.inner.versions.lock().unwrap();
        let version = versions.current_version.clone();
        version.references.fetch_add(1, Ordering::AcqRel);
        ReadVersion {
            db: self.clone(),
            version,
        }
    }

    /// Closes the writer version, committing its changes if `commit`
    /// is true and rolling them back otherwise.
    ///
    /// On commit the version becomes current: every new reader sees
    /// its changes, while readers already attached to older versions
    /// are unaffected. On rollback the version's headers are marked
    /// ignored and the database is left exactly as it was.
    pub fn close_version(&self, version: WriteVersion, commit: bool) {
        self.close_version_impl(version.take(), commit);
    }

    pub(super) fn close_version_impl(&self, version: Arc<Version>, commit: bool) {
        let remaining = version.references.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            if commit {
                assert!(!version.is_writer());
            }
            return;
        }

        let serial = version.serial;
        let mut cleanup_list: Vec<Changed> = Vec::new();
        let mut rollback = false;
        let least_serial;
        {
            let mut versions = self.inner.versions.lock().unwrap();
            if version.is_writer() {
                let future = versions.future_version.take();
                assert!(
                    future.map_or(false, |future| Arc::ptr_eq(&future, &version)),
                    "closing a version that is not the open writer",
                );
                if commit {
                    assert!(
                        version.state.lock().unwrap().commit_ok,
                        "committing a version after a failed change",
                    );

                    // The current version is about to be replaced;
                    // drop the database's own reference to it.
                    let old_current = versions.current_version.clone();
                    let old_refs = old_current.references.fetch_sub(1, Ordering::AcqRel) - 1;
                    if old_refs == 0 {
                        versions
                            .open
                            .retain(|open| !Arc::ptr_eq(open, &old_current));
                    }

                    if versions.open.is_empty() {
                        // Nothing older is visible to anyone: we are
                        // the least open version, and our changed list
                        // can be processed right away.
                        versions.least_serial = serial;
                        cleanup_list = mem::take(&mut version.state.lock().unwrap().changed);
                    } else {
                        // Older versions are still in use. Changes
                        // that merely added new data can be processed
                        // now; changes that superseded older snapshots
                        // wait until we become the GC horizon.
                        let mut state = version.state.lock().unwrap();
                        let (dirty, clean): (Vec<Changed>, Vec<Changed>) = mem::take(&mut state.changed)
                            .into_iter()
                            .partition(|changed| changed.dirty);
                        state.changed = dirty;
                        cleanup_list = clean;
                    }
                    if old_refs == 0 {
                        // The old current version is finished; inherit
                        // whatever cleanups it still owed.
                        let mut old_state = old_current.state.lock().unwrap();
                        version
                            .state
                            .lock()
                            .unwrap()
                            .changed
                            .append(&mut old_state.changed);
                    }

                    version.writer.store(false, Ordering::Release);
                    versions.current_version = version.clone();
                    versions.current_serial = serial;
                    let previous = version.references.fetch_add(1, Ordering::AcqRel);
                    assert_eq!(previous, 0);
                    versions.open.insert(0, version.clone());
                } else {
                    cleanup_list = mem::take(&mut version.state.lock().unwrap().changed);
                    rollback = true;
                }
            } else {
                assert!(
                    !Arc::ptr_eq(&version, &versions.current_version),
                    "the database's own reference to the current version was dropped",
                );
                let index = versions
                    .open
                    .iter()
                    .position(|open| Arc::ptr_eq(open, &version))
                    .expect("closed version is not open");
                versions.open.remove(index);

                let least_greater = versions
                    .open
                    .iter()
                    .filter(|open| open.serial > serial)
                    .min_by_key(|open| open.serial)
                    .cloned()
                    .unwrap_or_else(|| versions.current_version.clone());
                if serial == versions.least_serial {
                    // The GC horizon advances to the next open
                    // version, whose deferred cleanups are now safe to
                    // run.
                    versions.least_serial = least_greater.serial;
                    cleanup_list = mem::take(&mut least_greater.state.lock().unwrap().changed);
                } else {
                    // Pass any cleanups we inherited to the next
                    // version that will reach the horizon.
                    let mut mine = mem::take(&mut version.state.lock().unwrap().changed);
                    if !mine.is_empty() {
                        least_greater
                            .state
                            .lock()
                            .unwrap()
                            .changed
                            .append(&mut mine);
                    }
                }
            }
            least_serial = versions.least_serial;
        }

        if !cleanup_list.is_empty() {
            self.process_cleanup_list(cleanup_list, rollback.then_some(serial), least_serial);
        }
    }

    /// Processes a changed-node list after a commit, rollback, or
    /// horizon advance: rolls nodes back if requested, releases the
    /// references the changed records held, and retires nodes that
    /// ended up empty.
    ///
    /// With a dispatcher, node removal is deferred (idle nodes land on
    /// dead lists and a sweep is scheduled); without one, everything
    /// runs here under the tree write lock.
    fn process_cleanup_list(
        &self,
        cleanup_list: Vec<Changed>,
        rollback_serial: Option<Serial>,
        least_serial: Serial,
    ) {
        let deferred = self.inner.dispatcher.is_some();
        let mut tree_guard = if deferred {
            None
        } else {
            Some(self.inner.tree.write().unwrap())
        };

        for changed in cleanup_list {
            let node = changed.node;
            let bucket = self.bucket(&node);
            let mut data = bucket.data.lock().unwrap();
            if let Some(tree) = tree_guard.as_deref_mut() {
                if data.has_dead() {
                    self.cleanup_dead_nodes(tree, &mut data);
                }
            }
            if let Some(serial) = rollback_serial {
                data.rollback_node(node.id, serial);
            }
            self.decrement_reference(
                bucket,
                &mut data,
                &node,
                Some(least_serial),
                tree_guard.as_deref_mut(),
                false,
            );
        }
        drop(tree_guard);

        if deferred {
            let dispatcher = self.inner.dispatcher.as_ref().unwrap();
            let db = self.clone();
            if dispatcher.schedule(move || db.sweep_dead_nodes()).is_err() {
                self.sweep_dead_nodes();
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // INSERTION AND DELETION                                         //
    ////////////////////////////////////////////////////////////////////

    /// Adds an RRset at `node`.
    ///
    /// In the zone role the insertion belongs to the open writer
    /// `version` (or to a bulk load when
    /// [`loading`](AddOptions::loading) is set, in which case no
    /// version is given). In the cache role there are no versions, and
    /// the trust and freshness of existing data decide whether the new
    /// data is stored at all.
    pub fn add_rdataset(
        &self,
        node: &NodeRef,
        version: Option<&WriteVersion>,
        rrset: &Rrset,
        options: AddOptions,
        now: Timestamp,
    ) -> Result<AddOutcome, Error> {
        let trust = if options.force {
            Trust::Ultimate
        } else {
            rrset.trust
        };
        let header = self.make_header(
            node,
            ChainKey::positive(rrset.rr_type),
            rrset.ttl,
            trust,
            Attributes::default(),
            Arc::new(rrset.rdatas.clone()),
            version,
            now,
        );
        let (inserted, answer) = self.add_header_locked(node, version, header, options, now)?;
        let answer = answer.expect("positive insertions always bind");
        Ok(if inserted.unchanged {
            AddOutcome::Unchanged(answer)
        } else {
            AddOutcome::Added(answer)
        })
    }

    /// Adds a negative cache entry at `node`: a proof that `covers`
    /// (or, with `nxdomain`, the entire name) does not exist. The
    /// accompanying `rdatas` usually hold the SOA or NSEC records that
    /// attest the nonexistence.
    pub fn add_negative(
        &self,
        node: &NodeRef,
        covers: Type,
        nxdomain: bool,
        ttl: Ttl,
        trust: Trust,
        rdatas: RdataSlab,
        now: Timestamp,
    ) -> Result<AddOutcome, Error> {
        assert_eq!(self.inner.role, Role::Cache);
        let mut attributes = Attributes::NEGATIVE;
        if nxdomain {
            attributes.insert(Attributes::NXDOMAIN);
        }
        let covers = if nxdomain { Type::ANY } else { covers };
        let header = self.make_header(
            node,
            ChainKey::negative(covers),
            ttl,
            trust,
            attributes,
            Arc::new(rdatas),
            None,
            now,
        );
        let (inserted, answer) =
            self.add_header_locked(node, None, header, AddOptions::default(), now)?;
        let answer = answer.expect("negative insertions always bind");
        Ok(if inserted.unchanged {
            AddOutcome::Unchanged(answer)
        } else {
            AddOutcome::Added(answer)
        })
    }

    /// Deletes the RRset of `rr_type` at `node` by installing a
    /// deletion marker. Deleting an absent type reports
    /// [`DeleteOutcome::Unchanged`].
    pub fn delete_rdataset(
        &self,
        node: &NodeRef,
        version: Option<&WriteVersion>,
        rr_type: Type,
    ) -> Result<DeleteOutcome, Error> {
        assert!(rr_type != Type::ANY, "ANY cannot be deleted as a type");
        let header = self.make_header(
            node,
            ChainKey::positive(rr_type),
            Ttl::ZERO,
            Trust::Ultimate,
            Attributes::NONEXISTENT,
            Arc::new(RdataSlab::new()),
            version,
            Timestamp::default(),
        );
        let (inserted, _) = self.add_header_locked(
            node,
            version,
            header,
            AddOptions::default(),
            Timestamp::default(),
        )?;
        Ok(if inserted.unchanged {
            DeleteOutcome::Unchanged
        } else {
            DeleteOutcome::Deleted
        })
    }

    /// Removes the records of `rrset` from the RRset of the same type
    /// at `node`. With `exact`, fails unless every record to remove is
    /// present.
    pub fn subtract_rdataset(
        &self,
        node: &NodeRef,
        version: &WriteVersion,
        rrset: &Rrset,
        exact: bool,
        now: Timestamp,
    ) -> Result<SubtractOutcome, Error> {
        assert_eq!(self.inner.role, Role::Zone);
        let serial = version.version().serial;
        let chain_key = ChainKey::positive(rrset.rr_type);
        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        self.record_change(version, bucket, &mut data, &node.node);

        let existing = match data.visible_existing(node.node.id, chain_key, serial) {
            Some(existing) => existing,
            None => return Ok(SubtractOutcome::Unchanged),
        };
        let remaining = data.headers[existing].slab.subtract(&rrset.rdatas, exact)?;
        if remaining.count() == data.headers[existing].slab.count() {
            return Ok(SubtractOutcome::Unchanged);
        }

        let removed_all = remaining.is_empty();
        let (attributes, slab) = if removed_all {
            (Attributes::NONEXISTENT, Arc::new(RdataSlab::new()))
        } else {
            (Attributes::default(), Arc::new(remaining))
        };
        let replacement = Header::new(
            chain_key,
            serial,
            data.headers[existing].ttl,
            Timestamp::default(),
            data.headers[existing].trust,
            attributes,
            slab,
            node.node.clone(),
        );
        let ctx = AddContext {
            role: Role::Zone,
            serial,
            versioned: true,
            options: AddOptions::default(),
            now,
        };
        let inserted = data.add_header(&node.node, replacement, ctx)?;
        if inserted.version_dirty {
            self.mark_last_change_dirty(version);
        }
        Ok(if removed_all {
            SubtractOutcome::RemovedRrset
        } else {
            let key = inserted.header.expect("a replacement RRset was linked");
            SubtractOutcome::Changed(self.bind_answer(&mut data, key, now))
        })
    }

    /// Builds a header for an insertion.
    #[allow(clippy::too_many_arguments)]
    fn make_header(
        &self,
        node: &NodeRef,
        chain_key: ChainKey,
        ttl: Ttl,
        trust: Trust,
        attributes: Attributes,
        slab: Arc<RdataSlab>,
        version: Option<&WriteVersion>,
        now: Timestamp,
    ) -> Header {
        let serial = match self.inner.role {
            Role::Cache => Serial::CACHE,
            Role::Zone => match version {
                Some(version) => version.version().serial,
                None => self.inner.versions.lock().unwrap().current_serial,
            },
        };
        let expiry = match self.inner.role {
            Role::Cache => now + ttl,
            Role::Zone => Timestamp::default(),
        };
        Header::new(
            chain_key,
            serial,
            ttl,
            expiry,
            trust,
            attributes,
            slab,
            node.node.clone(),
        )
    }

    /// The common insertion path: validates the role/version pairing,
    /// runs the overmem purge when applicable, records the change, and
    /// performs the chain surgery and binding under one hold of the
    /// shard lock.
    fn add_header_locked(
        &self,
        node: &NodeRef,
        version: Option<&WriteVersion>,
        header: Header,
        options: AddOptions,
        now: Timestamp,
    ) -> Result<(Inserted, Option<Answer>), Error> {
        match self.inner.role {
            Role::Zone => {
                if options.loading {
                    assert!(version.is_none(), "bulk loads are not versioned");
                } else {
                    assert!(version.is_some(), "zone changes require a writer version");
                }
            }
            Role::Cache => {
                assert!(version.is_none(), "caches are not versioned");
                if self.inner.overmem.load(Ordering::Acquire) {
                    self.overmem_purge(node.node.locknum, now);
                }
            }
        }

        let ctx = AddContext {
            role: self.inner.role,
            serial: header.serial,
            versioned: version.is_some(),
            options,
            now,
        };
        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        if let Some(version) = version {
            self.record_change(version, bucket, &mut data, &node.node);
        }
        let inserted = data.add_header(&node.node, header, ctx)?;
        if inserted.version_dirty {
            if let Some(version) = version {
                self.mark_last_change_dirty(version);
            }
        }
        let answer = inserted
            .header
            .map(|key| self.bind_answer(&mut data, key, now));
        Ok((inserted, answer))
    }

    /// Records a changed-node entry for the open writer version. The
    /// record holds a node reference of its own; it is always added,
    /// even if the change turns out to have no effect, because that is
    /// harmless and keeps the bookkeeping simple.
    fn record_change(
        &self,
        version: &WriteVersion,
        bucket: &LockBucket,
        data: &mut BucketData,
        node: &Arc<Node>,
    ) {
        self.new_reference(bucket, data, node);
        let version = version.version();
        debug_assert!(version.is_writer());
        version.state.lock().unwrap().changed.push(Changed {
            node: node.clone(),
            dirty: false,
        });
    }

    /// Marks the most recently recorded change dirty: it stacked a new
    /// snapshot over an older one.
    fn mark_last_change_dirty(&self, version: &WriteVersion) {
        let version = version.version();
        if let Some(last) = version.state.lock().unwrap().changed.last_mut() {
            last.dirty = true;
        }
    }

    ////////////////////////////////////////////////////////////////////
    // LOOKUPS                                                        //
    ////////////////////////////////////////////////////////////////////

    /// Looks up `name` and `rr_type` in a zone database, as of
    /// `version` (or the current version).
    pub fn find(&self, name: &Name, rr_type: Type, version: Option<&ReadVersion>) -> ZoneLookup {
        assert_eq!(self.inner.role, Role::Zone);
        assert!(rr_type != Type::ANY, "enumerate types with iter_rdatasets");

        let tree = self.inner.tree.read().unwrap();
        let node = match tree.find(name) {
            Some(node) => node,
            None => return ZoneLookup::NxDomain,
        };
        let bucket = self.bucket(&node);
        let mut data = bucket.data.lock().unwrap();
        self.new_reference(bucket, &data, &node);
        if node.on_dead_list.load(Ordering::Relaxed) {
            data.unlink_dead(&node);
        }

        let serial = match version {
            Some(version) => version.version.serial,
            None => self.inner.versions.lock().unwrap().current_serial,
        };
        let node_ref = NodeRef {
            db: self.clone(),
            node: node.clone(),
        };
        if let Some(found) = data.visible_existing(node.id, ChainKey::positive(rr_type), serial) {
            let answer = self.bind_answer(&mut data, found, Timestamp::default());
            return ZoneLookup::Found(node_ref, answer);
        }
        if rr_type != Type::CNAME {
            if let Some(cname) =
                data.visible_existing(node.id, ChainKey::positive(Type::CNAME), serial)
            {
                let answer = self.bind_answer(&mut data, cname, Timestamp::default());
                return ZoneLookup::Cname(node_ref, answer);
            }
        }
        ZoneLookup::NoRecords(node_ref)
    }

    /// Looks up `name` and `rr_type` in a cache database as of `now`.
    ///
    /// An entry expired less than the virtual-time slack ago is still
    /// served; older entries are treated as gone (and marked for
    /// cleanup in passing). A qualifying hit refreshes the entry's LRU
    /// position.
    pub fn cache_find(&self, name: &Name, rr_type: Type, now: Timestamp) -> CacheLookup {
        assert_eq!(self.inner.role, Role::Cache);

        let tree = self.inner.tree.read().unwrap();
        let node = match tree.find(name) {
            Some(node) => node,
            None => return CacheLookup::NotFound,
        };
        let bucket = self.bucket(&node);
        let mut data = bucket.data.lock().unwrap();
        self.new_reference(bucket, &data, &node);
        if node.on_dead_list.load(Ordering::Relaxed) {
            data.unlink_dead(&node);
        }

        let mut found = None;
        let mut cursor = data.chain_head(node.id);
        while let Some(top) = cursor {
            cursor = data.headers[top].next;
            let key = data.headers[top].chain_key;
            let matches = key == ChainKey::positive(rr_type)
                || key == ChainKey::negative(rr_type)
                || key == ChainKey::NCACHE_ANY;
            if matches && self.check_stale(&mut data, node.id, top, now) {
                found = Some(top);
                break;
            }
        }

        match found {
            Some(top) => {
                self.maybe_refresh_lru(&mut data, top, now);
                let negative = data.headers[top].chain_key.is_negative();
                let answer = self.bind_answer(&mut data, top, now);
                let node_ref = NodeRef {
                    db: self.clone(),
                    node,
                };
                if negative {
                    CacheLookup::Negative(node_ref, answer)
                } else {
                    CacheLookup::Found(node_ref, answer)
                }
            }
            None => {
                // Give the reference back; that also cleans anything
                // check_stale marked, if no one else is using the
                // node.
                self.decrement_reference(bucket, &mut data, &node, None, None, false);
                CacheLookup::NotFound
            }
        }
    }

    /// Returns whether a cache header is usable at `now`. A header
    /// expired beyond the virtual-time slack is marked stale here so
    /// cleanup will find it.
    fn check_stale(
        &self,
        data: &mut BucketData,
        node_id: NodeId,
        top: HeaderKey,
        now: Timestamp,
    ) -> bool {
        let header = &data.headers[top];
        if !header.exists() || header.is_stale() {
            return false;
        }
        if header.expiry <= now.checked_back(VIRTUAL_TIME_SLACK) {
            data.stale_header(top);
            data.mark_dirty(node_id);
            return false;
        }
        true
    }

    /// Refreshes a cache entry's LRU position if the rate-limit policy
    /// allows it.
    fn maybe_refresh_lru(&self, data: &mut BucketData, top: HeaderKey, now: Timestamp) {
        if !data.headers[top].lru_linked {
            return;
        }
        let last_used = data.headers[top].last_used;
        if u64::from(now) < u64::from(last_used) + self.inner.lru_update_interval {
            return;
        }
        data.unlink_lru(top);
        data.headers[top].last_used = now;
        data.relink_lru(top);
    }

    /// Looks up one RRset at an already-held node (zone role).
    pub fn find_rdataset(
        &self,
        node: &NodeRef,
        version: Option<&ReadVersion>,
        rr_type: Type,
    ) -> Option<Answer> {
        assert_eq!(self.inner.role, Role::Zone);
        let serial = match version {
            Some(version) => version.version.serial,
            None => self.inner.versions.lock().unwrap().current_serial,
        };
        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        let found = data.visible_existing(node.node.id, ChainKey::positive(rr_type), serial)?;
        Some(self.bind_answer(&mut data, found, Timestamp::default()))
    }

    /// Enumerates the RRsets at `node`: those visible to `version` in
    /// the zone role, or those alive at `now` in the cache role.
    pub fn iter_rdatasets(
        &self,
        node: &NodeRef,
        version: Option<&ReadVersion>,
        now: Timestamp,
    ) -> Vec<Answer> {
        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        let node_id = node.node.id;

        let mut visible = Vec::new();
        let mut cursor = data.chain_head(node_id);
        match self.inner.role {
            Role::Zone => {
                let serial = match version {
                    Some(version) => version.version.serial,
                    None => self.inner.versions.lock().unwrap().current_serial,
                };
                while let Some(top) = cursor {
                    cursor = data.headers[top].next;
                    if let Some(found) = data.visible_in_chain(top, serial) {
                        if data.headers[found].exists() {
                            visible.push(found);
                        }
                    }
                }
            }
            Role::Cache => {
                while let Some(top) = cursor {
                    cursor = data.headers[top].next;
                    if self.check_stale(&mut data, node_id, top, now) {
                        visible.push(top);
                    }
                }
            }
        }
        visible
            .into_iter()
            .map(|key| self.bind_answer(&mut data, key, now))
            .collect()
    }

    /// Binds a header into an [`Answer`]: shares the slab, computes
    /// the caller-visible TTL, and advances the rotation counter.
    fn bind_answer(&self, data: &mut BucketData, key: HeaderKey, now: Timestamp) -> Answer {
        let header = &mut data.headers[key];
        let rotation = header.bind_count;
        header.bind_count = header.bind_count.wrapping_add(1);
        let ttl = match self.inner.role {
            Role::Zone => header.ttl,
            Role::Cache => Ttl::from(now.until(header.expiry).min(i32::MAX as u64) as u32),
        };
        Answer::new(
            header.chain_key,
            ttl,
            header.trust,
            header.attributes.contains(Attributes::NXDOMAIN),
            rotation,
            header.slab.clone(),
        )
    }

    ////////////////////////////////////////////////////////////////////
    // CACHE EVICTION AND EXPIRY                                      //
    ////////////////////////////////////////////////////////////////////

    /// Evicts up to a fixed budget of entries from the shards after
    /// `locknum_start`, while the cache is over its memory budget. The
    /// inserting shard itself is skipped so that the RRsets of a
    /// single response (which share a name, hence a shard) don't evict
    /// one another.
    fn overmem_purge(&self, locknum_start: usize, now: Timestamp) {
        let shard_count = self.inner.buckets.len();
        let mut budget = OVERMEM_PURGE_BUDGET;
        let mut locknum = (locknum_start + 1) % shard_count;
        while locknum != locknum_start && budget > 0 {
            let bucket = &self.inner.buckets[locknum];
            let mut data = bucket.data.lock().unwrap();

            // First an entry that is already expired past the slack,
            // if the heap has one.
            if let Some(root) = data.heap.root() {
                if data.headers[root].expiry <= now.checked_back(VIRTUAL_TIME_SLACK) {
                    self.expire_header(bucket, &mut data, root);
                    budget -= 1;
                }
            }

            // Then unconditional LRU-tail evictions. Each victim is
            // unlinked here so it is not reconsidered even if its node
            // is still in use and cannot be retired yet.
            while budget > 0 {
                let tail = match data.lru.tail() {
                    Some(tail) => tail,
                    None => break,
                };
                data.unlink_lru(tail);
                self.expire_header(bucket, &mut data, tail);
                budget -= 1;
            }

            drop(data);
            locknum = (locknum + 1) % shard_count;
        }
    }

    /// Forces a cache header to expire: TTL zero, stale, node dirty.
    /// If nothing references the node, cleanup runs immediately.
    fn expire_header(&self, bucket: &LockBucket, data: &mut BucketData, key: HeaderKey) {
        data.stale_header(key);
        let node = data.headers[key].node.clone();
        data.mark_dirty(node.id);
        if node.current_references() == 0 {
            self.new_reference(bucket, data, &node);
            self.decrement_reference(bucket, data, &node, None, None, false);
        }
    }

    /// Expires data at `node`: everything past the virtual-time slack
    /// goes stale, and under memory pressure unprotected leaf entries
    /// may be force-expired outright.
    pub fn expire_node(&self, node: &NodeRef, now: Timestamp) {
        assert_eq!(self.inner.role, Role::Cache);
        let mut force_expire = false;
        if self.inner.overmem.load(Ordering::Acquire) {
            let leaf = self.inner.tree.read().unwrap().is_leaf(node.name());
            force_expire = leaf && rand::random::<u8>() % 4 == 0;
            debug!(
                "overmem cache: {} {}",
                if force_expire { "FORCE" } else { "check" },
                node.name(),
            );
        }

        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        let node_id = node.node.id;
        let mut cursor = data.chain_head(node_id);
        while let Some(top) = cursor {
            cursor = data.headers[top].next;
            if data.headers[top].expiry <= now.checked_back(VIRTUAL_TIME_SLACK) {
                data.headers[top].attributes.insert(Attributes::STALE);
                data.mark_dirty(node_id);
                debug!("overmem cache: stale {}", node.name());
            } else if force_expire && !data.headers[top].must_retain() {
                data.stale_header(top);
                data.mark_dirty(node_id);
                debug!("overmem cache: expired {}", node.name());
            }
        }
    }

    /// Updates the TTL of the live cache entry of `rr_type` at `node`,
    /// re-ranking it in the shard's expiry heap. Returns whether an
    /// entry was found.
    pub fn touch_ttl(&self, node: &NodeRef, rr_type: Type, ttl: Ttl, now: Timestamp) -> bool {
        assert_eq!(self.inner.role, Role::Cache);
        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        match data.visible_existing(node.node.id, ChainKey::positive(rr_type), Serial::CACHE) {
            Some(key) => {
                data.set_expiry(key, ttl, now + ttl);
                true
            }
            None => false,
        }
    }

    /// Sets the re-signing deadline of the current RRset of `rr_type`
    /// at `node` (zone role), tracking it in the shard's resign heap.
    /// Returns whether an RRset was found.
    pub fn set_resign(&self, node: &NodeRef, rr_type: Type, resign: Timestamp) -> bool {
        assert_eq!(self.inner.role, Role::Zone);
        let serial = self.inner.versions.lock().unwrap().current_serial;
        let bucket = self.bucket(&node.node);
        let mut data = bucket.data.lock().unwrap();
        match data.visible_existing(node.node.id, ChainKey::positive(rr_type), serial) {
            Some(key) => {
                data.set_resign(key, resign);
                true
            }
            None => false,
        }
    }

    /// Returns the RRset whose re-signing deadline comes soonest
    /// across all shards (zone role). The result is a snapshot; under
    /// concurrent changes the true minimum may move.
    pub fn next_resign(&self) -> Option<(NodeRef, Type, Timestamp)> {
        assert_eq!(self.inner.role, Role::Zone);
        let mut best: Option<(usize, Timestamp)> = None;
        for (locknum, bucket) in self.inner.buckets.iter().enumerate() {
            let data = bucket.data.lock().unwrap();
            if let Some(root) = data.heap.root() {
                let resign = data.headers[root].resign;
                if best.map_or(true, |(_, soonest)| resign < soonest) {
                    best = Some((locknum, resign));
                }
            }
        }
        let (locknum, _) = best?;
        let bucket = &self.inner.buckets[locknum];
        let mut data = bucket.data.lock().unwrap();
        let root = data.heap.root()?;
        let node = data.headers[root].node.clone();
        let rr_type = data.headers[root].chain_key.base();
        let resign = data.headers[root].resign;
        self.new_reference(bucket, &data, &node);
        if node.on_dead_list.load(Ordering::Relaxed) {
            data.unlink_dead(&node);
        }
        Some((
            NodeRef {
                db: self.clone(),
                node,
            },
            rr_type,
            resign,
        ))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use lazy_static::lazy_static;

    use crate::rr::Rdata;

    use super::*;

    lazy_static! {
        static ref APEX: Name = "test.".parse().unwrap();
        static ref WWW: Name = "www.example.test.".parse().unwrap();
        static ref MAIL: Name = "mail.example.test.".parse().unwrap();
    }

    fn zone_db() -> Db {
        Db::create(DbConfig::zone(APEX.clone()))
    }

    fn cache_db() -> Db {
        Db::create(DbConfig::cache())
    }

    fn slab(rdatas: &[&[u8]]) -> RdataSlab {
        let mut slab = RdataSlab::new();
        for &octets in rdatas {
            slab.push(octets.try_into().unwrap());
        }
        slab
    }

    fn a_rrset(rdatas: &[&[u8]]) -> Rrset {
        Rrset::new(Type::A, Ttl::from(300), slab(rdatas))
    }

    fn check_rdatas(answer: &Answer, expected: &[&[u8]]) {
        let mut rdatas = answer.rdatas().iter();
        for &expected in expected {
            assert_eq!(rdatas.next().unwrap().octets(), expected);
        }
        assert!(rdatas.next().is_none());
    }

    ////////////////////////////////////////////////////////////////////
    // ZONE ROLE: MVCC                                                //
    ////////////////////////////////////////////////////////////////////

    #[test]
    fn committed_data_is_visible_byte_exact() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 2, 3, 4]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        match db.find(&WWW, Type::A, None) {
            ZoneLookup::Found(_, answer) => {
                check_rdatas(&answer, &[&[1, 2, 3, 4]]);
                assert_eq!(answer.ttl(), Ttl::from(300));
            }
            other => panic!("expected the A record, got {:?}", other),
        }
    }

    #[test]
    fn rollback_leaves_data_intact() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 2, 3, 4]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        // Delete the record, then roll the transaction back.
        let version = db.new_version();
        assert!(matches!(
            db.delete_rdataset(&node, Some(&version), Type::A).unwrap(),
            DeleteOutcome::Deleted,
        ));
        db.close_version(version, false);

        match db.find(&WWW, Type::A, None) {
            ZoneLookup::Found(_, answer) => check_rdatas(&answer, &[&[1, 2, 3, 4]]),
            other => panic!("rollback lost the record: {:?}", other),
        }

        // Dropping the writer handle without closing it also rolls
        // back.
        let version = db.new_version();
        db.delete_rdataset(&node, Some(&version), Type::A).unwrap();
        drop(version);
        assert!(matches!(
            db.find(&WWW, Type::A, None),
            ZoneLookup::Found(_, _),
        ));
    }

    #[test]
    fn readers_pin_their_snapshot() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();

        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);
        let old_reader = db.current_version();

        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[2, 2, 2, 2]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        // The old reader still sees the old record; a new reader (and
        // the versionless current view) sees the new one.
        let old = db.find_rdataset(&node, Some(&old_reader), Type::A).unwrap();
        check_rdatas(&old, &[&[1, 1, 1, 1]]);
        let new = db.find_rdataset(&node, None, Type::A).unwrap();
        check_rdatas(&new, &[&[2, 2, 2, 2]]);
    }

    #[test]
    #[should_panic(expected = "already open")]
    fn second_concurrent_writer_panics() {
        let db = zone_db();
        let _first = db.new_version();
        let _second = db.new_version();
    }

    #[test]
    fn deleting_an_absent_type_is_idempotent() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        for _ in 0..2 {
            assert!(matches!(
                db.delete_rdataset(&node, Some(&version), Type::AAAA).unwrap(),
                DeleteOutcome::Unchanged,
            ));
        }
        db.close_version(version, true);
    }

    #[test]
    fn merge_mode_unions_rrsets() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        let options = AddOptions {
            merge: true,
            ..AddOptions::default()
        };
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1]]),
            options,
            Timestamp::default(),
        )
        .unwrap();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[2, 2, 2, 2]]),
            options,
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        let answer = db.find_rdataset(&node, None, Type::A).unwrap();
        check_rdatas(&answer, &[&[1, 1, 1, 1], &[2, 2, 2, 2]]);
    }

    #[test]
    fn subtract_removes_and_reports() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1], &[2, 2, 2, 2]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        let version = db.new_version();

        // Subtracting an absent record changes nothing.
        assert!(matches!(
            db.subtract_rdataset(
                &node,
                &version,
                &a_rrset(&[&[9, 9, 9, 9]]),
                false,
                Timestamp::default(),
            )
            .unwrap(),
            SubtractOutcome::Unchanged,
        ));

        // With exact, it is an error instead.
        assert_eq!(
            db.subtract_rdataset(
                &node,
                &version,
                &a_rrset(&[&[9, 9, 9, 9]]),
                true,
                Timestamp::default(),
            )
            .unwrap_err(),
            Error::NotExact,
        );

        // Remove one of the two records.
        match db
            .subtract_rdataset(
                &node,
                &version,
                &a_rrset(&[&[1, 1, 1, 1]]),
                false,
                Timestamp::default(),
            )
            .unwrap()
        {
            SubtractOutcome::Changed(answer) => check_rdatas(&answer, &[&[2, 2, 2, 2]]),
            other => panic!("expected a changed RRset, got {:?}", other),
        }

        // Remove the remaining record.
        assert!(matches!(
            db.subtract_rdataset(
                &node,
                &version,
                &a_rrset(&[&[2, 2, 2, 2]]),
                false,
                Timestamp::default(),
            )
            .unwrap(),
            SubtractOutcome::RemovedRrset,
        ));
        db.close_version(version, true);

        assert!(matches!(
            db.find(&WWW, Type::A, None),
            ZoneLookup::NoRecords(_),
        ));
    }

    #[test]
    fn cname_may_not_coexist_with_other_data() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        let cname = Rrset::new(
            Type::CNAME,
            Ttl::from(300),
            slab(&[b"\x05alias\x04test\x00"]),
        );
        assert_eq!(
            db.add_rdataset(
                &node,
                Some(&version),
                &cname,
                AddOptions::default(),
                Timestamp::default(),
            )
            .unwrap_err(),
            Error::CnameAndOther,
        );
        db.close_version(version, true);
    }

    #[test]
    fn lookup_falls_back_to_cname() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        let cname = Rrset::new(
            Type::CNAME,
            Ttl::from(300),
            slab(&[b"\x05alias\x04test\x00"]),
        );
        db.add_rdataset(
            &node,
            Some(&version),
            &cname,
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        assert!(matches!(
            db.find(&WWW, Type::AAAA, None),
            ZoneLookup::Cname(_, _),
        ));
    }

    #[test]
    fn bulk_load_needs_no_version() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let options = AddOptions {
            loading: true,
            merge: true,
            ..AddOptions::default()
        };
        db.add_rdataset(
            &node,
            None,
            &a_rrset(&[&[1, 1, 1, 1]]),
            options,
            Timestamp::default(),
        )
        .unwrap();
        db.add_rdataset(
            &node,
            None,
            &a_rrset(&[&[2, 2, 2, 2]]),
            options,
            Timestamp::default(),
        )
        .unwrap();
        let answer = db.find_rdataset(&node, None, Type::A).unwrap();
        check_rdatas(&answer, &[&[1, 1, 1, 1], &[2, 2, 2, 2]]);
    }

    #[test]
    fn iter_rdatasets_enumerates_visible_types() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        let txt = Rrset::new(Type::TXT, Ttl::from(60), slab(&[b"\x04text"]));
        db.add_rdataset(
            &node,
            Some(&version),
            &txt,
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        let mut types: Vec<Type> = db
            .iter_rdatasets(&node, None, Timestamp::default())
            .iter()
            .map(Answer::rr_type)
            .collect();
        types.sort_unstable();
        assert_eq!(types, [Type::A, Type::TXT]);
        assert_eq!(db.names(), [WWW.clone()]);
    }

    ////////////////////////////////////////////////////////////////////
    // NODE LIFECYCLE                                                 //
    ////////////////////////////////////////////////////////////////////

    #[test]
    fn empty_nodes_are_retired() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        assert_eq!(db.node_count(), 1);

        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        let version = db.new_version();
        db.delete_rdataset(&node, Some(&version), Type::A).unwrap();
        db.close_version(version, true);

        // The node still holds our reference; dropping it lets the
        // cleanup delete the (now data-free) node from the tree.
        drop(node);
        assert_eq!(db.node_count(), 0);
        assert!(db.find_node(&WWW, false).is_none());
    }

    #[test]
    fn wildcard_parents_are_pruned_through_the_dispatcher() {
        let dispatcher = Arc::new(Dispatcher::new().unwrap());
        let mut config = DbConfig::zone(APEX.clone());
        config.dispatcher = Some(dispatcher.clone());
        let db = Db::create(config);

        let wildcard: Name = "*.sub.test.".parse().unwrap();
        let node = db.find_node(&wildcard, true).unwrap();
        // The wildcard's parent was created for the lookup magic.
        assert_eq!(db.node_count(), 2);

        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[1, 1, 1, 1]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);

        let version = db.new_version();
        db.delete_rdataset(&node, Some(&version), Type::A).unwrap();
        db.close_version(version, true);
        drop(node);

        // Retiring the wildcard leaves its parent a childless,
        // unreferenced leaf; the scheduled pruning removes it too.
        let deadline = Instant::now() + Duration::from_secs(10);
        while db.node_count() > 0 {
            assert!(Instant::now() < deadline, "pruning did not finish");
            thread::sleep(Duration::from_millis(10));
        }
    }

    ////////////////////////////////////////////////////////////////////
    // CACHE ROLE                                                     //
    ////////////////////////////////////////////////////////////////////

    #[test]
    fn negative_entries_expire_with_virtual_time_slack() {
        let db = cache_db();
        let node = db.find_node(&WWW, true).unwrap();
        let inserted_at = Timestamp::from(1_000);
        db.add_negative(
            &node,
            Type::ANY,
            true,
            Ttl::from(60),
            Trust::Answer,
            RdataSlab::new(),
            inserted_at,
        )
        .unwrap();
        drop(node);

        // Live until 1060, and still served within the slack.
        for now in [1_030, 1_100, 1_359] {
            match db.cache_find(&WWW, Type::A, Timestamp::from(now)) {
                CacheLookup::Negative(_, answer) => assert!(answer.is_nxdomain()),
                other => panic!("expected the negative entry at {}: {:?}", now, other),
            }
        }

        // Beyond the slack it is gone.
        assert!(matches!(
            db.cache_find(&WWW, Type::A, Timestamp::from(1_360)),
            CacheLookup::NotFound,
        ));
    }

    #[test]
    fn less_trusted_data_does_not_replace_fresh_data() {
        let db = cache_db();
        let node = db.find_node(&WWW, true).unwrap();
        let now = Timestamp::from(1_000);

        let mut rrset = a_rrset(&[&[1, 1, 1, 1]]);
        rrset.trust = Trust::Answer;
        db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
            .unwrap();

        // Lower trust: refused while the existing data is fresh.
        let mut worse = a_rrset(&[&[9, 9, 9, 9]]);
        worse.trust = Trust::Additional;
        assert!(matches!(
            db.add_rdataset(&node, None, &worse, AddOptions::default(), now)
                .unwrap(),
            AddOutcome::Unchanged(_),
        ));

        // Higher trust: replaces.
        let mut better = a_rrset(&[&[2, 2, 2, 2]]);
        better.trust = Trust::AuthAnswer;
        assert!(matches!(
            db.add_rdataset(&node, None, &better, AddOptions::default(), now)
                .unwrap(),
            AddOutcome::Added(_),
        ));
        match db.cache_find(&WWW, Type::A, now) {
            CacheLookup::Found(_, answer) => check_rdatas(&answer, &[&[2, 2, 2, 2]]),
            other => panic!("expected the more trusted record: {:?}", other),
        }

        // Once the data has expired, lower trust is accepted again.
        let later = Timestamp::from(2_000);
        assert!(matches!(
            db.add_rdataset(&node, None, &worse, AddOptions::default(), later)
                .unwrap(),
            AddOutcome::Added(_),
        ));
    }

    #[test]
    fn identical_address_rrsets_refresh_in_place() {
        let db = cache_db();
        let node = db.find_node(&WWW, true).unwrap();
        let now = Timestamp::from(1_000);

        let mut rrset = a_rrset(&[&[1, 1, 1, 1]]);
        rrset.trust = Trust::Answer;
        rrset.ttl = Ttl::from(3_600);
        db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
            .unwrap();

        // The identical RRset with a shorter TTL lowers the expiry
        // rather than stacking a new entry.
        rrset.ttl = Ttl::from(100);
        db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
            .unwrap();
        match db.cache_find(&WWW, Type::A, now) {
            CacheLookup::Found(_, answer) => assert_eq!(answer.ttl(), Ttl::from(100)),
            other => panic!("expected the refreshed RRset: {:?}", other),
        }
    }

    #[test]
    fn negative_answers_cover_their_type_only() {
        let db = cache_db();
        let node = db.find_node(&WWW, true).unwrap();
        let now = Timestamp::from(1_000);
        db.add_negative(
            &node,
            Type::MX,
            false,
            Ttl::from(60),
            Trust::Answer,
            RdataSlab::new(),
            now,
        )
        .unwrap();

        assert!(matches!(
            db.cache_find(&WWW, Type::MX, now),
            CacheLookup::Negative(_, _),
        ));
        assert!(matches!(
            db.cache_find(&WWW, Type::A, now),
            CacheLookup::NotFound,
        ));

        // Positive data supersedes the negative proof of its type.
        let mut rrset = Rrset::new(Type::MX, Ttl::from(300), slab(&[&[0, 10, 0]]));
        rrset.trust = Trust::Answer;
        db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
            .unwrap();
        assert!(matches!(
            db.cache_find(&WWW, Type::MX, now),
            CacheLookup::Found(_, _),
        ));
    }

    #[test]
    fn nxdomain_supersedes_positive_data() {
        let db = cache_db();
        let node = db.find_node(&WWW, true).unwrap();
        let now = Timestamp::from(1_000);

        let mut rrset = a_rrset(&[&[1, 1, 1, 1]]);
        rrset.trust = Trust::Answer;
        db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
            .unwrap();
        db.add_negative(
            &node,
            Type::ANY,
            true,
            Ttl::from(60),
            Trust::AuthAnswer,
            RdataSlab::new(),
            now,
        )
        .unwrap();

        // The NXDOMAIN proof is now the only thing found, even for the
        // type that had data.
        assert!(matches!(
            db.cache_find(&WWW, Type::A, now),
            CacheLookup::Negative(_, _),
        ));
    }

    #[test]
    fn touch_ttl_extends_an_entry() {
        let db = cache_db();
        let node = db.find_node(&WWW, true).unwrap();
        let now = Timestamp::from(1_000);
        let mut rrset = a_rrset(&[&[1, 1, 1, 1]]);
        rrset.trust = Trust::Answer;
        db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
            .unwrap();

        let later = Timestamp::from(1_100);
        match db.cache_find(&WWW, Type::A, later) {
            CacheLookup::Found(_, answer) => assert_eq!(answer.ttl(), Ttl::from(200)),
            other => panic!("expected a fresh entry: {:?}", other),
        }
        assert!(db.touch_ttl(&node, Type::A, Ttl::from(600), later));
        match db.cache_find(&WWW, Type::A, later) {
            CacheLookup::Found(_, answer) => assert_eq!(answer.ttl(), Ttl::from(600)),
            other => panic!("expected the extended entry: {:?}", other),
        }
    }

    #[test]
    fn overmem_insertions_evict_old_entries() {
        let mut config = DbConfig::cache();
        config.shards = 2;
        let db = Db::create(config);
        let now = Timestamp::from(1_000);

        let first_wave: Vec<Name> = (0..20)
            .map(|i| format!("host{}.example.test.", i).parse().unwrap())
            .collect();
        for name in &first_wave {
            let node = db.find_node(name, true).unwrap();
            let mut rrset = a_rrset(&[&[1, 1, 1, 1]]);
            rrset.trust = Trust::Answer;
            db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
                .unwrap();
        }

        db.set_overmem(true);
        for i in 0..20 {
            let name: Name = format!("late{}.example.test.", i).parse().unwrap();
            let node = db.find_node(&name, true).unwrap();
            let mut rrset = a_rrset(&[&[2, 2, 2, 2]]);
            rrset.trust = Trust::Answer;
            db.add_rdataset(&node, None, &rrset, AddOptions::default(), now)
                .unwrap();
        }

        // Every overmem insertion may evict up to two entries from the
        // other shard, so some of the first wave must be gone well
        // before their TTLs expire.
        let survivors = first_wave
            .iter()
            .filter(|name| matches!(db.cache_find(name, Type::A, now), CacheLookup::Found(_, _)))
            .count();
        assert!(survivors < first_wave.len());
    }

    ////////////////////////////////////////////////////////////////////
    // RESIGN TRACKING                                                //
    ////////////////////////////////////////////////////////////////////

    #[test]
    fn next_resign_returns_the_soonest_deadline() {
        let db = zone_db();
        let www = db.find_node(&WWW, true).unwrap();
        let mail = db.find_node(&MAIL, true).unwrap();
        let version = db.new_version();
        for node in [&www, &mail] {
            db.add_rdataset(
                node,
                Some(&version),
                &a_rrset(&[&[1, 1, 1, 1]]),
                AddOptions::default(),
                Timestamp::default(),
            )
            .unwrap();
        }
        db.close_version(version, true);

        assert!(db.set_resign(&www, Type::A, Timestamp::from(5_000)));
        assert!(db.set_resign(&mail, Type::A, Timestamp::from(3_000)));

        let (node, rr_type, resign) = db.next_resign().unwrap();
        assert_eq!(node.name(), &*MAIL);
        assert_eq!(rr_type, Type::A);
        assert_eq!(resign, Timestamp::from(3_000));
    }

    ////////////////////////////////////////////////////////////////////
    // CONCURRENCY                                                    //
    ////////////////////////////////////////////////////////////////////

    #[test]
    fn readers_never_observe_partial_writes() {
        let db = zone_db();
        let node = db.find_node(&WWW, true).unwrap();
        let version = db.new_version();
        db.add_rdataset(
            &node,
            Some(&version),
            &a_rrset(&[&[0, 0, 0, 0]]),
            AddOptions::default(),
            Timestamp::default(),
        )
        .unwrap();
        db.close_version(version, true);
        drop(node);

        let writer_db = db.clone();
        let writer = thread::spawn(move || {
            for i in 1..=50u8 {
                let node = writer_db.find_node(&WWW, false).unwrap();
                let version = writer_db.new_version();
                writer_db
                    .add_rdataset(
                        &node,
                        Some(&version),
                        &a_rrset(&[&[i, i, i, i]]),
                        AddOptions::default(),
                        Timestamp::default(),
                    )
                    .unwrap();
                writer_db.close_version(version, true);
            }
        });

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let reader_db = db.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        let reader = reader_db.current_version();
                        match reader_db.find(&WWW, Type::A, Some(&reader)) {
                            ZoneLookup::Found(_, answer) => {
                                // Whatever snapshot we see must be a
                                // complete committed RRset.
                                let rdatas: Vec<&Rdata> = answer.rdatas().iter().collect();
                                assert_eq!(rdatas.len(), 1);
                                let octets = rdatas[0].octets();
                                assert_eq!(octets.len(), 4);
                                assert!(octets.iter().all(|&o| o == octets[0]));
                            }
                            other => panic!("record vanished mid-run: {:?}", other),
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
