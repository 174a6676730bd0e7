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

//! The [`Node`] structure and the public [`NodeRef`] handle.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::name::Name;

use super::store::Db;

/// A unique identifier for a [`Node`] within its database, used to key
/// per-node state kept inside the node's lock shard.
pub(super) type NodeId = u64;

////////////////////////////////////////////////////////////////////////
// NODES                                                              //
////////////////////////////////////////////////////////////////////////

/// One owner name in the database.
///
/// A node is created by the tree on the first insertion for its name
/// and shared from then on: the tree holds one reference, every
/// outstanding [`NodeRef`] holds one, and transient internal work
/// (changed lists, dead lists, scheduled pruning) holds more. The
/// node's RRset data — its header chains — is *not* stored here: it
/// lives in the node's lock shard, keyed by [`Node::id`], so that the
/// shard mutex guards all chain mutation. What the node itself carries
/// is the identity and lifecycle state that must be reachable without
/// the shard lock.
pub struct Node {
    pub(super) id: NodeId,
    pub(super) name: Name,

    /// The index of the lock shard this node hashes to. Fixed at
    /// creation.
    pub(super) locknum: usize,

    /// The number of active references. The zero-to-one and
    /// one-to-zero transitions additionally maintain the shard's
    /// aggregate reference counter, and must only be performed with
    /// the shard lock held.
    pub(super) references: AtomicU32,

    /// Whether this node is currently queued on its shard's dead-node
    /// list. Mutated only under the shard lock.
    pub(super) on_dead_list: AtomicBool,

    /// Whether a wildcard domain name exists directly below this node.
    /// Set under the tree write lock when a wildcard name is inserted.
    pub(super) wild: AtomicBool,

    /// Whether lookups descending through this node must consult it
    /// even when it is not the target (it is a wildcard parent or a
    /// zone cut). Set under the tree write lock.
    pub(super) find_callback: AtomicBool,
}

impl Node {
    pub(super) fn new(id: NodeId, name: Name, locknum: usize) -> Self {
        Self {
            id,
            name,
            locknum,
            references: AtomicU32::new(0),
            on_dead_list: AtomicBool::new(false),
            wild: AtomicBool::new(false),
            find_callback: AtomicBool::new(false),
        }
    }

    /// Returns the owner name of this node.
    pub fn name(&self) -> &Name {
        &self.name
    }

    /// Returns the current reference count. Racy by nature; for
    /// bookkeeping and diagnostics only.
    pub(super) fn current_references(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    /// Returns whether a wildcard domain name exists directly below
    /// this node.
    pub fn is_wildcard_parent(&self) -> bool {
        self.wild.load(Ordering::Relaxed)
    }

    /// Returns whether lookups descending through this node must
    /// consult it even when it is not the target of the search.
    pub fn has_find_callback(&self) -> bool {
        self.find_callback.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("locknum", &self.locknum)
            .field("references", &self.current_references())
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// NODE HANDLES                                                       //
////////////////////////////////////////////////////////////////////////

/// An owned reference to a [`Node`].
///
/// A `NodeRef` keeps its node alive: the node will not be removed from
/// the tree (nor its memory reclaimed) while any handle is
/// outstanding. Dropping the handle releases the reference; if it was
/// the last one and the node no longer holds data, the node becomes
/// eligible for removal.
pub struct NodeRef {
    pub(super) db: Db,
    pub(super) node: Arc<Node>,
}

impl NodeRef {
    /// Returns the owner name of the referenced node.
    pub fn name(&self) -> &Name {
        self.node.name()
    }
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        self.db.attach_node(&self.node)
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.db.release_node(&self.node);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.node).finish()
    }
}
