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

//! The name-indexed tree.
//!
//! The tree mirrors the DNS namespace: each level stores its children
//! in a hash map keyed by [`LabelBuf`]. A name present in the database
//! has a [`Node`] attached to its tree position; positions that exist
//! only because names live below them carry no node and are trimmed
//! automatically once their last child disappears.
//!
//! The tree itself is plain data. The database wraps it in the
//! tree-wide `RwLock`: lookups descend under the read lock, while
//! inserting or deleting positions requires the write lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::name::{LabelBuf, Name};

use super::node::Node;

////////////////////////////////////////////////////////////////////////
// TREE STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// One position in the namespace tree.
#[derive(Default)]
struct TreeNode {
    children: HashMap<LabelBuf, TreeNode>,
    node: Option<Arc<Node>>,
}

/// The namespace tree, from the root name down.
pub(super) struct NameTree {
    root: TreeNode,
    node_count: usize,
}

/// The result of [`NameTree::delete`].
pub(super) struct Delete {
    /// The node that was removed, if the name was present.
    pub removed: Option<Arc<Node>>,

    /// The nearest ancestor node that was left a childless leaf by the
    /// deletion. Such a node may itself deserve removal, but deciding
    /// that needs its shard lock, so the caller schedules the check
    /// instead of this module performing it.
    pub parent_leaf: Option<Arc<Node>>,
}

impl NameTree {
    pub fn new() -> Self {
        Self {
            root: TreeNode::default(),
            node_count: 0,
        }
    }

    /// Returns the number of names with nodes in the tree.
    pub fn len(&self) -> usize {
        self.node_count
    }

    /// Finds the node for `name`, if present.
    pub fn find(&self, name: &Name) -> Option<Arc<Node>> {
        let mut tree_node = &self.root;
        for label in name.labels().rev() {
            tree_node = tree_node.children.get(label)?;
        }
        tree_node.node.clone()
    }

    /// Gets or creates the node for `name`. Positions between the root
    /// and the target are created as needed. `make` is called to
    /// produce the node when the name is not yet present; the second
    /// element of the return value reports whether that happened.
    pub fn get_or_insert_with(
        &mut self,
        name: &Name,
        make: impl FnOnce() -> Arc<Node>,
    ) -> (Arc<Node>, bool) {
        let mut tree_node = &mut self.root;
        for label in name.labels().rev() {
            tree_node = tree_node
                .children
                .entry(LabelBuf::from(label))
                .or_default();
        }
        match &tree_node.node {
            Some(node) => (node.clone(), false),
            None => {
                let node = make();
                tree_node.node = Some(node.clone());
                self.node_count += 1;
                (node, true)
            }
        }
    }

    /// Removes the node for `name` from the tree, trimming any
    /// node-less positions this leaves empty. See [`Delete`] for what
    /// is reported back.
    pub fn delete(&mut self, name: &Name) -> Delete {
        let mut outcome = Delete {
            removed: None,
            parent_leaf: None,
        };
        Self::delete_in(&mut self.root, name, name.len(), &mut outcome);
        if outcome.removed.is_some() {
            self.node_count -= 1;
        }
        outcome
    }

    /// The recursive step of [`NameTree::delete`]. `tree_node`
    /// corresponds to label `level` of `name` (with `level == 0`
    /// denoting the target). Returns whether `tree_node` should be
    /// removed from its parent.
    fn delete_in(
        tree_node: &mut TreeNode,
        name: &Name,
        level: usize,
        outcome: &mut Delete,
    ) -> bool {
        if level == 0 {
            outcome.removed = tree_node.node.take();
        } else {
            let label = &name[level - 1];
            let removed_child = match tree_node.children.get_mut(label) {
                Some(child) => Self::delete_in(child, name, level - 1, outcome),
                None => return false,
            };
            if removed_child {
                tree_node.children.remove(label);
                if outcome.removed.is_some()
                    && outcome.parent_leaf.is_none()
                    && tree_node.children.is_empty()
                {
                    outcome.parent_leaf = tree_node.node.clone();
                }
            }
        }
        tree_node.node.is_none() && tree_node.children.is_empty()
    }

    /// Returns whether the tree position of `name` has no children.
    /// A name not present at all counts as a leaf.
    pub fn is_leaf(&self, name: &Name) -> bool {
        let mut tree_node = &self.root;
        for label in name.labels().rev() {
            match tree_node.children.get(label) {
                Some(child) => tree_node = child,
                None => return true,
            }
        }
        tree_node.children.is_empty()
    }

    /// Returns an iterator over every node in the tree, in no
    /// particular order.
    pub fn iter(&self) -> Iter {
        Iter {
            stack: vec![&self.root],
        }
    }

    /// Removes all positions and nodes.
    pub fn clear(&mut self) {
        self.root = TreeNode::default();
        self.node_count = 0;
    }
}

////////////////////////////////////////////////////////////////////////
// TREE ITERATION                                                     //
////////////////////////////////////////////////////////////////////////

/// An iterator over the nodes of a [`NameTree`].
pub(super) struct Iter<'a> {
    stack: Vec<&'a TreeNode>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(tree_node) = self.stack.pop() {
            self.stack.extend(tree_node.children.values());
            if let Some(node) = &tree_node.node {
                return Some(node);
            }
        }
        None
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> Name {
        text.parse().unwrap()
    }

    fn make_node(id: u64, name: &Name) -> Arc<Node> {
        Arc::new(Node::new(id, name.clone(), 0))
    }

    fn insert(tree: &mut NameTree, id: u64, text: &str) -> Arc<Node> {
        let name = name(text);
        let (node, created) = tree.get_or_insert_with(&name, || make_node(id, &name));
        assert!(created);
        node
    }

    #[test]
    fn find_returns_inserted_nodes() {
        let mut tree = NameTree::new();
        let www = insert(&mut tree, 1, "www.example.test.");
        assert_eq!(tree.len(), 1);
        let found = tree.find(&name("www.example.test.")).unwrap();
        assert!(Arc::ptr_eq(&found, &www));

        // Intermediate positions exist but carry no nodes.
        assert!(tree.find(&name("example.test.")).is_none());
        assert!(tree.find(&name("test.")).is_none());
    }

    #[test]
    fn get_or_insert_finds_existing_nodes() {
        let mut tree = NameTree::new();
        let first = insert(&mut tree, 1, "www.example.test.");
        let target = name("www.example.test.");
        let (second, created) = tree.get_or_insert_with(&target, || make_node(2, &target));
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn delete_removes_and_trims() {
        let mut tree = NameTree::new();
        insert(&mut tree, 1, "www.example.test.");
        let outcome = tree.delete(&name("www.example.test."));
        assert!(outcome.removed.is_some());
        assert!(outcome.parent_leaf.is_none());
        assert_eq!(tree.len(), 0);

        // The node-less intermediate positions must be gone too.
        assert!(tree.is_leaf(&name("test.")));
    }

    #[test]
    fn delete_reports_the_parent_left_a_leaf() {
        let mut tree = NameTree::new();
        let parent = insert(&mut tree, 1, "example.test.");
        insert(&mut tree, 2, "www.example.test.");

        let outcome = tree.delete(&name("www.example.test."));
        assert!(outcome.removed.is_some());
        let leaf = outcome.parent_leaf.unwrap();
        assert!(Arc::ptr_eq(&leaf, &parent));
    }

    #[test]
    fn delete_keeps_positions_with_other_children() {
        let mut tree = NameTree::new();
        insert(&mut tree, 1, "a.example.test.");
        insert(&mut tree, 2, "b.example.test.");

        let outcome = tree.delete(&name("a.example.test."));
        assert!(outcome.removed.is_some());
        assert!(outcome.parent_leaf.is_none());
        assert!(tree.find(&name("b.example.test.")).is_some());
    }

    #[test]
    fn delete_of_an_absent_name_is_a_no_op() {
        let mut tree = NameTree::new();
        insert(&mut tree, 1, "www.example.test.");
        let outcome = tree.delete(&name("mail.example.test."));
        assert!(outcome.removed.is_none());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn iter_visits_every_node() {
        let mut tree = NameTree::new();
        insert(&mut tree, 1, "a.test.");
        insert(&mut tree, 2, "b.test.");
        insert(&mut tree, 3, "c.b.test.");
        let mut ids: Vec<u64> = tree.iter().map(|node| node.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, [1, 2, 3]);
    }
}
