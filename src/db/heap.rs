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

//! The per-shard expiry heap.
//!
//! Each lock shard owns one binary min-heap over the headers it
//! stores, keyed by TTL expiry (cache role) or by re-signing deadline
//! (zone role). The heap makes "which entry dies soonest?" an O(1)
//! question, which is what the overmem purge and the re-signing
//! machinery ask. Headers record their current heap position, so a
//! TTL change can re-heapify just the affected path.

use slab::Slab;

use super::header::{Header, HeaderKey};

////////////////////////////////////////////////////////////////////////
// HEAP STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// What an [`ExpiryHeap`] orders its headers by.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum HeapKey {
    /// TTL expiry time (cache role).
    Expiry,
    /// Re-signing deadline (zone role).
    Resign,
}

/// A binary min-heap of headers, ordered by [`HeapKey`].
///
/// The heap stores slab keys into the owning shard's header arena and
/// keeps each tracked header's [`heap_index`](Header::heap_index) in
/// sync, so entries can be removed or re-prioritized by position. Like
/// everything else in a shard, it is guarded by the shard lock.
#[derive(Debug)]
pub(super) struct ExpiryHeap {
    entries: Vec<HeaderKey>,
    key: HeapKey,
}

impl ExpiryHeap {
    pub fn new(key: HeapKey) -> Self {
        Self {
            entries: Vec::new(),
            key,
        }
    }

    /// Returns whether `a` expires sooner than `b`.
    fn sooner(&self, a: &Header, b: &Header) -> bool {
        match self.key {
            HeapKey::Expiry => a.expiry < b.expiry,
            HeapKey::Resign => a.resign < b.resign,
        }
    }

    /// Returns the header that expires soonest, if any.
    pub fn root(&self) -> Option<HeaderKey> {
        self.entries.first().copied()
    }

    /// Adds `header_key` to the heap and records its position in the
    /// header.
    pub fn insert(&mut self, headers: &mut Slab<Header>, header_key: HeaderKey) {
        let index = self.entries.len();
        self.entries.push(header_key);
        headers[header_key].heap_index = Some(index);
        self.float_up(headers, index);
    }

    /// Removes the header at heap position `index`.
    pub fn delete(&mut self, headers: &mut Slab<Header>, index: usize) {
        let removed = self.entries[index];
        headers[removed].heap_index = None;
        let last = self.entries.pop().unwrap();
        if last != removed {
            self.entries[index] = last;
            headers[last].heap_index = Some(index);
            self.resift(headers, index);
        }
    }

    /// Restores the heap property around position `index` after the
    /// key of the header there has changed in either direction.
    pub fn resift(&mut self, headers: &mut Slab<Header>, index: usize) {
        if !self.float_up(headers, index) {
            self.sink_down(headers, index);
        }
    }

    /// Moves the entry at `index` toward the root while it is sooner
    /// than its parent. Returns whether it moved.
    fn float_up(&mut self, headers: &mut Slab<Header>, mut index: usize) -> bool {
        let mut moved = false;
        while index > 0 {
            let parent = (index - 1) / 2;
            let (child_key, parent_key) = (self.entries[index], self.entries[parent]);
            if !self.sooner(&headers[child_key], &headers[parent_key]) {
                break;
            }
            self.swap(headers, index, parent);
            index = parent;
            moved = true;
        }
        moved
    }

    /// Moves the entry at `index` away from the root while a child is
    /// sooner than it.
    fn sink_down(&mut self, headers: &mut Slab<Header>, mut index: usize) {
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut soonest = index;
            for child in [left, right] {
                if child < self.entries.len()
                    && self.sooner(&headers[self.entries[child]], &headers[self.entries[soonest]])
                {
                    soonest = child;
                }
            }
            if soonest == index {
                break;
            }
            self.swap(headers, index, soonest);
            index = soonest;
        }
    }

    fn swap(&mut self, headers: &mut Slab<Header>, a: usize, b: usize) {
        self.entries.swap(a, b);
        headers[self.entries[a]].heap_index = Some(a);
        headers[self.entries[b]].heap_index = Some(b);
    }

    /// Checks the heap property over the entire heap. For tests and
    /// debug assertions.
    #[cfg(test)]
    pub fn is_consistent(&self, headers: &Slab<Header>) -> bool {
        (1..self.entries.len()).all(|index| {
            let parent = (index - 1) / 2;
            !self.sooner(
                &headers[self.entries[index]],
                &headers[self.entries[parent]],
            ) && headers[self.entries[index]].heap_index == Some(index)
        })
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
