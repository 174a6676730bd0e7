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

//! The per-shard LRU list of cache headers.
//!
//! Every cache header is linked into its shard's LRU list when it is
//! inserted. Qualifying lookups unlink the header and prepend it
//! again, so the tail of the list is always the least recently used
//! entry — the first candidate for eviction under memory pressure.
//!
//! The list is doubly linked through the headers' `lru_prev` and
//! `lru_next` slab keys and, like the rest of a shard, is guarded by
//! the shard lock.

use slab::Slab;

use super::header::{Header, HeaderKey};

////////////////////////////////////////////////////////////////////////
// LRU LISTS                                                          //
////////////////////////////////////////////////////////////////////////

/// A doubly linked list of headers, most recently used first.
#[derive(Debug, Default)]
pub(super) struct LruList {
    head: Option<HeaderKey>,
    tail: Option<HeaderKey>,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the least recently used header, if any.
    pub fn tail(&self) -> Option<HeaderKey> {
        self.tail
    }

    /// Links `header_key` at the head of the list. The header must not
    /// currently be linked.
    pub fn prepend(&mut self, headers: &mut Slab<Header>, header_key: HeaderKey) {
        debug_assert!(!headers[header_key].lru_linked);
        let old_head = self.head;
        {
            let header = &mut headers[header_key];
            header.lru_prev = None;
            header.lru_next = old_head;
            header.lru_linked = true;
        }
        match old_head {
            Some(old_head) => headers[old_head].lru_prev = Some(header_key),
            None => self.tail = Some(header_key),
        }
        self.head = Some(header_key);
    }

    /// Unlinks `header_key` from the list. The header must currently
    /// be linked.
    pub fn unlink(&mut self, headers: &mut Slab<Header>, header_key: HeaderKey) {
        debug_assert!(headers[header_key].lru_linked);
        let (prev, next) = {
            let header = &mut headers[header_key];
            let links = (header.lru_prev, header.lru_next);
            header.lru_prev = None;
            header.lru_next = None;
            header.lru_linked = false;
            links
        };
        match prev {
            Some(prev) => headers[prev].lru_next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => headers[next].lru_prev = prev,
            None => self.tail = prev,
        }
    }

}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use slab::Slab;

    use crate::name::Name;
    use crate::rr::{RdataSlab, Timestamp, Trust, Ttl, Type};

    use super::super::header::{Attributes, ChainKey, Header};
    use super::super::node::Node;
    use super::super::version::Serial;
    use super::*;

    fn any_header() -> Header {
        let node = Arc::new(Node::new(0, Name::root(), 0));
        Header::new(
            ChainKey::positive(Type::A),
            Serial::CACHE,
            Ttl::from(300),
            Timestamp::from(1_000),
            Trust::Answer,
            Attributes::default(),
            Arc::new(RdataSlab::new()),
            node,
        )
    }

    fn collect(lru: &LruList, headers: &Slab<Header>) -> Vec<HeaderKey> {
        let mut keys = Vec::new();
        let mut cursor = lru.head;
        while let Some(key) = cursor {
            keys.push(key);
            cursor = headers[key].lru_next;
        }
        keys
    }

    #[test]
    fn prepend_orders_most_recent_first() {
        let mut headers = Slab::new();
        let mut lru = LruList::new();
        let a = headers.insert(any_header());
        let b = headers.insert(any_header());
        let c = headers.insert(any_header());
        for key in [a, b, c] {
            lru.prepend(&mut headers, key);
        }
        assert_eq!(collect(&lru, &headers), [c, b, a]);
        assert_eq!(lru.tail(), Some(a));
    }

    #[test]
    fn refresh_moves_an_entry_to_the_head() {
        let mut headers = Slab::new();
        let mut lru = LruList::new();
        let a = headers.insert(any_header());
        let b = headers.insert(any_header());
        let c = headers.insert(any_header());
        for key in [a, b, c] {
            lru.prepend(&mut headers, key);
        }
        lru.unlink(&mut headers, a);
        lru.prepend(&mut headers, a);
        assert_eq!(collect(&lru, &headers), [a, c, b]);
        assert_eq!(lru.tail(), Some(b));
    }

    #[test]
    fn unlink_handles_all_positions() {
        let mut headers = Slab::new();
        let mut lru = LruList::new();
        let a = headers.insert(any_header());
        let b = headers.insert(any_header());
        let c = headers.insert(any_header());
        for key in [a, b, c] {
            lru.prepend(&mut headers, key);
        }

        lru.unlink(&mut headers, b); // middle
        assert_eq!(collect(&lru, &headers), [c, a]);
        lru.unlink(&mut headers, c); // head
        assert_eq!(collect(&lru, &headers), [a]);
        lru.unlink(&mut headers, a); // tail and last
        assert_eq!(collect(&lru, &headers), []);
        assert_eq!(lru.tail(), None);
        assert!(!headers[a].lru_linked);
    }
}
