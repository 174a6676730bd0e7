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

//! The [`RdataSlab`] structure: RDATA for one RRset in one contiguous
//! memory region.
//!
//! The database stores every RRset snapshot as a slab of opaque bytes.
//! Keeping all the (frequently small) RDATA of an RRset contiguous is
//! friendly to the CPU cache, and treating the contents as opaque means
//! the storage engine needs no per-type knowledge: the set-algebra
//! operations it requires for dynamic updates — [`merge`], [`subtract`]
//! and set [`equality`] — work on whole RDATA octet strings.
//!
//! Internally a slab is a sequence of entries, each a native-endian
//! `u16` length followed by that many octets of RDATA.
//!
//! [`merge`]: RdataSlab::merge
//! [`subtract`]: RdataSlab::subtract
//! [`equality`]: RdataSlab::set_equal

use std::fmt;
use std::iter::FusedIterator;

////////////////////////////////////////////////////////////////////////
// RDATA                                                              //
////////////////////////////////////////////////////////////////////////

/// The RDATA of a single resource record.
///
/// This is a wrapper over `[u8]` that can only be constructed if the
/// slice is no longer than 65,535 octets (the wire-format limit).
#[repr(transparent)]
pub struct Rdata {
    octets: [u8],
}

#[allow(clippy::len_without_is_empty)] // Zero-length RDATA is valid.
impl Rdata {
    fn from_unchecked(octets: &[u8]) -> &Self {
        unsafe { &*(octets as *const [u8] as *const Rdata) }
    }

    /// Returns the number of octets in this `Rdata`.
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    /// Returns the octets of this `Rdata`.
    pub fn octets(&self) -> &[u8] {
        &self.octets
    }
}

impl<'a> TryFrom<&'a [u8]> for &'a Rdata {
    type Error = SlabError;

    fn try_from(octets: &'a [u8]) -> Result<Self, SlabError> {
        if octets.len() > u16::MAX as usize {
            Err(SlabError::RdataTooLong)
        } else {
            Ok(Rdata::from_unchecked(octets))
        }
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for &'a Rdata {
    fn from(octets: &'a [u8; N]) -> Self {
        assert!(N <= u16::MAX as usize);
        Rdata::from_unchecked(octets)
    }
}

impl PartialEq for Rdata {
    fn eq(&self, other: &Self) -> bool {
        self.octets == other.octets
    }
}

impl Eq for Rdata {}

impl fmt::Debug for Rdata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02x?}", &self.octets)
    }
}

////////////////////////////////////////////////////////////////////////
// SLAB STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// Stores the RDATA of an RRset in a contiguous memory region.
///
/// The octets of the member records are kept back to back, each
/// prefixed by a two-octet length. A record occurs at most once in a
/// slab; [`push`](RdataSlab::push) silently drops duplicates the way
/// other nameservers do.
#[derive(Clone, Default)]
pub struct RdataSlab {
    inner: Vec<u8>,
}

impl RdataSlab {
    /// Creates a new slab initially containing no [`Rdata`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies an [`Rdata`] into this slab, unless identical RDATA is
    /// already present. Returns whether the RDATA was inserted.
    pub fn push(&mut self, rdata: &Rdata) -> bool {
        if self.iter().any(|existing| existing == rdata) {
            return false;
        }
        self.inner.reserve(2 + rdata.len());
        self.inner
            .extend_from_slice(&(rdata.len() as u16).to_ne_bytes());
        self.inner.extend_from_slice(rdata.octets());
        true
    }

    /// Returns an iterator over the [`Rdata`] of this slab.
    pub fn iter(&self) -> Iter {
        Iter {
            cursor: &self.inner,
        }
    }

    /// Returns the number of records in this slab.
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Returns whether this slab contains no records.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns whether this slab contains `rdata`.
    pub fn contains(&self, rdata: &Rdata) -> bool {
        self.iter().any(|existing| existing == rdata)
    }

    /// Computes the union of `self` and `other`.
    ///
    /// When `exact` is set, the operation fails unless the two slabs
    /// are disjoint, so that the result contains exactly the records
    /// the caller asked to add. Without `exact`, records already
    /// present are silently kept once.
    pub fn merge(&self, other: &Self, exact: bool) -> Result<Self, SlabError> {
        let mut merged = self.clone();
        for rdata in other.iter() {
            if !merged.push(rdata) && exact {
                return Err(SlabError::NotExact);
            }
        }
        Ok(merged)
    }

    /// Computes the difference `self` − `other`.
    ///
    /// When `exact` is set, the operation fails unless every record of
    /// `other` is present in `self`. The returned slab may be empty,
    /// meaning the entire RRset was removed.
    pub fn subtract(&self, other: &Self, exact: bool) -> Result<Self, SlabError> {
        if exact {
            for rdata in other.iter() {
                if !self.contains(rdata) {
                    return Err(SlabError::NotExact);
                }
            }
        }
        let mut remaining = Self::new();
        for rdata in self.iter() {
            if !other.contains(rdata) {
                remaining.push(rdata);
            }
        }
        Ok(remaining)
    }

    /// Returns whether `self` and `other` hold the same set of records,
    /// irrespective of order.
    pub fn set_equal(&self, other: &Self) -> bool {
        self.count() == other.count() && self.iter().all(|rdata| other.contains(rdata))
    }
}

impl<'a> FromIterator<&'a Rdata> for RdataSlab {
    fn from_iter<I: IntoIterator<Item = &'a Rdata>>(rdatas: I) -> Self {
        let mut slab = Self::new();
        for rdata in rdatas {
            slab.push(rdata);
        }
        slab
    }
}

impl PartialEq for RdataSlab {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for RdataSlab {}

impl fmt::Debug for RdataSlab {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut list = f.debug_list();
        for rdata in self.iter() {
            list.entry(&format_args!("{:?}", rdata));
        }
        list.finish()
    }
}

////////////////////////////////////////////////////////////////////////
// SLAB ITERATION                                                     //
////////////////////////////////////////////////////////////////////////

/// An iterator over the [`Rdata`] of an [`RdataSlab`].
pub struct Iter<'a> {
    cursor: &'a [u8],
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Rdata;

    fn next(&mut self) -> Option<Self::Item> {
        let len_octets: &[u8; 2] = self.cursor.get(0..2)?.try_into().ok()?;
        let len = u16::from_ne_bytes(*len_octets) as usize;
        if let Some(rdata) = self.cursor.get(2..len + 2) {
            self.cursor = &self.cursor[len + 2..];
            Some(Rdata::from_unchecked(rdata))
        } else {
            None
        }
    }
}

impl FusedIterator for Iter<'_> {}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise when constructing or combining [`RdataSlab`]s.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SlabError {
    /// RDATA was longer than 65,535 octets.
    RdataTooLong,
    /// An exact merge or subtraction found the slabs in an unexpected
    /// state (a duplicate record on merge; a missing record on
    /// subtraction).
    NotExact,
}

impl fmt::Display for SlabError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RdataTooLong => f.write_str("RDATA was longer than 65,535 octets"),
            Self::NotExact => f.write_str("the slabs do not permit an exact merge or subtraction"),
        }
    }
}

impl std::error::Error for SlabError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
