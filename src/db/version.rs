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

//! Transaction versions.
//!
//! Every mutation of a zone database happens inside a version: a
//! transaction snapshot identified by a monotonically increasing
//! [`Serial`]. At most one *writer* version is open at a time; any
//! number of reader versions may be open concurrently, each pinned to
//! the serial that was current when it was opened. The database keeps
//! the minimum serial among open versions — the *least serial* — as
//! the garbage-collection horizon: header snapshots older than it can
//! be reclaimed, snapshots at or above it cannot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::node::Node;
use super::store::Db;

////////////////////////////////////////////////////////////////////////
// SERIALS                                                            //
////////////////////////////////////////////////////////////////////////

/// A transaction-version number. Serials increase monotonically over
/// the lifetime of a database and are never reused.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Serial(u64);

impl Serial {
    /// The serial of a database's initial version. Cache databases,
    /// which are unversioned, store all their headers at this serial.
    pub(super) const FIRST: Serial = Serial(1);

    /// The serial used for all cache headers.
    pub(super) const CACHE: Serial = Serial(1);

    pub(super) fn next(self) -> Serial {
        Serial(self.0.checked_add(1).unwrap())
    }
}

impl From<Serial> for u64 {
    fn from(serial: Serial) -> u64 {
        serial.0
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////
// VERSIONS                                                           //
////////////////////////////////////////////////////////////////////////

/// A node touched by a writer version, remembered so that commit and
/// rollback can find everything the transaction changed without a full
/// database scan. Each record holds one node reference, released when
/// the record is processed.
pub(super) struct Changed {
    pub node: Arc<Node>,

    /// Whether the change created a new snapshot on top of an older
    /// one. Dirty records must be kept until the version becomes the
    /// GC horizon; clean ones (pure insertions) can be processed as
    /// soon as the version commits.
    pub dirty: bool,
}

/// The mutable state of a [`Version`], a leaf lock in the hierarchy:
/// it is taken while holding a shard lock (recording a change) or the
/// database-wide lock (committing), and nothing is acquired under it.
pub(super) struct VersionState {
    /// Cleared if the transaction suffers a failure that makes
    /// committing unsafe. Commit asserts this flag.
    pub commit_ok: bool,

    pub changed: Vec<Changed>,
}

/// One transaction snapshot.
pub(super) struct Version {
    pub serial: Serial,

    /// Whether this version is an open writer transaction. Cleared
    /// when the version is promoted to current at commit.
    pub writer: AtomicBool,

    /// The number of handles (and, for the current version, the
    /// database's own reference) keeping this version open.
    pub references: AtomicU32,

    pub state: Mutex<VersionState>,
}

impl Version {
    pub fn new(serial: Serial, references: u32, writer: bool) -> Self {
        Self {
            serial,
            writer: AtomicBool::new(writer),
            references: AtomicU32::new(references),
            state: Mutex::new(VersionState {
                commit_ok: true,
                changed: Vec::new(),
            }),
        }
    }

    pub fn is_writer(&self) -> bool {
        self.writer.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Version")
            .field("serial", &self.serial)
            .field("writer", &self.is_writer())
            .field("references", &self.references.load(Ordering::Relaxed))
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////
// PUBLIC VERSION HANDLES                                             //
////////////////////////////////////////////////////////////////////////

/// A handle to a committed version, pinning its snapshot for reading.
///
/// While a `ReadVersion` is open, the snapshots it can see are
/// protected from reclamation. Cloning attaches another reference;
/// dropping the last handle releases the snapshot and lets the
/// database advance its garbage-collection horizon.
pub struct ReadVersion {
    pub(super) db: Db,
    pub(super) version: Arc<Version>,
}

impl ReadVersion {
    /// Returns the serial of the pinned snapshot.
    pub fn serial(&self) -> u64 {
        self.version.serial.into()
    }
}

impl Clone for ReadVersion {
    fn clone(&self) -> Self {
        let previous = self.version.references.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0);
        Self {
            db: self.db.clone(),
            version: self.version.clone(),
        }
    }
}

impl Drop for ReadVersion {
    fn drop(&mut self) {
        self.db.close_version_impl(self.version.clone(), false);
    }
}

impl fmt::Debug for ReadVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("ReadVersion").field(&self.version).finish()
    }
}

/// A handle to the open writer transaction.
///
/// The transaction ends when the handle is passed to
/// [`Db::close_version`], which commits or rolls back as requested.
/// Dropping the handle without closing it rolls the transaction back.
pub struct WriteVersion {
    pub(super) db: Db,
    pub(super) version: Option<Arc<Version>>,
}

impl WriteVersion {
    /// Returns the serial this transaction will commit as.
    pub fn serial(&self) -> u64 {
        self.version().serial.into()
    }

    pub(super) fn version(&self) -> &Arc<Version> {
        self.version.as_ref().unwrap()
    }

    /// Takes the version out for closing.
    pub(super) fn take(mut self) -> Arc<Version> {
        self.version.take().unwrap()
    }
}

impl Drop for WriteVersion {
    fn drop(&mut self) {
        if let Some(version) = self.version.take() {
            self.db.close_version_impl(version, false);
        }
    }
}

impl fmt::Debug for WriteVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("WriteVersion").field(self.version()).finish()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serials_are_ordered_and_monotonic() {
        let first = Serial::FIRST;
        let second = first.next();
        assert!(first < second);
        assert_eq!(u64::from(second), 2);
    }
}
