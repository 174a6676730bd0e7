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

//! Provides the [`Timestamp`] structure for wall-clock seconds.

use std::fmt;
use std::ops::Add;
use std::time::{SystemTime, UNIX_EPOCH};

use super::Ttl;

////////////////////////////////////////////////////////////////////////
// TIMESTAMPS                                                         //
////////////////////////////////////////////////////////////////////////

/// A point in time, in whole seconds since the Unix epoch.
///
/// Cache entries expire at absolute times, so the cache-facing database
/// operations take the current time as an explicit `Timestamp`
/// argument rather than reading the system clock themselves. Callers
/// normally pass [`Timestamp::now`], but tests (and callers that batch
/// many operations under a single clock reading) may pass any value.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Returns the current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => Self(elapsed.as_secs()),
            Err(_) => Self(0), // clock before 1970; treat as the epoch
        }
    }

    /// Returns this `Timestamp` moved `secs` seconds earlier,
    /// saturating at the epoch.
    pub fn checked_back(self, secs: u64) -> Self {
        Self(self.0.saturating_sub(secs))
    }

    /// Returns the number of seconds from this `Timestamp` until
    /// `later`, or zero if `later` is not in fact later.
    pub fn until(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl From<u64> for Timestamp {
    fn from(secs: u64) -> Self {
        Self(secs)
    }
}

impl From<Timestamp> for u64 {
    fn from(timestamp: Timestamp) -> Self {
        timestamp.0
    }
}

impl Add<Ttl> for Timestamp {
    type Output = Timestamp;

    fn add(self, ttl: Ttl) -> Timestamp {
        Timestamp(self.0.saturating_add(u32::from(ttl) as u64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_addition_works() {
        let start = Timestamp::from(1_000);
        assert_eq!(start + Ttl::from(300), Timestamp::from(1_300));
    }

    #[test]
    fn checked_back_saturates() {
        assert_eq!(Timestamp::from(100).checked_back(300), Timestamp::from(0));
        assert_eq!(Timestamp::from(500).checked_back(300), Timestamp::from(200));
    }

    #[test]
    fn until_works() {
        let early = Timestamp::from(100);
        let late = Timestamp::from(160);
        assert_eq!(early.until(late), 60);
        assert_eq!(late.until(early), 0);
    }
}
