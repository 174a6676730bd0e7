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

//! Provides the [`Trust`] ranking for cached RRsets.

use std::fmt;

////////////////////////////////////////////////////////////////////////
// TRUST LEVELS                                                       //
////////////////////////////////////////////////////////////////////////

/// The credibility of an RRset, following [RFC 2181 § 5.4.1].
///
/// A cache keeps at most one RRset per name and type, so when new data
/// arrives it must decide whether the new data should replace what it
/// already has. The ranking here makes that decision: data is never
/// replaced by data of strictly lower trust (unless the existing data
/// has expired). The variants are ordered from least to most credible,
/// so the derived [`Ord`] gives the ranking directly.
///
/// [RFC 2181 § 5.4.1]: https://datatracker.ietf.org/doc/html/rfc2181#section-5.4.1
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Trust {
    /// Additional-section data from a non-authoritative answer, still
    /// subject to validation.
    PendingAdditional,
    /// Answer-section data from a non-authoritative answer, still
    /// subject to validation.
    PendingAnswer,
    /// Additional-section data.
    Additional,
    /// Glue from a referral.
    Glue,
    /// Answer-section data from a non-authoritative answer.
    Answer,
    /// Authority-section data from an authoritative answer.
    AuthAuthority,
    /// Answer-section data from an authoritative answer.
    AuthAnswer,
    /// Locally configured or loaded data; never overridden.
    Ultimate,
}

impl fmt::Display for Trust {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Self::PendingAdditional => "pending-additional",
            Self::PendingAnswer => "pending-answer",
            Self::Additional => "additional",
            Self::Glue => "glue",
            Self::Answer => "answer",
            Self::AuthAuthority => "authauthority",
            Self::AuthAnswer => "authanswer",
            Self::Ultimate => "ultimate",
        };
        f.write_str(text)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
