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

//! Provides the [`Type`] structure for DNS RR types.

use std::fmt;
use std::str::FromStr;

use crate::util::Caseless;

////////////////////////////////////////////////////////////////////////
// RR TYPES                                                           //
////////////////////////////////////////////////////////////////////////

/// Represents the RR type of a DNS record.
///
/// An RR type is represented on the wire as an unsigned 16-bit integer.
/// Hence this is basically a wrapper around `u16` with nice
/// [`Debug`](fmt::Debug), [`Display`](fmt::Display), and [`FromStr`]
/// implementations for working with the common textual representations
/// of RR types. In addition, constants for common RR types (e.g.
/// [`Type::A`]) are provided.
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Type(u16);

impl Type {
    pub const A: Type = Type(1);
    pub const NS: Type = Type(2);
    pub const CNAME: Type = Type(5);
    pub const SOA: Type = Type(6);
    pub const PTR: Type = Type(12);
    pub const MX: Type = Type(15);
    pub const TXT: Type = Type(16);
    pub const SIG: Type = Type(24);
    pub const KEY: Type = Type(25);
    pub const AAAA: Type = Type(28);
    pub const SRV: Type = Type(33);
    pub const DNAME: Type = Type(39);
    pub const DS: Type = Type(43);
    pub const RRSIG: Type = Type(46);
    pub const NSEC: Type = Type(47);
    pub const DNSKEY: Type = Type(48);
    pub const ANY: Type = Type(255);
}

impl Type {
    /// Returns whether records of this type prove or sign the
    /// nonexistence or integrity of other data, and may therefore
    /// coexist with a CNAME record at the same node.
    pub fn may_coexist_with_cname(self) -> bool {
        matches!(self, Self::KEY | Self::SIG | Self::NSEC | Self::RRSIG)
    }
}

impl From<u16> for Type {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

impl From<Type> for u16 {
    fn from(rr_type: Type) -> Self {
        rr_type.0
    }
}

impl FromStr for Type {
    type Err = &'static str;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match Caseless(text) {
            Caseless("A") => Ok(Self::A),
            Caseless("NS") => Ok(Self::NS),
            Caseless("CNAME") => Ok(Self::CNAME),
            Caseless("SOA") => Ok(Self::SOA),
            Caseless("PTR") => Ok(Self::PTR),
            Caseless("MX") => Ok(Self::MX),
            Caseless("TXT") => Ok(Self::TXT),
            Caseless("SIG") => Ok(Self::SIG),
            Caseless("KEY") => Ok(Self::KEY),
            Caseless("AAAA") => Ok(Self::AAAA),
            Caseless("SRV") => Ok(Self::SRV),
            Caseless("DNAME") => Ok(Self::DNAME),
            Caseless("DS") => Ok(Self::DS),
            Caseless("RRSIG") => Ok(Self::RRSIG),
            Caseless("NSEC") => Ok(Self::NSEC),
            Caseless("DNSKEY") => Ok(Self::DNSKEY),
            Caseless("ANY") => Ok(Self::ANY),
            _ => {
                if text
                    .get(0..4)
                    .map_or(false, |prefix| prefix.eq_ignore_ascii_case("TYPE"))
                {
                    text[4..]
                        .parse::<u16>()
                        .map(Self::from)
                        .or(Err("type value is not a valid unsigned 16-bit integer"))
                } else {
                    Err("unknown type")
                }
            }
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", *self)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::A => write!(f, "A"),
            Self::NS => write!(f, "NS"),
            Self::CNAME => write!(f, "CNAME"),
            Self::SOA => write!(f, "SOA"),
            Self::PTR => write!(f, "PTR"),
            Self::MX => write!(f, "MX"),
            Self::TXT => write!(f, "TXT"),
            Self::SIG => write!(f, "SIG"),
            Self::KEY => write!(f, "KEY"),
            Self::AAAA => write!(f, "AAAA"),
            Self::SRV => write!(f, "SRV"),
            Self::DNAME => write!(f, "DNAME"),
            Self::DS => write!(f, "DS"),
            Self::RRSIG => write!(f, "RRSIG"),
            Self::NSEC => write!(f, "NSEC"),
            Self::DNSKEY => write!(f, "DNSKEY"),
            Self::ANY => write!(f, "ANY"),
            Self(value) => write!(f, "TYPE{}", value), // RFC 3597 § 5
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::Type;

    #[test]
    fn displays_according_to_rfc3597() {
        let rr_type = Type::from(0xff00);
        assert_eq!(rr_type.to_string(), "TYPE65280");
    }

    #[test]
    fn parses_according_to_rfc3597() {
        let type_a: Type = "TYPE1".parse().unwrap();
        let type_65280: Type = "TYPE65280".parse().unwrap();
        assert_eq!(type_a, Type::A);
        assert_eq!(u16::from(type_65280), 65280);
    }

    #[test]
    fn cname_coexistence_rules_work() {
        assert!(Type::RRSIG.may_coexist_with_cname());
        assert!(Type::NSEC.may_coexist_with_cname());
        assert!(!Type::A.may_coexist_with_cname());
        assert!(!Type::CNAME.may_coexist_with_cname());
    }
}
