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

//! Implementation of data structures related to domain names.
//!
//! The database indexes records by owner name, so this module provides
//! the [`Label`], [`LabelBuf`], and [`Name`] types. In accordance with
//! [RFC 1034 § 3.1], comparisons and hashing are ASCII-case-insensitive
//! while case is preserved in the internal representation.
//!
//! [RFC 1034 § 3.1]: https://tools.ietf.org/html/rfc1034#section-3.1

use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, Index};
use std::str::FromStr;

use arrayvec::ArrayVec;

/// The maximum number of labels in a domain name (excluding the null
/// root label).
const MAX_N_LABELS: usize = 127;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length on the wire).
const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// LABELS                                                             //
////////////////////////////////////////////////////////////////////////

/// The label given to a node in the Domain Name System's tree
/// structure.
///
/// `Label` is essentially a wrapper over `[u8]` that can only be
/// constructed if the slice is a valid DNS label (that is, if it is no
/// more than 63 octets long). It is the borrowed counterpart of
/// [`LabelBuf`].
#[repr(transparent)]
pub struct Label {
    octets: [u8],
}

#[allow(clippy::len_without_is_empty)] // Following DNS terminology, we have is_null().
impl Label {
    /// Returns the asterisk label `*`, which has a special meaning in
    /// the DNS lookup process.
    pub fn asterisk() -> &'static Self {
        static ASTERISK_LABEL: &[u8; 1] = b"*";
        Self::from_unchecked(ASTERISK_LABEL)
    }

    /// Wraps up a `&[u8]` as a `Label` without checking its length for
    /// validity. To be used only within this module, and only after
    /// performing the length check manually.
    fn from_unchecked(octets: &[u8]) -> &Self {
        unsafe { &*(octets as *const [u8] as *const Label) }
    }

    /// Returns whether this `Label` is the asterisk label.
    pub fn is_asterisk(&self) -> bool {
        self == Self::asterisk()
    }

    /// Returns whether this `Label` is the null (zero-length) label.
    pub fn is_null(&self) -> bool {
        self.octets.is_empty()
    }

    /// Returns the number of octets in this `Label`.
    pub fn len(&self) -> usize {
        self.octets.len()
    }

    /// Returns the octets of this `Label`.
    pub fn octets(&self) -> &[u8] {
        &self.octets
    }
}

impl<'a> TryFrom<&'a [u8]> for &'a Label {
    type Error = Error;

    fn try_from(octets: &'a [u8]) -> Result<Self, Error> {
        if octets.len() > MAX_LABEL_LEN {
            Err(Error::LabelTooLong)
        } else {
            Ok(Label::from_unchecked(octets))
        }
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for &'a Label {
    fn from(octets: &'a [u8; N]) -> Self {
        // A compile-time check would be nicer, but stable Rust cannot
        // express it yet.
        assert!(N <= MAX_LABEL_LEN);
        Label::from_unchecked(octets)
    }
}

impl PartialEq for Label {
    fn eq(&self, other: &Self) -> bool {
        self.octets.eq_ignore_ascii_case(&other.octets)
    }
}

impl Eq for Label {}

impl Hash for Label {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for &octet in &self.octets {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for &octet in &self.octets {
            if octet.is_ascii_graphic() && octet != b'.' && octet != b'\\' {
                write!(f, "{}", octet as char)?;
            } else {
                write!(f, "\\{:03}", octet)?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

////////////////////////////////////////////////////////////////////////
// OWNED LABELS                                                       //
////////////////////////////////////////////////////////////////////////

/// The owned counterpart of [`Label`].
///
/// The label octets are stored inline (an [`ArrayVec`]), so no heap
/// allocation is needed per label.
#[derive(Clone)]
pub struct LabelBuf {
    octets: ArrayVec<u8, MAX_LABEL_LEN>,
}

impl LabelBuf {
    /// Returns a borrowed [`Label`] view of this `LabelBuf`.
    pub fn as_label(&self) -> &Label {
        Label::from_unchecked(&self.octets)
    }
}

impl TryFrom<&[u8]> for LabelBuf {
    type Error = Error;

    fn try_from(octets: &[u8]) -> Result<Self, Error> {
        ArrayVec::try_from(octets)
            .map(|octets| Self { octets })
            .or(Err(Error::LabelTooLong))
    }
}

impl From<&Label> for LabelBuf {
    fn from(label: &Label) -> Self {
        Self {
            octets: label.octets().try_into().unwrap(),
        }
    }
}

impl Deref for LabelBuf {
    type Target = Label;

    fn deref(&self) -> &Label {
        self.as_label()
    }
}

impl Borrow<Label> for LabelBuf {
    fn borrow(&self) -> &Label {
        self.as_label()
    }
}

impl PartialEq for LabelBuf {
    fn eq(&self, other: &Self) -> bool {
        self.as_label() == other.as_label()
    }
}

impl Eq for LabelBuf {}

impl Hash for LabelBuf {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_label().hash(state)
    }
}

impl fmt::Debug for LabelBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.as_label().fmt(f)
    }
}

////////////////////////////////////////////////////////////////////////
// NAMES                                                              //
////////////////////////////////////////////////////////////////////////

/// A structure to represent an absolute domain name.
///
/// A `Name` is a sequence of up to 127 [`Label`]s. Label 0 is the
/// leftmost (most specific) label; the implicit null root label is not
/// stored. Thus the root name itself has [`len`](Name::len) zero.
///
/// `Name`s are constructed through the [`FromStr`] implementation,
/// which accepts the usual presentation format with a terminating dot
/// (e.g. `www.example.`), or by [`Name::parent`] and
/// [`Name::concat_label`].
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct Name {
    labels: Vec<LabelBuf>,
}

#[allow(clippy::len_without_is_empty)] // The root name is not "empty."
impl Name {
    /// Returns the root name `.`.
    pub fn root() -> Self {
        Self { labels: Vec::new() }
    }

    /// Returns the number of labels in this `Name`, not counting the
    /// implicit null root label.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Returns whether this is the root name.
    pub fn is_root(&self) -> bool {
        self.labels.is_empty()
    }

    /// Returns label `n` of this `Name`. Label 0 is the leftmost (most
    /// specific) label.
    pub fn label(&self, n: usize) -> &Label {
        self.labels[n].as_label()
    }

    /// Returns an iterator over the labels of this `Name`, from the
    /// leftmost (most specific) to the rightmost.
    pub fn labels(&self) -> impl DoubleEndedIterator<Item = &Label> + '_ {
        self.labels.iter().map(LabelBuf::as_label)
    }

    /// Returns the parent of this `Name` (that is, the name with the
    /// leftmost label removed), or `None` for the root name.
    pub fn parent(&self) -> Option<Self> {
        if self.labels.is_empty() {
            None
        } else {
            Some(Self {
                labels: self.labels[1..].to_vec(),
            })
        }
    }

    /// Returns the name formed by prepending `label` to this `Name`.
    pub fn concat_label(&self, label: &Label) -> Result<Self, Error> {
        if self.labels.len() + 1 > MAX_N_LABELS {
            return Err(Error::TooManyLabels);
        }
        let mut labels = Vec::with_capacity(self.labels.len() + 1);
        labels.push(LabelBuf::from(label));
        labels.extend_from_slice(&self.labels);
        Ok(Self { labels })
    }

    /// Returns whether this `Name` equals `other` or is a subdomain of
    /// it.
    pub fn eq_or_subdomain_of(&self, other: &Self) -> bool {
        if self.len() < other.len() {
            return false;
        }
        self.labels()
            .rev()
            .zip(other.labels().rev())
            .all(|(a, b)| a == b)
    }

    /// Returns whether this `Name` is a wildcard domain name, i.e.
    /// whether its leftmost label is the asterisk label.
    pub fn is_wildcard(&self) -> bool {
        self.labels.first().map_or(false, |l| l.is_asterisk())
    }
}

impl Index<usize> for Name {
    type Output = Label;

    fn index(&self, n: usize) -> &Label {
        self.label(n)
    }
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        if text == "." {
            return Ok(Self::root());
        }
        let stripped = text.strip_suffix('.').ok_or(Error::NotAbsolute)?;
        if stripped.is_empty() {
            return Err(Error::EmptyLabel);
        }
        let mut labels = Vec::new();
        for piece in stripped.split('.') {
            if piece.is_empty() {
                return Err(Error::EmptyLabel);
            }
            labels.push(LabelBuf::try_from(piece.as_bytes())?);
        }
        if labels.len() > MAX_N_LABELS {
            return Err(Error::TooManyLabels);
        }
        Ok(Self { labels })
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            f.write_str(".")
        } else {
            for label in self.labels() {
                write!(f, "{}.", label)?;
            }
            Ok(())
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise when constructing [`Label`]s and [`Name`]s.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    LabelTooLong,
    EmptyLabel,
    TooManyLabels,
    NotAbsolute,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::LabelTooLong => f.write_str("labels may contain at most 63 octets"),
            Self::EmptyLabel => f.write_str("empty labels are not allowed"),
            Self::TooManyLabels => f.write_str("names may contain at most 127 labels"),
            Self::NotAbsolute => f.write_str("names must end with the root label"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_compare_case_insensitively() {
        let upper: &Label = b"EXAMPLE".into();
        let lower: &Label = b"example".into();
        assert_eq!(upper, lower);
    }

    #[test]
    fn label_rejects_overlong_slices() {
        let long = [b'a'; 64];
        assert_eq!(<&Label>::try_from(&long[..]), Err(Error::LabelTooLong));
    }

    #[test]
    fn name_parsing_works() {
        let name: Name = "www.example.test.".parse().unwrap();
        assert_eq!(name.len(), 3);
        assert_eq!(&name[0], <&Label>::from(b"www"));
        assert_eq!(&name[2], <&Label>::from(b"test"));
    }

    #[test]
    fn name_parsing_rejects_relative_names() {
        assert_eq!("www.example".parse::<Name>(), Err(Error::NotAbsolute));
    }

    #[test]
    fn name_parsing_rejects_empty_labels() {
        assert_eq!("www..test.".parse::<Name>(), Err(Error::EmptyLabel));
    }

    #[test]
    fn root_name_works() {
        let root: Name = ".".parse().unwrap();
        assert!(root.is_root());
        assert_eq!(root, Name::root());
        assert_eq!(root.to_string(), ".");
        assert!(root.parent().is_none());
    }

    #[test]
    fn parent_drops_leftmost_label() {
        let name: Name = "www.example.test.".parse().unwrap();
        let parent = name.parent().unwrap();
        assert_eq!(parent, "example.test.".parse().unwrap());
    }

    #[test]
    fn concat_label_prepends() {
        let name: Name = "example.test.".parse().unwrap();
        let child = name.concat_label(b"www".into()).unwrap();
        assert_eq!(child, "www.example.test.".parse().unwrap());
    }

    #[test]
    fn eq_or_subdomain_of_works() {
        let apex: Name = "example.test.".parse().unwrap();
        let www: Name = "www.example.test.".parse().unwrap();
        let other: Name = "example.invalid.".parse().unwrap();
        assert!(apex.eq_or_subdomain_of(&apex));
        assert!(www.eq_or_subdomain_of(&apex));
        assert!(!apex.eq_or_subdomain_of(&www));
        assert!(!other.eq_or_subdomain_of(&apex));
        assert!(www.eq_or_subdomain_of(&Name::root()));
    }

    #[test]
    fn names_compare_case_insensitively() {
        let a: Name = "WWW.Example.Test.".parse().unwrap();
        let b: Name = "www.example.test.".parse().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wildcard_detection_works() {
        let wild: Name = "*.example.test.".parse().unwrap();
        let plain: Name = "www.example.test.".parse().unwrap();
        assert!(wild.is_wildcard());
        assert!(!plain.is_wildcard());
    }
}
