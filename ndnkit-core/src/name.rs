//! Names: ordered sequences of opaque binary components.
//!
//! A component may carry an unsigned integer tagged with a one-byte marker
//! (`marker ++ big-endian bytes`, as few bytes as needed, zero encodes as the
//! bare marker). Segments, sequence numbers, publisher ids and announcement
//! actions all use this encoding.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Marker for a segment number of fragmented content.
pub const SEGMENT_MARKER: u8 = 0x00;
/// Marker for a pub/sub message sequence number.
pub const SEQUENCE_MARKER: u8 = 0xFE;
/// Marker for a pub/sub publisher id.
pub const PUBLISHER_ID_MARKER: u8 = 0x50;
/// Marker for an announcement action (entrance / exit).
pub const ACTION_MARKER: u8 = 0x41;

const MAX_NUMBER_LEN: usize = 8;

/// Error decoding a marker-tagged number from a component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarkerError {
    #[error("component does not start with marker {0:#04x}")]
    WrongMarker(u8),
    #[error("number after marker is {0} bytes, more than 8")]
    TooLong(usize),
}

/// One name component.
///
/// Ordering is the canonical one: shorter components sort first, equal
/// lengths compare byte-wise. This keeps marker-encoded numbers in numeric
/// order (`seq 255 < seq 256`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Component(Vec<u8>);

impl Component {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Component(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode `number` behind `marker`.
    pub fn from_marked_number(marker: u8, number: u64) -> Self {
        let mut out = Vec::with_capacity(1 + MAX_NUMBER_LEN);
        out.push(marker);
        let bytes = number.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.extend_from_slice(&bytes[skip..]);
        Component(out)
    }

    /// Decode the number behind `marker`.
    pub fn to_marked_number(&self, marker: u8) -> Result<u64, MarkerError> {
        match self.0.split_first() {
            Some((&m, rest)) if m == marker => {
                if rest.len() > MAX_NUMBER_LEN {
                    return Err(MarkerError::TooLong(rest.len()));
                }
                Ok(rest.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
            }
            _ => Err(MarkerError::WrongMarker(marker)),
        }
    }

    pub fn is_marked(&self, marker: u8) -> bool {
        self.0.first() == Some(&marker)
    }

    pub fn segment(id: u64) -> Self {
        Self::from_marked_number(SEGMENT_MARKER, id)
    }

    pub fn sequence(seq: u64) -> Self {
        Self::from_marked_number(SEQUENCE_MARKER, seq)
    }

    pub fn publisher_id(id: u64) -> Self {
        Self::from_marked_number(PUBLISHER_ID_MARKER, id)
    }

    pub fn action(action: u64) -> Self {
        Self::from_marked_number(ACTION_MARKER, action)
    }

    fn write_escaped(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|&b| b == b'.') {
            // "", ".", ".." would collide with path syntax.
            f.write_str("...")?;
            for _ in &self.0 {
                f.write_str(".")?;
            }
            return Ok(());
        }
        for &b in &self.0 {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "%{:02X}", b)?;
            }
        }
        Ok(())
    }

    fn parse_escaped(s: &str) -> Result<Self, NameParseError> {
        let bytes = s.as_bytes();
        if bytes.len() >= 3 && bytes.iter().all(|&b| b == b'.') {
            return Ok(Component(vec![b'.'; bytes.len() - 3]));
        }
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%' {
                let hex = s
                    .get(i + 1..i + 3)
                    .ok_or_else(|| NameParseError::BadEscape(s.to_string()))?;
                let b = u8::from_str_radix(hex, 16)
                    .map_err(|_| NameParseError::BadEscape(s.to_string()))?;
                out.push(b);
                i += 3;
            } else {
                out.push(bytes[i]);
                i += 1;
            }
        }
        Ok(Component(out))
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&str> for Component {
    fn from(s: &str) -> Self {
        Component(s.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Component {
    fn from(v: Vec<u8>) -> Self {
        Component(v)
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_escaped(f)
    }
}

/// Error parsing a name from its URI form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameParseError {
    #[error("bad percent escape in component {0:?}")]
    BadEscape(String),
}

/// Immutable, ordered sequence of components.
///
/// Names order component by component; a proper prefix sorts before any
/// longer name it prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Name {
    components: Vec<Component>,
}

impl Name {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_components(components: Vec<Component>) -> Self {
        Name { components }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Component> {
        self.components.get(i)
    }

    pub fn last(&self) -> Option<&Component> {
        self.components.last()
    }

    /// Returns a new name with `component` appended.
    pub fn append(&self, component: impl Into<Component>) -> Name {
        let mut components = self.components.clone();
        components.push(component.into());
        Name { components }
    }

    /// Returns a new name with all of `other`'s components appended.
    pub fn join(&self, other: &Name) -> Name {
        let mut components = self.components.clone();
        components.extend(other.components.iter().cloned());
        Name { components }
    }

    pub fn append_segment(&self, id: u64) -> Name {
        self.append(Component::segment(id))
    }

    pub fn append_sequence(&self, seq: u64) -> Name {
        self.append(Component::sequence(seq))
    }

    pub fn append_publisher_id(&self, id: u64) -> Name {
        self.append(Component::publisher_id(id))
    }

    /// First `n` components (all of them when `n >= len`).
    pub fn prefix(&self, n: usize) -> Name {
        Name {
            components: self.components[..n.min(self.components.len())].to_vec(),
        }
    }

    /// The name without its last component.
    pub fn parent(&self) -> Name {
        self.prefix(self.components.len().saturating_sub(1))
    }

    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.components.len() <= other.components.len()
            && self.components.iter().zip(&other.components).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for c in &self.components {
            f.write_str("/")?;
            c.write_escaped(f)?;
        }
        Ok(())
    }
}

impl FromStr for Name {
    type Err = NameParseError;

    /// Parse `/a/b%00`. Empty segments (`//`) are skipped, like a URI path.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("ndn:").unwrap_or(s);
        let components = s
            .split('/')
            .filter(|part| !part.is_empty())
            .map(Component::parse_escaped)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Name { components })
    }
}

impl From<Vec<Component>> for Name {
    fn from(components: Vec<Component>) -> Self {
        Name { components }
    }
}
