//! Request and response packets and their selectors.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::name::{Component, MarkerError, Name, SEGMENT_MARKER};

/// Lifetime applied to requests built with [`Request::new`].
pub const DEFAULT_LIFETIME: Duration = Duration::from_millis(4000);

/// Which child of the matched prefix a request prefers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChildSelector {
    #[default]
    None,
    Leftmost,
    Rightmost,
}

/// A named request plus selectors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub name: Name,
    pub child_selector: ChildSelector,
    pub must_be_fresh: bool,
    /// Components to exclude after the prefix. Carried on the wire; lookups
    /// that see it report no match.
    pub exclude: Option<Vec<Component>>,
    pub min_suffix_components: Option<u32>,
    pub max_suffix_components: Option<u32>,
    pub lifetime: Duration,
}

impl Request {
    pub fn new(name: Name) -> Self {
        Self {
            name,
            child_selector: ChildSelector::None,
            must_be_fresh: false,
            exclude: None,
            min_suffix_components: None,
            max_suffix_components: None,
            lifetime: DEFAULT_LIFETIME,
        }
    }

    pub fn with_child_selector(mut self, selector: ChildSelector) -> Self {
        self.child_selector = selector;
        self
    }

    pub fn with_must_be_fresh(mut self, fresh: bool) -> Self {
        self.must_be_fresh = fresh;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Duration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<Component>) -> Self {
        self.exclude = Some(exclude);
        self
    }

    pub fn has_selectors(&self) -> bool {
        self.child_selector != ChildSelector::None || self.has_unsupported_selectors()
    }

    /// Exclusion and suffix-count selectors have no resolution algorithm here.
    pub fn has_unsupported_selectors(&self) -> bool {
        self.exclude.is_some()
            || self.min_suffix_components.is_some()
            || self.max_suffix_components.is_some()
    }

    /// Selector-aware match used by pending tables: exact name when no
    /// selector is set, prefix otherwise.
    pub fn matches(&self, name: &Name) -> bool {
        if self.has_selectors() {
            self.name.is_prefix_of(name)
        } else {
            self.name == *name
        }
    }

    /// Transport-level match: a response satisfies a request whose name
    /// prefixes it (`/file` is answered by `/file/%00%00`).
    pub fn accepts(&self, name: &Name) -> bool {
        self.name.is_prefix_of(name)
    }
}

/// How long a response stays fresh after it is produced or cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Freshness {
    Period(Duration),
    #[default]
    Infinite,
}

impl Freshness {
    pub fn is_fresh(&self, stored_at: Instant, now: Instant) -> bool {
        match self {
            Freshness::Infinite => true,
            Freshness::Period(p) => now.saturating_duration_since(stored_at) < *p,
        }
    }
}

/// A named response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Response {
    pub name: Name,
    pub content: Vec<u8>,
    pub freshness: Freshness,
    /// Last valid segment of a fragmented resource, segment-marker encoded.
    pub final_segment: Option<Component>,
}

impl Response {
    pub fn new(name: Name, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name,
            content: content.into(),
            freshness: Freshness::Infinite,
            final_segment: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_final_segment(mut self, id: u64) -> Self {
        self.final_segment = Some(Component::segment(id));
        self
    }

    /// Decoded `final_segment`, if present.
    pub fn final_segment_id(&self) -> Result<Option<u64>, MarkerError> {
        self.final_segment
            .as_ref()
            .map(|c| c.to_marked_number(SEGMENT_MARKER))
            .transpose()
    }
}

/// Anything a face carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Request(Request),
    Response(Response),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn plain_request_matches_exact_only() {
        let r = Request::new(name("/a/b"));
        assert!(r.matches(&name("/a/b")));
        assert!(!r.matches(&name("/a/b/c")));
        assert!(r.accepts(&name("/a/b/c")));
        assert!(!r.accepts(&name("/a")));
    }

    #[test]
    fn selector_request_matches_prefix() {
        let r = Request::new(name("/a")).with_child_selector(ChildSelector::Rightmost);
        assert!(r.matches(&name("/a/b")));
        assert!(r.matches(&name("/a")));
        assert!(!r.matches(&name("/b")));
    }

    #[test]
    fn unsupported_selectors_detected() {
        let r = Request::new(name("/a"));
        assert!(!r.has_unsupported_selectors());
        assert!(r.clone().with_exclude(vec![]).has_unsupported_selectors());
        let mut r = r;
        r.max_suffix_components = Some(1);
        assert!(r.has_unsupported_selectors());
    }

    #[test]
    fn final_segment_decoding() {
        let r = Response::new(name("/a"), b"x".to_vec()).with_final_segment(9);
        assert_eq!(r.final_segment_id(), Ok(Some(9)));
        let mut bad = r.clone();
        bad.final_segment = Some(Component::from("x"));
        assert!(bad.final_segment_id().is_err());
        assert_eq!(Response::new(name("/a"), vec![]).final_segment_id(), Ok(None));
    }

    #[test]
    fn freshness_period() {
        let t0 = Instant::now();
        let f = Freshness::Period(Duration::from_millis(100));
        assert!(f.is_fresh(t0, t0));
        assert!(!f.is_fresh(t0, t0 + Duration::from_millis(100)));
        assert!(Freshness::Infinite.is_fresh(t0, t0 + Duration::from_secs(3600)));
    }
}
