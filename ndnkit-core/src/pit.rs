//! Pending request table: requests a provider could not answer yet.

use std::time::Instant;

use tracing::debug;

use crate::name::Name;
use crate::packet::Request;

#[derive(Debug, Clone)]
struct PitEntry {
    request: Request,
    arrived_at: Instant,
}

impl PitEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.arrived_at) >= self.request.lifetime
    }
}

/// Holds unanswered requests until a matching response is produced or
/// their lifetime passes. Bounded tables drop the oldest entry when full.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Vec<PitEntry>,
    capacity: Option<usize>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record `request`. An identical request already held is refreshed.
    pub fn add(&mut self, request: Request) {
        self.entries.retain(|e| e.request != request);
        if let Some(cap) = self.capacity {
            if cap == 0 {
                return;
            }
            while self.entries.len() >= cap {
                let dropped = self.entries.remove(0);
                debug!(name = %dropped.request.name, "pending table full, dropping oldest");
            }
        }
        self.entries.push(PitEntry {
            request,
            arrived_at: Instant::now(),
        });
    }

    /// Whether a live request would be satisfied by `name`.
    pub fn has(&self, name: &Name) -> bool {
        let now = Instant::now();
        self.entries
            .iter()
            .any(|e| !e.is_expired(now) && e.request.matches(name))
    }

    /// Remove and return every live request satisfied by `name`.
    /// Expired entries are discarded along the way.
    pub fn extract(&mut self, name: &Name) -> Vec<Request> {
        let now = Instant::now();
        let mut out = Vec::new();
        self.entries.retain(|e| {
            if e.is_expired(now) {
                return false;
            }
            if e.request.matches(name) {
                out.push(e.request.clone());
                return false;
            }
            true
        });
        out
    }

    /// Drop entries whose lifetime has passed. Returns how many went.
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|e| !e.is_expired(now));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
