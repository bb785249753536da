//! Named cache: a component tree of responses with selector-aware lookup.
//!
//! Nodes live in an arena and refer to their parent by index. Every leaf
//! other than the root holds an entry; removing an entry prunes the now-empty
//! path back toward the root.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::name::{Component, Name};
use crate::packet::{ChildSelector, Request, Response};
use crate::segment;

const ROOT: usize = 0;

/// A stored response and when it was inserted.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: Response,
    pub inserted_at: Instant,
    order: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.response.freshness.is_fresh(self.inserted_at, now)
    }
}

#[derive(Debug, Default)]
struct Node {
    component: Option<Component>,
    parent: Option<usize>,
    children: BTreeMap<Component, usize>,
    entry: Option<CacheEntry>,
}

/// Name-keyed store with optional FIFO capacity bound.
///
/// Eviction removes the earliest-inserted entry; reads never refresh it.
/// Re-inserting an existing name counts as a new insertion.
#[derive(Debug)]
pub struct NamedCache {
    nodes: Vec<Node>,
    free: Vec<usize>,
    /// Insertion order -> node holding the entry.
    order: BTreeMap<u64, usize>,
    next_order: u64,
    capacity: Option<usize>,
}

impl NamedCache {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            nodes: vec![Node::default()],
            free: Vec::new(),
            order: BTreeMap::new(),
            next_order: 0,
            capacity,
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn put_content(&mut self, name: Name, content: impl Into<Vec<u8>>) {
        self.put(Response::new(name, content));
    }

    /// Store `response` under its name, evicting the oldest entry when full.
    pub fn put(&mut self, response: Response) {
        let replacing = self
            .find(&response.name)
            .is_some_and(|i| self.nodes[i].entry.is_some());
        if !replacing {
            if let Some(cap) = self.capacity {
                if cap == 0 {
                    debug!(name = %response.name, "zero-capacity cache, not storing");
                    return;
                }
                while self.order.len() >= cap {
                    self.evict_oldest();
                }
            }
        }
        let idx = self.insert_path(&response.name);
        if let Some(old) = self.nodes[idx].entry.take() {
            self.order.remove(&old.order);
        }
        let order = self.next_order;
        self.next_order += 1;
        self.order.insert(order, idx);
        self.nodes[idx].entry = Some(CacheEntry {
            response,
            inserted_at: Instant::now(),
            order,
        });
    }

    pub fn has(&self, request: &Request) -> bool {
        self.get(request).is_some()
    }

    pub fn has_name(&self, name: &Name) -> bool {
        self.get_name(name).is_some()
    }

    /// Exact-name lookup, no selectors.
    pub fn get_name(&self, name: &Name) -> Option<Response> {
        let idx = self.find(name)?;
        self.nodes[idx].entry.as_ref().map(|e| e.response.clone())
    }

    /// Resolve `request` against the tree.
    ///
    /// Without a child selector only an exact entry matches. With one, the
    /// matched node's children are compared by their next component
    /// (greatest for rightmost, smallest for leftmost) and descent continues
    /// the same way until an entry is found.
    pub fn get(&self, request: &Request) -> Option<Response> {
        if request.has_unsupported_selectors() {
            warn!(name = %request.name, "exclude and suffix selectors are not supported");
            return None;
        }
        let mut idx = self.find(&request.name)?;
        if request.child_selector != ChildSelector::None {
            if self.nodes[idx].children.is_empty() {
                return None;
            }
            idx = self.descend(idx, request.child_selector)?;
        }
        let entry = self.nodes[idx].entry.as_ref()?;
        if request.must_be_fresh && !entry.is_fresh(Instant::now()) {
            return None;
        }
        Some(entry.response.clone())
    }

    /// Hand the response for `request` to `emit`, segmenting content larger
    /// than `max_segment_size`. Returns how many responses were emitted.
    pub fn push(
        &self,
        request: &Request,
        max_segment_size: usize,
        mut emit: impl FnMut(Response),
    ) -> Result<usize> {
        let response = self.get(request).ok_or_else(|| Error::DataNotFound {
            name: request.name.clone(),
        })?;
        let segments = segment::segment_response(&response, max_segment_size);
        let count = segments.len();
        for s in segments {
            emit(s);
        }
        Ok(count)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(Node::default());
        self.free.clear();
        self.order.clear();
    }

    fn find(&self, name: &Name) -> Option<usize> {
        let mut idx = ROOT;
        for c in name.components() {
            idx = *self.nodes[idx].children.get(c)?;
        }
        Some(idx)
    }

    fn descend(&self, mut idx: usize, selector: ChildSelector) -> Option<usize> {
        loop {
            let children = &self.nodes[idx].children;
            let next = match selector {
                ChildSelector::Rightmost => children.values().next_back(),
                _ => children.values().next(),
            };
            idx = *next?;
            if self.nodes[idx].entry.is_some() {
                return Some(idx);
            }
        }
    }

    fn insert_path(&mut self, name: &Name) -> usize {
        let mut idx = ROOT;
        for c in name.components() {
            idx = match self.nodes[idx].children.get(c) {
                Some(&child) => child,
                None => {
                    let child = self.alloc(Node {
                        component: Some(c.clone()),
                        parent: Some(idx),
                        ..Node::default()
                    });
                    self.nodes[idx].children.insert(c.clone(), child);
                    child
                }
            };
        }
        idx
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = node;
                i
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn evict_oldest(&mut self) {
        let Some((_, idx)) = self.order.pop_first() else {
            return;
        };
        if let Some(entry) = self.nodes[idx].entry.take() {
            debug!(name = %entry.response.name, "evicting oldest cache entry");
        }
        self.prune(idx);
    }

    fn prune(&mut self, mut idx: usize) {
        while idx != ROOT
            && self.nodes[idx].entry.is_none()
            && self.nodes[idx].children.is_empty()
        {
            let node = std::mem::take(&mut self.nodes[idx]);
            let (Some(parent), Some(component)) = (node.parent, node.component) else {
                break;
            };
            self.nodes[parent].children.remove(&component);
            self.free.push(idx);
            idx = parent;
        }
    }
}

impl Default for NamedCache {
    fn default() -> Self {
        Self::new()
    }
}
