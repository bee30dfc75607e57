//! Wire protocol between locations and the canopy host
//!
//! Wire format (JSON when it crosses a process boundary):
//!
//! Requester → owner (fetch):
//!   { "type": "fetch", "key": 9, "requester": 1 }
//!
//! Owner → requester (bundle; requested node plus `bundle_depth` levels):
//!   { "type": "bundle", "source": 0, "entries": [[9, {..}], [72, {..}], ...],
//!     "particles": [..], "leaf_counts": [3, 0, ...] }
//!
//! Canopy → requester (aggregate only):
//!   { "type": "summary", "key": 2, "snapshot": { "data": {..}, "n_particles": 10, .. } }
//!
//! Owned root or completed vertex → parent canopy vertex:
//!   { "type": "contribution", "key": 8, "snapshot": { .. } }
//!
//! The starter pack (sorted canopy entries) travels with the load-cache
//! command rather than as a wire message.

use crate::data::Data;
use crate::error::Result;
use crate::types::{Key, LocationId, Particle};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Detached snapshot
// ---------------------------------------------------------------------------

/// A node without its pointer graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(bound = "D: Data")]
pub struct Snapshot<D> {
    pub data: D,
    pub n_particles: usize,
    pub is_leaf: bool,
    pub depth: usize,
}

impl<D: Data> Snapshot<D> {
    pub fn new(data: D, n_particles: usize, is_leaf: bool, depth: usize) -> Self {
        Self {
            data,
            n_particles,
            is_leaf,
            depth,
        }
    }

    /// Identity for canopy accumulation.
    pub fn empty() -> Self {
        Self::new(D::default(), 0, false, 0)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub key: Key,
    pub requester: LocationId,
}

impl FetchRequest {
    pub fn new(key: Key, requester: LocationId) -> Self {
        Self { key, requester }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Fetch response: the requested node and a bounded number of levels below
/// it, in breadth-first order. Leaf entries own a run of `particles`, in
/// entry order, of length given by the matching `leaf_counts` element.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: Data")]
pub struct Bundle<D> {
    pub source: LocationId,
    pub entries: Vec<(Key, Snapshot<D>)>,
    pub particles: Vec<Particle>,
    pub leaf_counts: Vec<usize>,
}

impl<D: Data> Bundle<D> {
    pub fn new(source: LocationId) -> Self {
        Self {
            source,
            entries: Vec::new(),
            particles: Vec::new(),
            leaf_counts: Vec::new(),
        }
    }

    pub fn top_key(&self) -> Option<Key> {
        self.entries.first().map(|(k, _)| *k)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upper bound on entries for a bundle spanning `depth` levels below
    /// the requested node: `1 + B + ... + B^depth`.
    pub fn max_entries(branch_factor: usize, depth: usize) -> usize {
        (0..=depth).map(|l| branch_factor.pow(l as u32)).sum()
    }
}

/// Aggregate-only value for one canopy vertex.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: Data")]
pub struct CanopySummary<D> {
    pub key: Key,
    pub snapshot: Snapshot<D>,
}

impl<D: Data> CanopySummary<D> {
    pub fn new(key: Key, snapshot: Snapshot<D>) -> Self {
        Self { key, snapshot }
    }
}

/// Bulk canopy broadcast, sorted by key so parents precede children.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(bound = "D: Data")]
pub struct StarterPack<D> {
    pub entries: Vec<(Key, Snapshot<D>)>,
}

impl<D: Data> StarterPack<D> {
    pub fn new(mut entries: Vec<(Key, Snapshot<D>)>) -> Self {
        entries.sort_by_key(|(k, _)| *k);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Destination of a wire message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Location(LocationId),
    /// Host of the canopy vertices and the global collector.
    Canopy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", bound = "D: Data")]
pub enum Wire<D> {
    /// Ask the owner of `key` for a bundle.
    Fetch(FetchRequest),
    /// Ask the canopy vertex at `key` for data.
    CanopyFetch(FetchRequest),
    Bundle(Bundle<D>),
    Summary(CanopySummary<D>),
    /// An owned root (or completed vertex) reporting to its parent vertex.
    Contribution(CanopySummary<D>),
}

impl<D: Data> Wire<D> {
    pub fn kind(&self) -> &'static str {
        match self {
            Wire::Fetch(_) => "fetch",
            Wire::CanopyFetch(_) => "canopy_fetch",
            Wire::Bundle(_) => "bundle",
            Wire::Summary(_) => "summary",
            Wire::Contribution(_) => "contribution",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}
