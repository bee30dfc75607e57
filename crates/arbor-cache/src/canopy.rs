//! Canopy roll-up and the iteration-start collector
//!
//! Canopy vertices sit above the owned roots. Each vertex folds in one
//! contribution per child; after the `B`-th it is complete, passes its
//! aggregate to its parent vertex, and starts over. A vertex registered as
//! an owned root instead forwards fetches to its owner.

use crate::sync;
use crate::transport::Transport;
use arbor_core::{
    CanopySummary, Data, Endpoint, FetchRequest, Key, LocationId, Result, Snapshot, StarterPack,
    Wire,
};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

struct Vertex<D: Data> {
    accumulated: Snapshot<D>,
    recv_count: usize,
    owner: Option<LocationId>,
    completed: Option<Snapshot<D>>,
    recipients: HashSet<LocationId>,
    /// Requesters that asked before the roll-up reached this vertex.
    deferred: Vec<LocationId>,
}

impl<D: Data> Default for Vertex<D> {
    fn default() -> Self {
        Self {
            accumulated: Snapshot::empty(),
            recv_count: 0,
            owner: None,
            completed: None,
            recipients: HashSet::new(),
            deferred: Vec::new(),
        }
    }
}

impl<D: Data> Vertex<D> {
    /// Requesters that should receive the completed aggregate now. Each
    /// requester is answered at most once per iteration.
    fn take_recipients(&mut self, requesters: impl IntoIterator<Item = LocationId>) -> Vec<LocationId> {
        let mut out = Vec::new();
        for requester in requesters {
            if self.recipients.insert(requester) {
                out.push(requester);
            }
        }
        out
    }
}

pub struct TreeCanopy<D: Data> {
    branch_factor: usize,
    vertices: DashMap<Key, Vertex<D>>,
    transport: Arc<dyn Transport<D>>,
}

impl<D: Data> TreeCanopy<D> {
    pub fn new(branch_factor: usize, transport: Arc<dyn Transport<D>>) -> Self {
        Self {
            branch_factor,
            vertices: DashMap::new(),
            transport,
        }
    }

    pub fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    /// Mark `key` as an owned root held by `owner`. Survives `reset`.
    pub fn register_owner(&self, key: Key, owner: LocationId) {
        self.vertices.entry(key).or_default().owner = Some(owner);
    }

    pub fn owner(&self, key: Key) -> Option<LocationId> {
        self.vertices.get(&key).and_then(|v| v.owner)
    }

    /// Fold one child contribution into the vertex at `key`. Returns every
    /// vertex this completed, nearest first; completion carries on upward
    /// while parents complete in turn.
    pub fn recv_data(&self, key: Key, child: Snapshot<D>) -> Result<Vec<(Key, Snapshot<D>)>> {
        let mut completed = Vec::new();
        let mut key = key;
        let mut child = child;
        loop {
            let (done, requesters) = {
                let mut vertex = self.vertices.entry(key).or_default();
                vertex.accumulated.data.merge(&child.data);
                vertex.accumulated.n_particles += child.n_particles;
                vertex.accumulated.depth = child.depth.saturating_sub(1);
                vertex.recv_count += 1;
                if vertex.recv_count < self.branch_factor {
                    break;
                }
                let snapshot = std::mem::replace(&mut vertex.accumulated, Snapshot::empty());
                vertex.recv_count = 0;
                vertex.completed = Some(snapshot.clone());
                let deferred = std::mem::take(&mut vertex.deferred);
                let requesters = vertex.take_recipients(deferred);
                (snapshot, requesters)
            };
            debug!(key = %key, n_particles = done.n_particles, "canopy vertex complete");
            for requester in requesters {
                self.send_summary(key, done.clone(), requester)?;
            }
            completed.push((key, done.clone()));
            match key.parent(self.branch_factor) {
                Some(parent) => {
                    key = parent;
                    child = done;
                }
                None => break,
            }
        }
        Ok(completed)
    }

    /// Serve a canopy fetch. Owned roots forward to their owner, which ships
    /// a bundle straight to the requester; aggregates answer directly.
    pub fn request_data(&self, key: Key, requester: LocationId) -> Result<()> {
        let reply = {
            let mut vertex = self.vertices.entry(key).or_default();
            if let Some(owner) = vertex.owner {
                drop(vertex);
                debug!(key = %key, owner, requester, "forwarding fetch to owner");
                return self.transport.send(
                    Endpoint::Location(owner),
                    Wire::Fetch(FetchRequest::new(key, requester)),
                );
            }
            match vertex.completed.clone() {
                Some(snapshot) => {
                    if vertex.take_recipients([requester]).is_empty() {
                        warn!(key = %key, requester, "duplicate canopy request dropped");
                        None
                    } else {
                        Some(snapshot)
                    }
                }
                None => {
                    debug!(key = %key, requester, "canopy request deferred until roll-up");
                    vertex.deferred.push(requester);
                    None
                }
            }
        };
        match reply {
            Some(snapshot) => self.send_summary(key, snapshot, requester),
            None => Ok(()),
        }
    }

    fn send_summary(&self, key: Key, snapshot: Snapshot<D>, requester: LocationId) -> Result<()> {
        self.transport.send(
            Endpoint::Location(requester),
            Wire::Summary(CanopySummary::new(key, snapshot)),
        )
    }

    /// Partial aggregate and contribution count at `key`.
    pub fn pending(&self, key: Key) -> Option<(usize, Snapshot<D>)> {
        self.vertices
            .get(&key)
            .map(|v| (v.recv_count, v.accumulated.clone()))
    }

    /// Aggregate completed this iteration at `key`.
    pub fn completed(&self, key: Key) -> Option<Snapshot<D>> {
        self.vertices.get(&key).and_then(|v| v.completed.clone())
    }

    /// Clear accumulators, completions, and recipients. Ownership stays.
    pub fn reset(&self) {
        for mut vertex in self.vertices.iter_mut() {
            vertex.accumulated = Snapshot::empty();
            vertex.recv_count = 0;
            vertex.completed = None;
            vertex.recipients.clear();
            if !vertex.deferred.is_empty() {
                warn!(key = %vertex.key(), stranded = vertex.deferred.len(), "resetting with deferred requests");
                vertex.deferred.clear();
            }
        }
    }
}

/// Completed canopy vertices gathered for the next starter pack.
pub struct Collector<D: Data> {
    storage: Mutex<BTreeMap<Key, Snapshot<D>>>,
}

impl<D: Data> Default for Collector<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Data> Collector<D> {
    pub fn new() -> Self {
        Self {
            storage: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn recv(&self, key: Key, snapshot: Snapshot<D>) {
        sync::lock(&self.storage).insert(key, snapshot);
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.storage).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest `limit` keys, or everything when `limit` is `None`.
    pub fn starter_pack(&self, limit: Option<usize>) -> StarterPack<D> {
        let storage = sync::lock(&self.storage);
        let take = limit.unwrap_or(storage.len());
        StarterPack::new(
            storage
                .iter()
                .take(take)
                .map(|(k, s)| (*k, s.clone()))
                .collect(),
        )
    }

    /// Exactly the requested keys that the collector holds.
    pub fn select(&self, keys: &[Key]) -> StarterPack<D> {
        let storage = sync::lock(&self.storage);
        StarterPack::new(
            keys.iter()
                .filter_map(|k| storage.get(k).map(|s| (*k, s.clone())))
                .collect(),
        )
    }

    pub fn clear(&self) {
        sync::lock(&self.storage).clear();
    }
}
