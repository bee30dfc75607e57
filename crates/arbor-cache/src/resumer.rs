//! Registry of suspended traversal work keyed by the placeholder it awaits
//!
//! A traversal that reaches a placeholder registers a [`Continuation`] and
//! moves on. When the cache resolves the key it calls [`Resumer::process`],
//! which hands every waiter, in registration order, back to the traversal it
//! came from. Registration checks the resolved set under the same lock, so a
//! key resolved before the traversal got there comes back as
//! [`Registration::Ready`] instead of waiting forever.

use crate::node::Node;
use crate::sync;
use arbor_core::{Data, Key, Result};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

pub type TraversalId = u64;

/// Where a suspended traversal picks up once its key resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeAt {
    /// Evaluate the node at `source` against the continuation's target.
    /// `source` is the awaited key or one of its descendants.
    Evaluate { source: Key },
    /// Dual descent: evaluate the pair once `source` resolves.
    Pair { source: Key, target: Key },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Continuation {
    pub traversal: TraversalId,
    /// Index of the target inside its traversal.
    pub target: usize,
    pub awaited: Key,
    pub resume: ResumeAt,
}

impl Continuation {
    pub fn new(traversal: TraversalId, target: usize, awaited: Key, resume: ResumeAt) -> Self {
        Self {
            traversal,
            target,
            awaited,
            resume,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Registration {
    Waiting,
    /// The key already resolved this iteration; continue immediately.
    Ready(Continuation),
}

/// Receiver of resumed work. Implemented by traversals.
pub trait ResumeSink<D: Data>: Send + Sync {
    fn resume(&self, continuation: Continuation, node: Arc<Node<D>>) -> Result<()>;
}

#[derive(Default)]
struct ResumerState {
    waiting: HashMap<Key, VecDeque<Continuation>>,
    resolved: HashSet<Key>,
}

pub struct Resumer<D: Data> {
    state: Mutex<ResumerState>,
    sinks: DashMap<TraversalId, Weak<dyn ResumeSink<D>>>,
    next_id: AtomicU64,
}

impl<D: Data> Default for Resumer<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Data> Resumer<D> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResumerState::default()),
            sinks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> TraversalId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Route continuations tagged `id` to `sink`.
    pub fn attach(&self, id: TraversalId, sink: Weak<dyn ResumeSink<D>>) {
        self.sinks.insert(id, sink);
    }

    pub fn detach(&self, id: TraversalId) {
        self.sinks.remove(&id);
    }

    pub fn register(&self, continuation: Continuation) -> Registration {
        let mut state = sync::lock(&self.state);
        if state.resolved.contains(&continuation.awaited) {
            return Registration::Ready(continuation);
        }
        debug!(key = %continuation.awaited, traversal = continuation.traversal, "waiting");
        state
            .waiting
            .entry(continuation.awaited)
            .or_default()
            .push_back(continuation);
        Registration::Waiting
    }

    /// Resume everything waiting on `key`, FIFO. Returns how many continuations
    /// were delivered. Waiters are dispatched after the registry lock is
    /// released, so sinks may register again from inside `resume`.
    pub fn process(&self, key: Key, node: Arc<Node<D>>) -> Result<usize> {
        let waiters = {
            let mut state = sync::lock(&self.state);
            state.resolved.insert(key);
            state.waiting.remove(&key).unwrap_or_default()
        };
        let mut delivered = 0;
        for continuation in waiters {
            let sink = self
                .sinks
                .get(&continuation.traversal)
                .and_then(|entry| entry.value().upgrade());
            match sink {
                Some(sink) => {
                    sink.resume(continuation, Arc::clone(&node))?;
                    delivered += 1;
                }
                None => warn!(
                    key = %key,
                    traversal = continuation.traversal,
                    "dropping continuation for a finished traversal"
                ),
            }
        }
        debug!(key = %key, delivered, "processed");
        Ok(delivered)
    }

    pub fn is_resolved(&self, key: Key) -> bool {
        sync::lock(&self.state).resolved.contains(&key)
    }

    /// Continuations currently parked on `key`.
    pub fn waiting_on(&self, key: Key) -> usize {
        sync::lock(&self.state)
            .waiting
            .get(&key)
            .map_or(0, VecDeque::len)
    }

    /// Total continuations parked across all keys.
    pub fn waiting(&self) -> usize {
        sync::lock(&self.state).waiting.values().map(VecDeque::len).sum()
    }

    /// Forget all waiters, resolutions, and sinks. Called between iterations.
    pub fn reset(&self) {
        let mut state = sync::lock(&self.state);
        let stranded: usize = state.waiting.values().map(VecDeque::len).sum();
        if stranded > 0 {
            warn!(stranded, "resetting with parked continuations");
        }
        state.waiting.clear();
        state.resolved.clear();
        drop(state);
        self.sinks.clear();
    }
}
