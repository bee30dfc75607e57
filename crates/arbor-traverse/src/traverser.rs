//! Traversal engine
//!
//! Work is an explicit stack of (source, target) evaluations. A placeholder
//! on the stack becomes a [`Continuation`] parked in the [`Resumer`]; when
//! the cache resolves the key the continuation comes back through
//! [`ResumeSink::resume`] and the walk picks up from the resolved node.
//!
//! A target finishes once nothing is parked for it. Finishing applies the
//! deferred particle-particle interactions collected during the walk.
//!
//! [`Resumer`]: arbor_cache::Resumer

use crate::visitor::{Opening, Visitor};
use arbor_cache::{
    sync, CacheManager, Continuation, Node, Registration, ResumeAt, ResumeSink, TraversalId,
};
use arbor_core::{Data, Error, Key, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraversalKind {
    /// Every target descends from the root.
    #[default]
    Down,
    /// Every target climbs from its own leaf, descending into the siblings
    /// of each ancestor.
    UpAndDown,
    /// Source and target trees descend together.
    Dual,
}

impl fmt::Display for TraversalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TraversalKind::Down => "down",
            TraversalKind::UpAndDown => "up_and_down",
            TraversalKind::Dual => "dual",
        })
    }
}

impl FromStr for TraversalKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "down" => Ok(TraversalKind::Down),
            "up_and_down" | "up-and-down" => Ok(TraversalKind::UpAndDown),
            "dual" => Ok(TraversalKind::Dual),
            other => Err(Error::config(format!("unknown traversal kind: {other}"))),
        }
    }
}

/// Interaction counters for one traversal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub node_interactions: u64,
    pub leaf_interactions: u64,
    pub opens: u64,
    pub closes: u64,
    pub suspensions: u64,
}

impl AddAssign for Counts {
    fn add_assign(&mut self, other: Counts) {
        self.node_interactions += other.node_interactions;
        self.leaf_interactions += other.leaf_interactions;
        self.opens += other.opens;
        self.closes += other.closes;
        self.suspensions += other.suspensions;
    }
}

enum Work<D> {
    Eval {
        target: usize,
        source: Arc<Node<D>>,
    },
    /// Evaluate whatever sits at `want`, fetching on the way if needed.
    Seek {
        target: usize,
        want: Key,
    },
    /// Everything under `source` except the subtree at `skip`.
    Outside {
        target: usize,
        source: Arc<Node<D>>,
        skip: Key,
    },
    Pair {
        source: Arc<Node<D>>,
        target: Arc<Node<D>>,
    },
}

struct Target<D, O> {
    node: Arc<Node<D>>,
    output: O,
    pending: usize,
    deferred: Vec<Arc<Node<D>>>,
    done: bool,
}

struct State<D, O> {
    targets: Vec<Target<D, O>>,
    index: HashMap<Key, usize>,
    counts: Counts,
    pending: usize,
    completed: usize,
    started: bool,
}

pub struct Traverser<D: Data, V: Visitor<D>> {
    id: TraversalId,
    kind: TraversalKind,
    visitor: Arc<V>,
    cache: Arc<CacheManager<D>>,
    state: Mutex<State<D, V::Output>>,
}

impl<D: Data, V: Visitor<D>> Traverser<D, V> {
    /// Traversal over `targets`. Leaves without particles are skipped.
    pub fn new(
        kind: TraversalKind,
        visitor: Arc<V>,
        cache: Arc<CacheManager<D>>,
        targets: Vec<Arc<Node<D>>>,
    ) -> Arc<Self> {
        let targets: Vec<Target<D, V::Output>> = targets
            .into_iter()
            .filter(|node| node.is_leaf() && node.n_particles() > 0)
            .map(|node| Target {
                output: visitor.output(&node),
                node,
                pending: 0,
                deferred: Vec::new(),
                done: false,
            })
            .collect();
        let index = targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.node.key(), i))
            .collect();
        let id = cache.resumer().next_id();
        let traverser = Arc::new(Self {
            id,
            kind,
            visitor,
            cache,
            state: Mutex::new(State {
                targets,
                index,
                counts: Counts::default(),
                pending: 0,
                completed: 0,
                started: false,
            }),
        });
        let sink: Arc<dyn ResumeSink<D>> = traverser.clone();
        traverser.cache.resumer().attach(id, Arc::downgrade(&sink));
        traverser
    }

    pub fn id(&self) -> TraversalId {
        self.id
    }

    pub fn kind(&self) -> TraversalKind {
        self.kind
    }

    fn state(&self) -> MutexGuard<'_, State<D, V::Output>> {
        sync::lock(&self.state)
    }

    pub fn n_targets(&self) -> usize {
        self.state().targets.len()
    }

    pub fn counts(&self) -> Counts {
        self.state().counts
    }

    /// Continuations still parked in the resumer.
    pub fn pending(&self) -> usize {
        self.state().pending
    }

    pub fn is_complete(&self) -> bool {
        let state = self.state();
        state.started && state.completed == state.targets.len()
    }

    /// Per-target results, in target order.
    pub fn outputs(&self) -> Vec<(Key, V::Output)> {
        self.state()
            .targets
            .iter()
            .map(|t| (t.node.key(), t.output.clone()))
            .collect()
    }

    /// Seed the walk for every target and run until everything left is
    /// parked on a placeholder.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state();
        if state.started {
            warn!(traversal = self.id, "traversal already started");
            return Ok(());
        }
        state.started = true;
        let mut stack = Vec::new();
        match self.kind {
            TraversalKind::Down => {
                let root = self.cache.root()?;
                for target in (0..state.targets.len()).rev() {
                    stack.push(Work::Eval {
                        target,
                        source: Arc::clone(&root),
                    });
                }
            }
            TraversalKind::UpAndDown => {
                for target in (0..state.targets.len()).rev() {
                    self.ascend(&state, target, &mut stack)?;
                }
            }
            TraversalKind::Dual => {
                let root = self.cache.root()?;
                for local in self.cache.local_roots() {
                    stack.push(Work::Pair {
                        source: Arc::clone(&root),
                        target: local,
                    });
                }
            }
        }
        debug!(
            traversal = self.id,
            kind = %self.kind,
            targets = state.targets.len(),
            "traversal started"
        );
        self.run(&mut state, stack)?;
        self.settle(&mut state, None);
        Ok(())
    }

    /// Climb from the target leaf, queueing each ancestor's other children.
    /// Where the visitor stops the climb, the rest of the tree is walked
    /// down from the root around the stop ancestor.
    fn ascend(
        &self,
        state: &State<D, V::Output>,
        target: usize,
        stack: &mut Vec<Work<D>>,
    ) -> Result<()> {
        let b = self.cache.branch_factor();
        let leaf = &state.targets[target].node;
        let mut below = Vec::new();
        let mut child = leaf.key();
        let mut stop = None;
        while let Some(parent) = child.parent(b) {
            for sibling in parent.children(b).filter(|k| *k != child) {
                below.push(Work::Seek {
                    target,
                    want: sibling,
                });
            }
            if let Some(ancestor) = self.cache.lookup(parent)? {
                if !ancestor.is_placeholder()
                    && !parent.is_root()
                    && self.visitor.stop_ascent(&ancestor, leaf)
                {
                    stop = Some(parent);
                    break;
                }
            }
            child = parent;
        }
        below.push(Work::Eval {
            target,
            source: Arc::clone(leaf),
        });
        if let Some(skip) = stop {
            below.push(Work::Outside {
                target,
                source: self.cache.root()?,
                skip,
            });
        }
        stack.extend(below);
        Ok(())
    }

    fn run(&self, state: &mut State<D, V::Output>, mut stack: Vec<Work<D>>) -> Result<()> {
        while let Some(work) = stack.pop() {
            match work {
                Work::Eval { target, source } => self.evaluate(state, target, source, &mut stack)?,
                Work::Seek { target, want } => self.seek(state, target, want, &mut stack)?,
                Work::Outside {
                    target,
                    source,
                    skip,
                } => self.outside(state, target, source, skip, &mut stack)?,
                Work::Pair { source, target } => self.pair(state, source, target, &mut stack)?,
            }
        }
        Ok(())
    }

    fn evaluate(
        &self,
        state: &mut State<D, V::Output>,
        target: usize,
        source: Arc<Node<D>>,
        stack: &mut Vec<Work<D>>,
    ) -> Result<()> {
        if source.is_placeholder() {
            let resume = ResumeAt::Evaluate {
                source: source.key(),
            };
            return self.suspend(state, target, &source, resume, stack);
        }
        let slot = &mut state.targets[target];
        match self.visitor.open(&source, &slot.node) {
            Opening::Accept => {
                self.visitor.node(&mut slot.output, &source, &slot.node);
                state.counts.node_interactions += 1;
                state.counts.closes += 1;
            }
            Opening::Open | Opening::Leaf if source.is_leaf() => {
                if source.n_particles() > 0 {
                    slot.deferred.push(source);
                    state.counts.leaf_interactions += 1;
                }
            }
            Opening::Open | Opening::Leaf => {
                state.counts.opens += 1;
                for child in source.children().into_iter().rev() {
                    stack.push(Work::Eval {
                        target,
                        source: child,
                    });
                }
            }
        }
        Ok(())
    }

    fn seek(
        &self,
        state: &mut State<D, V::Output>,
        target: usize,
        want: Key,
        stack: &mut Vec<Work<D>>,
    ) -> Result<()> {
        if let Some(local) = self.cache.local_descendant(want) {
            stack.push(Work::Eval {
                target,
                source: local,
            });
            return Ok(());
        }
        let node = self.cache.nearest(want)?;
        if node.key() == want {
            stack.push(Work::Eval {
                target,
                source: node,
            });
        } else if node.is_placeholder() {
            self.suspend(state, target, &node, ResumeAt::Evaluate { source: want }, stack)?;
        } else {
            warn!(traversal = self.id, want = %want, blocked_by = %node.key(), "no node at key");
        }
        Ok(())
    }

    /// Open `source`, which lies on the path to `skip`, without consulting
    /// the visitor. Off-path children are evaluated normally.
    fn outside(
        &self,
        state: &mut State<D, V::Output>,
        target: usize,
        source: Arc<Node<D>>,
        skip: Key,
        stack: &mut Vec<Work<D>>,
    ) -> Result<()> {
        if source.is_placeholder() || source.is_leaf() {
            return Err(Error::unexpected_role(
                source.key(),
                source.role(),
                "ancestor of ascent stop",
            ));
        }
        let b = self.cache.branch_factor();
        state.counts.opens += 1;
        for child in source.children().into_iter().rev() {
            let key = child.key();
            if key == skip {
                continue;
            }
            if key.is_prefix_of(skip, b) {
                stack.push(Work::Outside {
                    target,
                    source: child,
                    skip,
                });
            } else {
                stack.push(Work::Eval {
                    target,
                    source: child,
                });
            }
        }
        Ok(())
    }

    fn pair(
        &self,
        state: &mut State<D, V::Output>,
        source: Arc<Node<D>>,
        target: Arc<Node<D>>,
        stack: &mut Vec<Work<D>>,
    ) -> Result<()> {
        if source.is_placeholder() {
            let resume = ResumeAt::Pair {
                source: source.key(),
                target: target.key(),
            };
            return self.suspend(state, 0, &source, resume, stack);
        }
        match self.visitor.open(&source, &target) {
            Opening::Accept => {
                for leaf in target.leaves() {
                    if let Some(&i) = state.index.get(&leaf.key()) {
                        let slot = &mut state.targets[i];
                        self.visitor.node(&mut slot.output, &source, &slot.node);
                        state.counts.node_interactions += 1;
                    }
                }
                state.counts.closes += 1;
            }
            Opening::Open | Opening::Leaf => match (source.is_leaf(), target.is_leaf()) {
                (true, true) => {
                    if let Some(&i) = state.index.get(&target.key()) {
                        if source.n_particles() > 0 {
                            state.targets[i].deferred.push(source);
                            state.counts.leaf_interactions += 1;
                        }
                    }
                }
                (true, false) => {
                    for child in target.children() {
                        stack.push(Work::Pair {
                            source: Arc::clone(&source),
                            target: child,
                        });
                    }
                }
                (false, true) => {
                    state.counts.opens += 1;
                    for child in source.children() {
                        stack.push(Work::Pair {
                            source: child,
                            target: Arc::clone(&target),
                        });
                    }
                }
                (false, false) => {
                    state.counts.opens += 1;
                    let targets = target.children();
                    for child in source.children() {
                        for t in &targets {
                            stack.push(Work::Pair {
                                source: Arc::clone(&child),
                                target: Arc::clone(t),
                            });
                        }
                    }
                }
            },
        }
        Ok(())
    }

    /// Park work on `placeholder` and ask the cache for it. A key that has
    /// already resolved is picked up again right away.
    fn suspend(
        &self,
        state: &mut State<D, V::Output>,
        target: usize,
        placeholder: &Arc<Node<D>>,
        resume: ResumeAt,
        stack: &mut Vec<Work<D>>,
    ) -> Result<()> {
        let key = placeholder.key();
        let continuation = Continuation::new(self.id, target, key, resume);
        match self.cache.resumer().register(continuation) {
            Registration::Waiting => {
                state.pending += 1;
                if matches!(resume, ResumeAt::Evaluate { .. }) {
                    state.targets[target].pending += 1;
                }
                state.counts.suspensions += 1;
                self.cache.request(placeholder)?;
            }
            Registration::Ready(continuation) => {
                let node = self
                    .cache
                    .lookup(key)?
                    .ok_or_else(|| Error::missing_node(key, self.cache.location()))?;
                if node.is_placeholder() {
                    return Err(Error::unexpected_role(key, node.role(), "resolved key"));
                }
                stack.push(self.resume_work(&continuation, node)?);
            }
        }
        Ok(())
    }

    fn resume_work(&self, continuation: &Continuation, node: Arc<Node<D>>) -> Result<Work<D>> {
        let target = continuation.target;
        Ok(match continuation.resume {
            ResumeAt::Evaluate { source } if source == node.key() => Work::Eval {
                target,
                source: node,
            },
            ResumeAt::Evaluate { source } => Work::Seek {
                target,
                want: source,
            },
            ResumeAt::Pair { target: local, .. } => Work::Pair {
                source: node,
                target: self
                    .cache
                    .local_descendant(local)
                    .ok_or_else(|| Error::missing_node(local, self.cache.location()))?,
            },
        })
    }

    /// Finish targets with nothing parked. Pair walks finish all at once.
    fn settle(&self, state: &mut State<D, V::Output>, touched: Option<usize>) {
        match self.kind {
            TraversalKind::Dual => {
                if state.pending == 0 {
                    for i in 0..state.targets.len() {
                        self.finish(state, i);
                    }
                }
            }
            _ => match touched {
                Some(i) => self.finish(state, i),
                None => {
                    for i in 0..state.targets.len() {
                        self.finish(state, i);
                    }
                }
            },
        }
    }

    fn finish(&self, state: &mut State<D, V::Output>, target: usize) {
        let slot = &mut state.targets[target];
        if slot.done || slot.pending > 0 {
            return;
        }
        for source in std::mem::take(&mut slot.deferred) {
            self.visitor.leaf(&mut slot.output, &source, &slot.node);
        }
        slot.done = true;
        state.completed += 1;
        if state.completed == state.targets.len() {
            debug!(traversal = self.id, counts = ?state.counts, "traversal complete");
        }
    }
}

impl<D: Data, V: Visitor<D>> ResumeSink<D> for Traverser<D, V> {
    fn resume(&self, continuation: Continuation, node: Arc<Node<D>>) -> Result<()> {
        let mut state = self.state();
        state.pending = state.pending.saturating_sub(1);
        let touched = match continuation.resume {
            ResumeAt::Evaluate { .. } => {
                let slot = &mut state.targets[continuation.target];
                slot.pending = slot.pending.saturating_sub(1);
                Some(continuation.target)
            }
            ResumeAt::Pair { .. } => None,
        };
        let work = self.resume_work(&continuation, node)?;
        self.run(&mut state, vec![work])?;
        self.settle(&mut state, touched);
        Ok(())
    }
}

impl<D: Data, V: Visitor<D>> Drop for Traverser<D, V> {
    fn drop(&mut self) {
        self.cache.resumer().detach(self.id);
    }
}
