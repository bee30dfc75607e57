//! Per-location software cache
//!
//! The cache keeps one mirror graph per location. Its apex is replaced by the
//! canopy at iteration start; below it sit owned roots (adopted from the
//! build), canopy aggregates, placeholders, and subtrees fetched from other
//! locations. Every graph change publishes by swapping a finished subtree
//! into its parent's slot, and only then signals the [`Resumer`], so a
//! resumed traversal always sees the resolved node.

use crate::node::{Node, Particles};
use crate::resumer::Resumer;
use crate::sync;
use crate::transport::Transport;
use arbor_core::{
    Bundle, CanopySummary, Data, Endpoint, Error, FetchRequest, Key, LocationId, Particle,
    Result, Role, Snapshot, StarterPack, Wire,
};
use dashmap::{DashMap, DashSet};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub branch_factor: usize,
    /// Levels below the requested node included in each fetch response.
    pub bundle_depth: usize,
    /// Worker threads mutating this cache. Above one, structural changes
    /// serialize through a mutex.
    pub workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            branch_factor: 8,
            bundle_depth: 2,
            workers: 1,
        }
    }
}

/// Counters for one iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub fetches_sent: usize,
    pub requests_served: usize,
    pub bundles_received: usize,
    pub nodes_cached: usize,
    pub vertices_restored: usize,
    pub duplicates_dropped: usize,
}

#[derive(Default)]
struct Counters {
    fetches_sent: AtomicUsize,
    requests_served: AtomicUsize,
    bundles_received: AtomicUsize,
    nodes_cached: AtomicUsize,
    vertices_restored: AtomicUsize,
    duplicates_dropped: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            fetches_sent: self.fetches_sent.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            bundles_received: self.bundles_received.load(Ordering::Relaxed),
            nodes_cached: self.nodes_cached.load(Ordering::Relaxed),
            vertices_restored: self.vertices_restored.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.fetches_sent,
            &self.requests_served,
            &self.bundles_received,
            &self.nodes_cached,
            &self.vertices_restored,
            &self.duplicates_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct CacheManager<D: Data> {
    location: LocationId,
    config: CacheConfig,
    apex: RwLock<Option<Arc<Node<D>>>>,
    local_roots: DashMap<Key, Arc<Node<D>>>,
    prefetch: Mutex<BTreeSet<Key>>,
    nodewide: Mutex<D>,
    /// Superseded nodes, one queue per worker, dropped at `destroy`.
    retired: Vec<Mutex<Vec<Arc<Node<D>>>>>,
    in_flight: DashSet<Key>,
    restored: DashSet<Key>,
    structure: Option<Mutex<()>>,
    resumer: Arc<Resumer<D>>,
    transport: Arc<dyn Transport<D>>,
    counters: Counters,
}

impl<D: Data> CacheManager<D> {
    pub fn new(
        location: LocationId,
        config: CacheConfig,
        resumer: Arc<Resumer<D>>,
        transport: Arc<dyn Transport<D>>,
    ) -> Self {
        let workers = config.workers.max(1);
        let cache = Self {
            location,
            config,
            apex: RwLock::new(None),
            local_roots: DashMap::new(),
            prefetch: Mutex::new(BTreeSet::new()),
            nodewide: Mutex::new(D::default()),
            retired: (0..workers).map(|_| Mutex::new(Vec::new())).collect(),
            in_flight: DashSet::new(),
            restored: DashSet::new(),
            structure: (workers > 1).then(|| Mutex::new(())),
            resumer,
            transport,
            counters: Counters::default(),
        };
        cache.initialize();
        cache
    }

    pub fn location(&self) -> LocationId {
        self.location
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn branch_factor(&self) -> usize {
        self.config.branch_factor
    }

    pub fn resumer(&self) -> &Arc<Resumer<D>> {
        &self.resumer
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Fresh apex whose children are all unresolved canopy placeholders.
    fn initialize(&self) {
        let apex = Node::cached(
            Key::ROOT,
            Role::CachedBoundary,
            None,
            Snapshot::empty(),
            Particles::default(),
            Weak::new(),
            self.config.branch_factor,
        );
        self.insert_node(&apex, true);
        *sync::write(&self.apex) = Some(apex);
    }

    fn lock_structure(&self) -> Option<MutexGuard<'_, ()>> {
        self.structure.as_ref().map(sync::lock)
    }

    fn apex(&self) -> Result<Arc<Node<D>>> {
        sync::read(&self.apex)
            .clone()
            .ok_or_else(|| Error::missing_node(Key::ROOT, self.location))
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Root of the traversable graph. A location that owns the whole tree
    /// traverses its build directly.
    pub fn root(&self) -> Result<Arc<Node<D>>> {
        if let Some(root) = self.local_roots.get(&Key::ROOT) {
            return Ok(Arc::clone(root.value()));
        }
        self.apex()
    }

    /// Exact node at `key`, if resident.
    pub fn lookup(&self, key: Key) -> Result<Option<Arc<Node<D>>>> {
        Ok(self.root()?.descendant(key))
    }

    /// `key` itself, or the placeholder or leaf that blocks the way to it.
    pub fn nearest(&self, key: Key) -> Result<Arc<Node<D>>> {
        self.root()?
            .deepest_toward(key)
            .ok_or(Error::NotDescendant {
                ancestor: Key::ROOT,
                key,
            })
    }

    /// Node at `key` inside this location's own subtrees.
    pub fn local_descendant(&self, key: Key) -> Option<Arc<Node<D>>> {
        let b = self.config.branch_factor;
        std::iter::once(key)
            .chain(key.ancestors(b))
            .find_map(|k| self.local_roots.get(&k).map(|root| Arc::clone(root.value())))
            .and_then(|root| root.descendant(key))
    }

    pub fn local_root(&self, key: Key) -> Option<Arc<Node<D>>> {
        self.local_roots.get(&key).map(|root| Arc::clone(root.value()))
    }

    /// Owned roots in key order.
    pub fn local_roots(&self) -> Vec<Arc<Node<D>>> {
        let mut roots: Vec<_> = self
            .local_roots
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        roots.sort_by_key(|node| node.key());
        roots
    }

    /// Canopy keys worth holding before traversal: every ancestor of an
    /// owned root and each ancestor's children.
    pub fn prefetch_keys(&self) -> Vec<Key> {
        sync::lock(&self.prefetch).iter().copied().collect()
    }

    /// Merge of every owned root's aggregate.
    pub fn nodewide(&self) -> D {
        sync::lock(&self.nodewide).clone()
    }

    /// Keys and roles of everything reachable from the apex, pre-order.
    pub fn resident(&self) -> Result<Vec<(Key, Role)>> {
        let mut out = Vec::new();
        self.apex()?
            .walk(&mut |node| out.push((node.key(), node.role())));
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Graph assembly
    // -----------------------------------------------------------------------

    /// Attach a node produced outside the fetch path. Canopy aggregates are
    /// swapped into the graph; build roots are recorded as owned.
    pub fn connect(&self, node: Arc<Node<D>>, should_process: bool) -> Result<()> {
        let key = node.key();
        {
            let _guard = self.lock_structure();
            self.connect_locked(&node)?;
        }
        if should_process && node.role() == Role::CachedBoundary {
            self.process(key)?;
        }
        Ok(())
    }

    fn connect_locked(&self, node: &Arc<Node<D>>) -> Result<()> {
        let key = node.key();
        match node.role() {
            Role::CachedBoundary => self.swap_in(Arc::clone(node)),
            role if role.is_build_resident() => {
                self.local_roots.insert(key, Arc::clone(node));
                self.prep_prefetch(node);
                self.attach_local_root(node);
                debug!(location = self.location, key = %key, "owned root connected");
                Ok(())
            }
            role => Err(Error::unexpected_role(key, role, "connect")),
        }
    }

    fn prep_prefetch(&self, node: &Node<D>) {
        let b = self.config.branch_factor;
        sync::lock(&self.nodewide).merge(node.data());
        let mut prefetch = sync::lock(&self.prefetch);
        for ancestor in node.key().ancestors(b) {
            prefetch.insert(ancestor);
            prefetch.extend(ancestor.children(b));
        }
    }

    /// Replace a canopy placeholder standing where an owned root belongs.
    fn attach_local_root(&self, node: &Arc<Node<D>>) {
        let b = self.config.branch_factor;
        let Some(parent_key) = node.key().parent(b) else {
            return;
        };
        let Some(parent) = sync::read(&self.apex)
            .as_ref()
            .and_then(|apex| apex.descendant(parent_key))
        else {
            return;
        };
        let index = node.key().child_index(b);
        if parent.child(index).is_some_and(|c| c.is_placeholder()) {
            node.set_parent(&parent);
            if let Some(old) = parent.exchange_child(index, Arc::clone(node)) {
                self.retire(old);
            }
        }
    }

    /// Fill every child slot of `node`: above the owned roots, adopt owned
    /// roots or stand in canopy placeholders; below, stand in placeholders
    /// that inherit the owner.
    pub fn insert_node(&self, node: &Arc<Node<D>>, above_owned: bool) {
        let b = self.config.branch_factor;
        for index in 0..node.n_children() {
            let child_key = node.key().child(index, b);
            let child = if above_owned {
                match self.local_roots.get(&child_key) {
                    Some(root) => {
                        root.set_parent(node);
                        Arc::clone(root.value())
                    }
                    None => Node::placeholder(child_key, Role::RemoteAboveOwnedKey, None, node),
                }
            } else {
                Node::placeholder(child_key, Role::Remote, node.owner(), node)
            };
            if let Some(old) = node.exchange_child(index, child) {
                self.retire(old);
            }
        }
    }

    /// Publish `node` into its parent's slot (or as the apex), retiring the
    /// previous occupant.
    pub fn swap_in(&self, node: Arc<Node<D>>) -> Result<()> {
        let b = self.config.branch_factor;
        let key = node.key();
        let Some(parent_key) = key.parent(b) else {
            if let Some(old) = sync::write(&self.apex).replace(node) {
                self.retire(old);
            }
            return Ok(());
        };
        let parent = node
            .parent()
            .ok_or_else(|| Error::missing_node(parent_key, self.location))?;
        if parent.n_children() == 0 {
            return Err(Error::unexpected_role(parent.key(), parent.role(), "swap_in"));
        }
        if let Some(old) = parent.exchange_child(key.child_index(b), node) {
            self.retire(old);
        }
        Ok(())
    }

    fn retire(&self, node: Arc<Node<D>>) {
        sync::lock(&self.retired[self.shard()]).push(node);
    }

    fn shard(&self) -> usize {
        if self.retired.len() == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.retired.len()
    }

    // -----------------------------------------------------------------------
    // Fetch path
    // -----------------------------------------------------------------------

    /// Ask for the subtree behind `placeholder`. Returns false when a fetch
    /// for the same key is already in flight from this location.
    pub fn request(&self, placeholder: &Node<D>) -> Result<bool> {
        let key = placeholder.key();
        let request = FetchRequest::new(key, self.location);
        let (to, message) = match placeholder.role() {
            Role::RemoteAboveOwnedKey => (Endpoint::Canopy, Wire::CanopyFetch(request)),
            Role::Remote => {
                let owner = placeholder
                    .owner()
                    .ok_or_else(|| Error::unexpected_role(key, Role::Remote, "request"))?;
                (Endpoint::Location(owner), Wire::Fetch(request))
            }
            role => return Err(Error::unexpected_role(key, role, "request")),
        };
        if !self.in_flight.insert(key) {
            return Ok(false);
        }
        debug!(location = self.location, key = %key, kind = message.kind(), "fetch");
        Counters::bump(&self.counters.fetches_sent, 1);
        self.transport.send(to, message)?;
        Ok(true)
    }

    /// Owner side of a fetch: find the requested node among owned subtrees.
    pub fn request_nodes(&self, request: FetchRequest) -> Result<()> {
        let node = self
            .local_descendant(request.key)
            .ok_or_else(|| Error::unknown_key(request.key, self.location))?;
        self.service_request(&node, request.requester)
    }

    /// Ship `node` and up to `bundle_depth` levels below it to `requester`.
    /// A request from this location is a no-op: the data is already here.
    pub fn service_request(&self, node: &Arc<Node<D>>, requester: LocationId) -> Result<()> {
        if requester == self.location {
            debug!(location = self.location, key = %node.key(), "request from self ignored");
            return Ok(());
        }
        let bundle = self.bundle(node);
        debug!(
            location = self.location,
            key = %node.key(),
            requester,
            entries = bundle.len(),
            "serving bundle"
        );
        Counters::bump(&self.counters.requests_served, 1);
        self.transport
            .send(Endpoint::Location(requester), Wire::Bundle(bundle))
    }

    /// Breadth-first serialization of `node` and the levels below it.
    pub fn bundle(&self, node: &Arc<Node<D>>) -> Bundle<D> {
        let mut bundle = Bundle::new(self.location);
        let mut level = vec![Arc::clone(node)];
        for depth in 0..=self.config.bundle_depth {
            let mut next = Vec::new();
            for n in &level {
                let snapshot = n.snapshot();
                if snapshot.is_leaf {
                    let particles = n.particles();
                    bundle.leaf_counts.push(particles.len());
                    bundle.particles.extend_from_slice(particles.as_slice());
                }
                bundle.entries.push((n.key(), snapshot));
                if depth < self.config.bundle_depth {
                    next.extend(n.children());
                }
            }
            if next.is_empty() {
                break;
            }
            level = next;
        }
        bundle
    }

    /// Requester side of a fetch: rebuild the bundle as a detached subtree,
    /// then publish it in place of the placeholder and resume waiters.
    pub fn add_cache(&self, bundle: Bundle<D>) -> Result<()> {
        let Some(top) = bundle.top_key() else {
            warn!(location = self.location, source = bundle.source, "empty bundle");
            return Ok(());
        };
        Counters::bump(&self.counters.bundles_received, 1);
        let published = {
            let _guard = self.lock_structure();
            self.assemble(top, bundle)?
        };
        self.in_flight.remove(&top);
        if published {
            self.process(top)?;
        }
        Ok(())
    }

    fn assemble(&self, top: Key, bundle: Bundle<D>) -> Result<bool> {
        let b = self.config.branch_factor;
        let current = self
            .apex()?
            .descendant(top)
            .ok_or_else(|| Error::missing_node(top, self.location))?;
        if current.role().is_build_resident() {
            return Err(Error::invalid_placeholder(top, current.role()));
        }
        if !current.is_placeholder() {
            warn!(
                location = self.location,
                key = %top,
                role = %current.role(),
                "bundle for a resolved slot dropped"
            );
            Counters::bump(&self.counters.duplicates_dropped, 1);
            return Ok(false);
        }
        let parent = current
            .parent()
            .ok_or_else(|| Error::missing_node(top, self.location))?;

        let source = bundle.source;
        let mut particles = bundle.particles.into_iter();
        let mut leaf_counts = bundle.leaf_counts.into_iter();
        let mut entries = bundle.entries.into_iter();

        let Some((_, snapshot)) = entries.next() else {
            return Ok(false);
        };
        let first = self.cached_node(
            top,
            snapshot,
            source,
            Arc::downgrade(&parent),
            &mut particles,
            &mut leaf_counts,
        )?;
        self.insert_node(&first, false);

        let mut added = 1;
        for (key, snapshot) in entries {
            let not_below = || Error::NotDescendant { ancestor: top, key };
            let parent_key = key.parent(b).ok_or_else(not_below)?;
            let parent = first.descendant(parent_key).ok_or_else(not_below)?;
            if parent.n_children() == 0 {
                return Err(not_below());
            }
            let node = self.cached_node(
                key,
                snapshot,
                source,
                Arc::downgrade(&parent),
                &mut particles,
                &mut leaf_counts,
            )?;
            self.insert_node(&node, false);
            self.swap_in(node)?;
            added += 1;
        }

        self.swap_in(first)?;
        Counters::bump(&self.counters.nodes_cached, added);
        debug!(location = self.location, key = %top, source, added, "bundle cached");
        Ok(true)
    }

    fn cached_node(
        &self,
        key: Key,
        snapshot: Snapshot<D>,
        source: LocationId,
        parent: Weak<Node<D>>,
        particles: &mut impl Iterator<Item = Particle>,
        leaf_counts: &mut impl Iterator<Item = usize>,
    ) -> Result<Arc<Node<D>>> {
        let (role, storage) = if snapshot.is_leaf {
            let n = leaf_counts
                .next()
                .ok_or_else(|| Error::transport(format!("bundle leaf {key} has no particle count")))?;
            let run: Vec<Particle> = particles.by_ref().take(n).collect();
            if run.len() != n {
                return Err(Error::transport(format!("bundle leaf {key} is short of particles")));
            }
            (Role::CachedRemoteLeaf, Particles::owned(run))
        } else {
            (Role::CachedRemote, Particles::default())
        };
        Ok(Node::cached(
            key,
            role,
            Some(source),
            snapshot,
            storage,
            parent,
            self.config.branch_factor,
        ))
    }

    // -----------------------------------------------------------------------
    // Canopy path
    // -----------------------------------------------------------------------

    /// Canopy response: publish the aggregate and resume waiters.
    pub fn restore_data(&self, summary: CanopySummary<D>) -> Result<()> {
        self.restore(summary.key, summary.snapshot, true)
    }

    fn restore(&self, key: Key, snapshot: Snapshot<D>, should_process: bool) -> Result<()> {
        if !self.restored.insert(key) {
            warn!(location = self.location, key = %key, "duplicate canopy restore dropped");
            Counters::bump(&self.counters.duplicates_dropped, 1);
            return Ok(());
        }
        let b = self.config.branch_factor;
        {
            let _guard = self.lock_structure();
            let parent = match key.parent(b) {
                None => Weak::new(),
                Some(parent_key) => {
                    let parent = self
                        .apex()?
                        .descendant(parent_key)
                        .ok_or_else(|| Error::missing_node(parent_key, self.location))?;
                    Arc::downgrade(&parent)
                }
            };
            let node = Node::cached(
                key,
                Role::CachedBoundary,
                None,
                snapshot,
                Particles::default(),
                parent,
                b,
            );
            self.insert_node(&node, true);
            self.connect_locked(&node)?;
        }
        Counters::bump(&self.counters.vertices_restored, 1);
        self.in_flight.remove(&key);
        if should_process {
            self.process(key)?;
        }
        Ok(())
    }

    /// Install the canopy broadcast. Entries arrive parents first; owned
    /// roots are skipped since the build already holds them.
    pub fn recv_starter_pack(&self, pack: StarterPack<D>) -> Result<usize> {
        let mut restored = 0;
        for (key, snapshot) in pack.entries {
            if self.local_roots.contains_key(&key) {
                continue;
            }
            self.restore(key, snapshot, false)?;
            restored += 1;
        }
        info!(location = self.location, restored, "starter pack loaded");
        Ok(restored)
    }

    /// Resume everything waiting on `key`. The key must already be resident
    /// and resolved; anything else means the graph and the resumer disagree.
    pub fn process(&self, key: Key) -> Result<usize> {
        let node = self
            .lookup(key)?
            .ok_or_else(|| Error::missing_node(key, self.location))?;
        if node.is_placeholder() {
            return Err(Error::unexpected_role(key, node.role(), "process"));
        }
        self.resumer.process(key, node)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Drop the mirror graph and everything superseded during the iteration.
    /// With `restore`, a fresh apex is ready immediately afterwards.
    pub fn destroy(&self, restore: bool) {
        let _guard = self.lock_structure();
        if let Some(apex) = sync::write(&self.apex).take() {
            apex.trigger_free();
        }
        let mut dropped = 0;
        for queue in &self.retired {
            let mut queue = sync::lock(queue);
            dropped += queue.len();
            queue.clear();
        }
        self.local_roots.clear();
        sync::lock(&self.prefetch).clear();
        *sync::lock(&self.nodewide) = D::default();
        self.in_flight.clear();
        self.restored.clear();
        self.counters.reset();
        debug!(location = self.location, dropped, restore, "cache destroyed");
        if restore {
            self.initialize();
        }
    }
}
