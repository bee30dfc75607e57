//! Tree vertices shared by the build phase and the cache
//!
//! A node owns its children through replaceable slots and points back at its
//! parent without owning it. Placeholders are resolved by swapping a new
//! subtree into the parent's slot; readers holding the old value keep it
//! alive until they drop it.

use crate::sync;
use arbor_core::{Data, Key, LocationId, Particle, Role, Snapshot};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

// ---------------------------------------------------------------------------
// Particle storage
// ---------------------------------------------------------------------------

/// A leaf's particles: a window into a shared buffer.
///
/// Build leaves borrow a range of the location's particle array; cached
/// leaves hold their own copy.
#[derive(Clone, Default)]
pub struct Particles {
    buffer: Option<Arc<[Particle]>>,
    start: usize,
    len: usize,
}

impl Particles {
    pub fn borrowed(buffer: &Arc<[Particle]>, start: usize, len: usize) -> Self {
        debug_assert!(start + len <= buffer.len());
        Self {
            buffer: Some(Arc::clone(buffer)),
            start,
            len,
        }
    }

    pub fn owned(particles: Vec<Particle>) -> Self {
        let len = particles.len();
        Self {
            buffer: Some(Arc::from(particles)),
            start: 0,
            len,
        }
    }

    pub fn as_slice(&self) -> &[Particle] {
        match &self.buffer {
            Some(buffer) => &buffer[self.start..self.start + self.len],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Particles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particles")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("resident", &self.buffer.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Child slot
// ---------------------------------------------------------------------------

struct Slot<D> {
    cell: RwLock<Option<Arc<Node<D>>>>,
}

impl<D> Slot<D> {
    fn empty() -> Self {
        Self {
            cell: RwLock::new(None),
        }
    }

    fn load(&self) -> Option<Arc<Node<D>>> {
        sync::read(&self.cell).clone()
    }

    /// Replace the slot's value, returning what was there.
    fn exchange(&self, value: Option<Arc<Node<D>>>) -> Option<Arc<Node<D>>> {
        std::mem::replace(&mut *sync::write(&self.cell), value)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node<D> {
    key: Key,
    depth: usize,
    role: Role,
    owner: Option<LocationId>,
    data: D,
    n_particles: usize,
    branch_factor: usize,
    particles: RwLock<Particles>,
    children: Box<[Slot<D>]>,
    parent: RwLock<Weak<Node<D>>>,
}

impl<D: Data> Node<D> {
    #[allow(clippy::too_many_arguments)]
    fn with_parts(
        key: Key,
        role: Role,
        owner: Option<LocationId>,
        data: D,
        n_particles: usize,
        particles: Particles,
        n_children: usize,
        branch_factor: usize,
    ) -> Self {
        Self {
            key,
            depth: key.depth(branch_factor),
            role,
            owner,
            data,
            n_particles,
            branch_factor,
            particles: RwLock::new(particles),
            children: (0..n_children).map(|_| Slot::empty()).collect(),
            parent: RwLock::new(Weak::new()),
        }
    }

    /// Build-phase leaf over `particles`. Zero particles yields an empty leaf.
    pub fn leaf(
        key: Key,
        owner: LocationId,
        particles: Particles,
        branch_factor: usize,
    ) -> Arc<Self> {
        let data = D::from_particles(particles.as_slice());
        let n = particles.len();
        let role = if n == 0 { Role::EmptyLeaf } else { Role::Leaf };
        Arc::new(Self::with_parts(
            key,
            role,
            Some(owner),
            data,
            n,
            particles,
            0,
            branch_factor,
        ))
    }

    /// Build-phase branch. `children` has one entry per slot; absent entries
    /// stay empty. The aggregate is the merge of the present children.
    pub fn branch(
        key: Key,
        role: Role,
        owner: Option<LocationId>,
        children: Vec<Option<Arc<Node<D>>>>,
        branch_factor: usize,
    ) -> Arc<Self> {
        debug_assert_eq!(children.len(), branch_factor);
        let mut data = D::default();
        let mut n_particles = 0;
        for child in children.iter().flatten() {
            data.merge(&child.data);
            n_particles += child.n_particles;
        }
        let node = Arc::new(Self::with_parts(
            key,
            role,
            owner,
            data,
            n_particles,
            Particles::default(),
            branch_factor,
            branch_factor,
        ));
        for (i, child) in children.into_iter().enumerate() {
            if let Some(child) = child {
                child.set_parent(&node);
                node.exchange_child(i, child);
            }
        }
        node
    }

    /// Unresolved stand-in for `key` below `parent`.
    pub fn placeholder(
        key: Key,
        role: Role,
        owner: Option<LocationId>,
        parent: &Arc<Node<D>>,
    ) -> Arc<Self> {
        debug_assert!(role.is_placeholder());
        let node = Self::with_parts(
            key,
            role,
            owner,
            D::default(),
            0,
            Particles::default(),
            0,
            parent.branch_factor,
        );
        *sync::write(&node.parent) = Arc::downgrade(parent);
        Arc::new(node)
    }

    /// Cache-resident node rebuilt from a snapshot. Leaves get no child slots
    /// and carry `particles`; everything else gets `B` empty slots.
    pub fn cached(
        key: Key,
        role: Role,
        owner: Option<LocationId>,
        snapshot: Snapshot<D>,
        particles: Particles,
        parent: Weak<Node<D>>,
        branch_factor: usize,
    ) -> Arc<Self> {
        debug_assert!(role.is_cache_resident() || role == Role::Boundary);
        let n_children = if snapshot.is_leaf { 0 } else { branch_factor };
        let node = Self::with_parts(
            key,
            role,
            owner,
            snapshot.data,
            snapshot.n_particles,
            particles,
            n_children,
            branch_factor,
        );
        *sync::write(&node.parent) = parent;
        Arc::new(node)
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Location that built the subtree this node mirrors, when known.
    pub fn owner(&self) -> Option<LocationId> {
        self.owner
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn n_particles(&self) -> usize {
        self.n_particles
    }

    pub fn branch_factor(&self) -> usize {
        self.branch_factor
    }

    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    pub fn is_placeholder(&self) -> bool {
        self.role.is_placeholder()
    }

    /// A resident node with no child slots.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && !self.role.is_placeholder()
    }

    pub fn particles(&self) -> Particles {
        sync::read(&self.particles).clone()
    }

    pub fn snapshot(&self) -> Snapshot<D> {
        Snapshot::new(
            self.data.clone(),
            self.n_particles,
            self.role.is_leaf(),
            self.depth,
        )
    }

    pub fn child(&self, index: usize) -> Option<Arc<Node<D>>> {
        self.children.get(index).and_then(Slot::load)
    }

    /// Present children in slot order.
    pub fn children(&self) -> Vec<Arc<Node<D>>> {
        self.children.iter().filter_map(Slot::load).collect()
    }

    /// Atomically replace child slot `index`, returning the previous value.
    pub fn exchange_child(&self, index: usize, child: Arc<Node<D>>) -> Option<Arc<Node<D>>> {
        debug_assert_eq!(child.key, self.key.child(index, self.branch_factor));
        self.children[index].exchange(Some(child))
    }

    pub fn clear_child(&self, index: usize) -> Option<Arc<Node<D>>> {
        self.children.get(index).and_then(|slot| slot.exchange(None))
    }

    pub fn parent(&self) -> Option<Arc<Node<D>>> {
        sync::read(&self.parent).upgrade()
    }

    /// Re-point the non-owning parent link.
    pub fn set_parent(&self, parent: &Arc<Node<D>>) {
        *sync::write(&self.parent) = Arc::downgrade(parent);
    }

    pub fn detach_parent(&self) {
        *sync::write(&self.parent) = Weak::new();
    }

    /// Exact descendant at `key`, following present slots.
    pub fn descendant(self: &Arc<Self>, key: Key) -> Option<Arc<Node<D>>> {
        let path = self.key.path_to(key, self.branch_factor)?;
        let mut node = Arc::clone(self);
        for index in path {
            node = node.child(index)?;
        }
        Some(node)
    }

    /// Deepest present node on the path toward `key`. Stops at placeholders
    /// and leaves, so the result is either `key` itself or the node that
    /// blocks the descent.
    pub fn deepest_toward(self: &Arc<Self>, key: Key) -> Option<Arc<Node<D>>> {
        let path = self.key.path_to(key, self.branch_factor)?;
        let mut node = Arc::clone(self);
        for index in path {
            if node.is_placeholder() {
                break;
            }
            match node.child(index) {
                Some(child) => node = child,
                None => break,
            }
        }
        Some(node)
    }

    /// Pre-order walk over everything reachable through present slots.
    pub fn walk(self: &Arc<Self>, visit: &mut dyn FnMut(&Arc<Node<D>>)) {
        let mut stack = vec![Arc::clone(self)];
        while let Some(node) = stack.pop() {
            visit(&node);
            let mut children = node.children();
            children.reverse();
            stack.extend(children);
        }
    }

    /// Leaves reachable from this node, in key order.
    pub fn leaves(self: &Arc<Self>) -> Vec<Arc<Node<D>>> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if node.is_leaf() {
                out.push(Arc::clone(node));
            }
        });
        out
    }

    /// Release particle storage below this node. A cache-resident node does
    /// not reach into build-resident children; those belong to the build.
    pub fn trigger_free(&self) {
        *sync::write(&self.particles) = Particles::default();
        for slot in self.children.iter() {
            if let Some(child) = slot.load() {
                if self.role.is_cache_resident() && child.role.is_build_resident() {
                    continue;
                }
                child.trigger_free();
            }
        }
    }
}

impl<D> fmt::Debug for Node<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("owner", &self.owner)
            .field("n_particles", &self.n_particles)
            .field("n_children", &self.children.len())
            .finish()
    }
}
