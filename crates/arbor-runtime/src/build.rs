//! Key assignment, domain decomposition, and the per-location tree build
//!
//! Particle keys interleave the quantized coordinates (Morton order), so
//! sorting by key groups every subtree's particles into one contiguous run.
//! A location builds from the global root down, keeping only the paths to
//! the roots it owns; those roots are then detached and the scratch path
//! freed, leaving each particle with exactly one owning leaf.

use arbor_cache::{Node, Particles};
use arbor_core::{Data, Error, Key, LocationId, Particle, Result, Role};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Bits of the interleaved coordinate stream.
const KEY_BITS: usize = 60;
const COORD_BITS: u32 = (KEY_BITS / 3) as u32;

/// Key depth of a particle for branch factor `b`. Only powers of two whose
/// digits split the stream evenly are supported.
pub fn key_levels(branch_factor: usize) -> Result<usize> {
    match branch_factor {
        2 => Ok(KEY_BITS),
        4 => Ok(KEY_BITS / 2),
        8 => Ok(KEY_BITS / 3),
        b => Err(Error::config(format!(
            "branch factor {b} has no key assignment (use 2, 4, or 8)"
        ))),
    }
}

/// Deepest key of a point in the unit cube. Coordinates outside `[0, 1)`
/// are clamped.
pub fn key_for(position: [f64; 3], branch_factor: usize) -> Result<Key> {
    key_levels(branch_factor)?;
    let scale = (1u64 << COORD_BITS) as f64;
    let max = (1u64 << COORD_BITS) - 1;
    let q = position.map(|x| ((x.clamp(0.0, 1.0) * scale) as u64).min(max));
    let mut stream = 0u64;
    for level in (0..COORD_BITS).rev() {
        for coord in q {
            stream = (stream << 1) | ((coord >> level) & 1);
        }
    }
    Ok(Key::new((1u64 << KEY_BITS) | stream))
}

/// `count` particles scattered uniformly over the unit cube.
pub fn uniform_particles(count: usize, seed: u64, branch_factor: usize) -> Result<Vec<Particle>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count as u64)
        .map(|order| {
            let position = [rng.gen::<f64>(), rng.gen::<f64>(), rng.gen::<f64>()];
            let mass = rng.gen_range(0.5..1.5);
            Ok(Particle::new(order, key_for(position, branch_factor)?, mass, position))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Decomposition
// ---------------------------------------------------------------------------

/// Assignment of the keys at one depth to locations, in contiguous runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decomposition {
    branch_factor: usize,
    depth: usize,
    locations: u32,
}

impl Decomposition {
    pub fn new(branch_factor: usize, depth: usize, locations: u32) -> Result<Self> {
        if locations == 0 {
            return Err(Error::config("decomposition needs at least one location"));
        }
        let levels = key_levels(branch_factor)?;
        if depth > levels {
            return Err(Error::config(format!("decomposition depth {depth} exceeds {levels}")));
        }
        Ok(Self {
            branch_factor,
            depth,
            locations,
        })
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn first(&self) -> u64 {
        (self.branch_factor as u64).pow(self.depth as u32)
    }

    /// Every owned root, in key order.
    pub fn roots(&self) -> impl Iterator<Item = Key> {
        let first = self.first();
        (first..2 * first).map(Key::new)
    }

    /// Location owning the root at `key`.
    pub fn owner(&self, key: Key) -> LocationId {
        let first = self.first();
        let index = key.raw().saturating_sub(first);
        (index * u64::from(self.locations) / first) as LocationId
    }

    pub fn owned_by(&self, location: LocationId) -> Vec<Key> {
        self.roots().filter(|k| self.owner(*k) == location).collect()
    }

    /// Owned root holding a particle key.
    pub fn root_of(&self, key: Key) -> Result<Key> {
        key.ancestor_at(self.depth, self.branch_factor)
            .ok_or(Error::NotDescendant {
                ancestor: Key::ROOT,
                key,
            })
    }

    /// Split particles by owning location.
    pub fn partition(&self, particles: &[Particle]) -> Result<Vec<Vec<Particle>>> {
        let mut parts = vec![Vec::new(); self.locations as usize];
        for p in particles {
            let owner = self.owner(self.root_of(p.key)?);
            parts[owner as usize].push(*p);
        }
        Ok(parts)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Result of one location's build.
pub struct LocalTree<D: Data> {
    /// Particles in key order; leaves hold windows into it.
    pub buffer: Arc<[Particle]>,
    /// Owned roots in key order, detached from the scratch path.
    pub roots: Vec<Arc<Node<D>>>,
}

impl<D: Data> LocalTree<D> {
    pub fn leaves(&self) -> Vec<Arc<Node<D>>> {
        self.roots.iter().flat_map(|root| root.leaves()).collect()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TreeBuilder {
    branch_factor: usize,
    max_per_leaf: usize,
    levels: usize,
}

impl TreeBuilder {
    pub fn new(branch_factor: usize, max_per_leaf: usize) -> Result<Self> {
        Ok(Self {
            branch_factor,
            max_per_leaf: max_per_leaf.max(1),
            levels: key_levels(branch_factor)?,
        })
    }

    /// Build the owned subtrees rooted at `owned` over `particles`. Every
    /// particle must fall under one of `owned`.
    pub fn build<D: Data>(
        &self,
        location: LocationId,
        mut particles: Vec<Particle>,
        owned: &[Key],
    ) -> Result<LocalTree<D>> {
        let b = self.branch_factor;
        particles.sort_by_key(|p| (p.key, p.order));
        let owned_set: HashSet<Key> = owned.iter().copied().collect();
        let depth = match owned.first() {
            Some(k) => k.depth(b),
            None => {
                if let Some(p) = particles.first() {
                    return Err(Error::unknown_key(p.key, location));
                }
                return Ok(LocalTree {
                    buffer: Arc::from(Vec::new()),
                    roots: Vec::new(),
                });
            }
        };
        if let Some(p) = particles.iter().find(|p| {
            p.key
                .ancestor_at(depth, b)
                .map_or(true, |root| !owned_set.contains(&root))
        }) {
            return Err(Error::unknown_key(p.key, location));
        }

        let buffer: Arc<[Particle]> = Arc::from(particles);
        let mut roots = Vec::new();
        let scratch = Scratch {
            builder: self,
            location,
            buffer: &buffer,
            owned: &owned_set,
            depth,
        };
        let top = scratch.node::<D>(Key::ROOT, 0, 0, buffer.len(), &mut roots);

        for root in &roots {
            if let Some(parent) = root.parent() {
                parent.clear_child(root.key().child_index(b));
            }
            root.detach_parent();
        }
        if !roots.iter().any(|root| Arc::ptr_eq(root, &top)) {
            top.trigger_free();
        }
        roots.sort_by_key(|r| r.key());
        debug!(
            location,
            roots = roots.len(),
            particles = buffer.len(),
            "owned subtrees built"
        );
        Ok(LocalTree { buffer, roots })
    }

    /// Subtree over `buffer[start..end]`, all of which lies under `key`.
    fn subtree<D: Data>(
        &self,
        location: LocationId,
        buffer: &Arc<[Particle]>,
        key: Key,
        depth: usize,
        start: usize,
        end: usize,
    ) -> Arc<Node<D>> {
        let len = end - start;
        if len <= self.max_per_leaf || depth >= self.levels {
            return Node::leaf(
                key,
                location,
                Particles::borrowed(buffer, start, len),
                self.branch_factor,
            );
        }
        let children = self
            .split(buffer, key, depth, start, end)
            .map(|(child, s, e)| Some(self.subtree(location, buffer, child, depth + 1, s, e)))
            .collect();
        Node::branch(key, Role::Internal, Some(location), children, self.branch_factor)
    }

    /// Child keys of `key` with the sub-range of `buffer[start..end]` under each.
    fn split<'a>(
        &'a self,
        buffer: &'a [Particle],
        key: Key,
        depth: usize,
        start: usize,
        end: usize,
    ) -> impl Iterator<Item = (Key, usize, usize)> + 'a {
        let b = self.branch_factor;
        let mut cursor = start;
        key.children(b).map(move |child| {
            let run = buffer[cursor..end]
                .partition_point(|p| p.key.ancestor_at(depth + 1, b) == Some(child));
            let range = (child, cursor, cursor + run);
            cursor += run;
            range
        })
    }
}

/// Walk from the global root toward the owned roots. Paths that lead to no
/// owned root are left empty.
struct Scratch<'a> {
    builder: &'a TreeBuilder,
    location: LocationId,
    buffer: &'a Arc<[Particle]>,
    owned: &'a HashSet<Key>,
    depth: usize,
}

impl Scratch<'_> {
    fn node<D: Data>(
        &self,
        key: Key,
        depth: usize,
        start: usize,
        end: usize,
        roots: &mut Vec<Arc<Node<D>>>,
    ) -> Arc<Node<D>> {
        let b = self.builder.branch_factor;
        if depth == self.depth {
            let root = self
                .builder
                .subtree(self.location, self.buffer, key, depth, start, end);
            roots.push(Arc::clone(&root));
            return root;
        }
        let children = self
            .builder
            .split(self.buffer, key, depth, start, end)
            .map(|(child, s, e)| {
                let leads_to_owned = self
                    .owned
                    .iter()
                    .any(|root| child.is_prefix_of(*root, b));
                leads_to_owned.then(|| self.node(child, depth + 1, s, e, roots))
            })
            .collect();
        Node::branch(key, Role::Boundary, Some(self.location), children, b)
    }
}
