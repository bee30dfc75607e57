//! Core types for Arbor

use serde::{Deserialize, Serialize};

/// Index of a compute location (one cache, one event loop).
pub type LocationId = u32;

/// Path-encoded tree address.
///
/// The root is `1`; child `i` of `k` is `k * B + i` for branch factor `B`.
/// Keys at depth `d` fall in `[B^d, 2 * B^d)`, so the encoding is unique for
/// any `B >= 2`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(u64);

impl Key {
    pub const ROOT: Key = Key(1);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn is_root(self) -> bool {
        self.0 == 1
    }

    pub fn child(self, index: usize, branch_factor: usize) -> Key {
        debug_assert!(index < branch_factor);
        Key(self.0 * branch_factor as u64 + index as u64)
    }

    pub fn parent(self, branch_factor: usize) -> Option<Key> {
        if self.0 <= 1 {
            None
        } else {
            Some(Key(self.0 / branch_factor as u64))
        }
    }

    /// Slot index of this key inside its parent.
    pub fn child_index(self, branch_factor: usize) -> usize {
        (self.0 % branch_factor as u64) as usize
    }

    pub fn depth(self, branch_factor: usize) -> usize {
        let b = branch_factor as u64;
        let mut k = self.0;
        let mut depth = 0;
        while k > 1 {
            k /= b;
            depth += 1;
        }
        depth
    }

    /// Ancestor of this key at `depth`, or `None` if this key is shallower.
    pub fn ancestor_at(self, depth: usize, branch_factor: usize) -> Option<Key> {
        let own = self.depth(branch_factor);
        if depth > own {
            return None;
        }
        let mut k = self.0;
        for _ in depth..own {
            k /= branch_factor as u64;
        }
        Some(Key(k))
    }

    /// Prefix test: true if `self` lies on the path from the root to `other`
    /// (a key is a prefix of itself).
    pub fn is_prefix_of(self, other: Key, branch_factor: usize) -> bool {
        match other.ancestor_at(self.depth(branch_factor), branch_factor) {
            Some(k) => k == self,
            None => false,
        }
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(self, branch_factor: usize) -> impl Iterator<Item = Key> {
        std::iter::successors(self.parent(branch_factor), move |k| k.parent(branch_factor))
    }

    pub fn children(self, branch_factor: usize) -> impl Iterator<Item = Key> {
        (0..branch_factor).map(move |i| self.child(i, branch_factor))
    }

    /// Slot indices from `self` down to `descendant`, top first.
    pub fn path_to(self, descendant: Key, branch_factor: usize) -> Option<Vec<usize>> {
        if !self.is_prefix_of(descendant, branch_factor) {
            return None;
        }
        let mut path = Vec::new();
        let mut k = descendant;
        while k != self {
            path.push(k.child_index(branch_factor));
            k = k.parent(branch_factor)?;
        }
        path.reverse();
        Some(path)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Key {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Residency and role of a tree vertex.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    // Produced once per iteration by the build phase
    Internal,
    Boundary,
    Leaf,
    EmptyLeaf,
    // Produced lazily by the cache
    Remote,
    RemoteAboveOwnedKey,
    CachedRemote,
    CachedRemoteLeaf,
    CachedBoundary,
}

impl Role {
    pub fn is_build_resident(self) -> bool {
        matches!(self, Role::Internal | Role::Boundary | Role::Leaf | Role::EmptyLeaf)
    }

    pub fn is_cache_resident(self) -> bool {
        !self.is_build_resident()
    }

    /// Unresolved stand-in for a subtree that has not been fetched.
    pub fn is_placeholder(self) -> bool {
        matches!(self, Role::Remote | Role::RemoteAboveOwnedKey)
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, Role::Leaf | Role::EmptyLeaf | Role::CachedRemoteLeaf)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::Internal => "internal",
            Role::Boundary => "boundary",
            Role::Leaf => "leaf",
            Role::EmptyLeaf => "empty_leaf",
            Role::Remote => "remote",
            Role::RemoteAboveOwnedKey => "remote_above_owned_key",
            Role::CachedRemote => "cached_remote",
            Role::CachedRemoteLeaf => "cached_remote_leaf",
            Role::CachedBoundary => "cached_boundary",
        };
        f.write_str(name)
    }
}

/// A simulation particle. `key` is its deepest path-encoded address.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Global input order, stable across iterations.
    pub order: u64,
    pub key: Key,
    pub mass: f64,
    pub position: [f64; 3],
}

impl Particle {
    pub fn new(order: u64, key: Key, mass: f64, position: [f64; 3]) -> Self {
        Self {
            order,
            key,
            mass,
            position,
        }
    }
}
