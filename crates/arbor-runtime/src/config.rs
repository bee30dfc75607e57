//! Arbor configuration
//!
//! Every tunable lives here. Loaded from TOML at startup; a missing or
//! unreadable file falls back to defaults.

use crate::build::key_levels;
use arbor_cache::CacheConfig;
use arbor_core::{Error, Result};
use arbor_traverse::TraversalKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Largest number of owned roots a decomposition may produce.
const MAX_OWNED_ROOTS: u64 = 1 << 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    /// Tree shape and decomposition.
    pub tree: TreeConfig,
    /// Software cache behaviour.
    pub cache: CacheSection,
    /// Iteration driver.
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Fan-out of every internal node. 2, 4, or 8.
    pub branch_factor: usize,
    /// A node holding more particles than this is split.
    pub max_particles_per_leaf: usize,
    /// Depth of the owned subtree roots.
    pub decomposition_depth: usize,
}

/// Which canopy summaries a cache receives before traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchMode {
    /// One broadcast to every location, optionally truncated by `share_nodes`.
    #[default]
    StarterPack,
    /// Each location asks for the ancestors of its owned roots and their children.
    Parents,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Levels below the requested node shipped in each bundle.
    pub bundle_depth: usize,
    /// Starter pack size limit. 0 broadcasts every canopy summary.
    pub share_nodes: usize,
    pub prefetch: PrefetchMode,
    /// Workers sharing one cache.
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitorKind {
    #[default]
    Gravity,
    Count,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub locations: u32,
    pub iterations: usize,
    pub particles: usize,
    /// Seed for the particle generator.
    pub seed: u64,
    pub traversal: TraversalKind,
    pub visitor: VisitorKind,
    /// Opening angle for the gravity visitor.
    pub theta: f64,
    pub softening: f64,
}

// ============================================================
// Defaults
// ============================================================

impl Default for TreeConfig {
    fn default() -> Self {
        Self { branch_factor: 8, max_particles_per_leaf: 16, decomposition_depth: 2 }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self { bundle_depth: 2, share_nodes: 0, prefetch: PrefetchMode::StarterPack, workers: 1 }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            locations: 4,
            iterations: 1,
            particles: 4096,
            seed: 42,
            traversal: TraversalKind::Down,
            visitor: VisitorKind::Gravity,
            theta: 0.7,
            softening: 1e-3,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl ArborConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                info!("No config at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Strict variant of [`load`](Self::load) for callers that want parse errors.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            branch_factor: self.tree.branch_factor,
            bundle_depth: self.cache.bundle_depth,
            workers: self.cache.workers,
        }
    }

    /// Number of owned roots: `B^decomposition_depth`.
    pub fn owned_roots(&self) -> u64 {
        (self.tree.branch_factor as u64).saturating_pow(self.tree.decomposition_depth as u32)
    }

    /// Hard errors abort; soft problems are logged and execution continues.
    pub fn validate(&self) -> Result<()> {
        let b = self.tree.branch_factor;
        if b < 2 {
            return Err(Error::config(format!("branch factor {b} is below 2")));
        }
        let levels = key_levels(b)?;
        if self.tree.decomposition_depth > levels {
            return Err(Error::config(format!(
                "decomposition depth {} exceeds the {levels} key levels of branch factor {b}",
                self.tree.decomposition_depth
            )));
        }
        let roots = self.owned_roots();
        if roots > MAX_OWNED_ROOTS {
            return Err(Error::config(format!(
                "decomposition depth {} gives {roots} owned roots",
                self.tree.decomposition_depth
            )));
        }
        if self.tree.max_particles_per_leaf == 0 {
            return Err(Error::config("max_particles_per_leaf must be at least 1"));
        }
        if self.cache.bundle_depth == 0 {
            return Err(Error::config("bundle depth must be at least 1"));
        }
        let locations = self.simulation.locations;
        if locations == 0 {
            return Err(Error::config("at least one location is required"));
        }
        if locations > 1 && self.tree.decomposition_depth == 0 {
            return Err(Error::config(format!(
                "{locations} locations cannot share a single owned root"
            )));
        }

        if u64::from(locations) > roots {
            warn!(locations, roots, "more locations than owned roots, some will own nothing");
        }
        let per_location = self.simulation.particles / locations as usize;
        if per_location < self.tree.max_particles_per_leaf {
            warn!(
                per_location,
                max_per_leaf = self.tree.max_particles_per_leaf,
                "fewer particles per location than fit in one leaf"
            );
        }
        if self.cache.prefetch == PrefetchMode::StarterPack && self.cache.share_nodes == 0 {
            info!("share_nodes unset, broadcasting every canopy summary");
        }
        if self.cache.workers == 0 {
            warn!("cache.workers is 0, running with one worker");
        }
        if !(0.0..=2.0).contains(&self.simulation.theta) {
            warn!(theta = self.simulation.theta, "opening angle outside [0, 2]");
        }
        Ok(())
    }
}
