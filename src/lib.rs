//! Arbor - a distributed tree-code software cache and traversal engine
//!
//! Re-exports the member crates so the binary and integration tests share
//! one path.

pub use arbor_cache::{CacheConfig, CacheManager, CacheStats, Node, Resumer, TreeCanopy};
pub use arbor_core::{CentroidData, Data, Error, Key, Particle, Result};
pub use arbor_runtime::{
    ArborConfig, IterationReport, LocationReport, PrefetchMode, Simulation, VisitorKind,
};
pub use arbor_traverse::{
    CountOutput, CountVisitor, Counts, GravityVisitor, TraversalKind, Traverser, Visitor,
};

/// Log filter used when `RUST_LOG` is unset: every workspace crate at info.
pub const DEFAULT_LOG_FILTER: &str =
    "arbor=info,arbor_core=info,arbor_cache=info,arbor_traverse=info,arbor_runtime=info";
