//! Arbor Runtime - configuration, in-process mesh, tree build, and the
//! per-iteration driver

pub mod build;
pub mod config;
pub mod host;
pub mod location;
pub mod mesh;
pub mod simulation;

pub use build::{key_for, key_levels, uniform_particles, Decomposition, LocalTree, TreeBuilder};
pub use config::{ArborConfig, CacheSection, PrefetchMode, SimulationConfig, TreeConfig, VisitorKind};
pub use host::{CanopyCommand, CanopyHost, CanopyInbound, Fault, FaultSource};
pub use location::{Command, Location, LocationReport};
pub use mesh::Mesh;
pub use simulation::{IterationReport, PhaseTimings, Simulation};
