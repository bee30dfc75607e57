//! Arbor Cache - per-location software cache for a distributed tree
//!
//! Holds the mirror graph each location traverses, the canopy roll-up that
//! summarizes the top of the tree, and the resumer that parks traversal work
//! on unresolved placeholders.

pub mod cache;
pub mod canopy;
pub mod node;
pub mod resumer;
pub mod sync;
pub mod transport;

pub use cache::{CacheConfig, CacheManager, CacheStats};
pub use canopy::{Collector, TreeCanopy};
pub use node::{Node, Particles};
pub use resumer::{Continuation, Registration, ResumeAt, ResumeSink, Resumer, TraversalId};
pub use transport::{Outbox, Transport};
