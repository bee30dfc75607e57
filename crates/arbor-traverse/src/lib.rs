//! Arbor Traverse - asynchronous tree walks over the location cache
//!
//! A traversal pairs every local target leaf with the sources a [`Visitor`]
//! decides to visit. Placeholders on the way suspend only the affected
//! target; the rest of the walk continues.

pub mod traverser;
pub mod visitor;
pub mod visitors;

pub use traverser::{Counts, TraversalKind, Traverser};
pub use visitor::{Opening, Visitor};
pub use visitors::{CountOutput, CountVisitor, GravityVisitor};
