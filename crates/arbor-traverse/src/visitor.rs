//! Physics seam: opening decisions and interaction accumulation

use arbor_cache::Node;
use arbor_core::Data;

/// Outcome of comparing a source against a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opening {
    /// The source summary is good enough; interact with it as a whole.
    Accept,
    /// Descend into the source's children.
    Open,
    /// Interact directly with the source's particles.
    Leaf,
}

pub trait Visitor<D: Data>: Send + Sync + 'static {
    /// Per-target accumulator.
    type Output: Clone + Send + 'static;

    fn output(&self, target: &Node<D>) -> Self::Output;

    fn open(&self, source: &Node<D>, target: &Node<D>) -> Opening;

    /// Accumulate an accepted source summary into a target leaf.
    fn node(&self, output: &mut Self::Output, source: &Node<D>, target: &Node<D>);

    /// Particle-particle interaction between a source leaf and a target leaf.
    fn leaf(&self, output: &mut Self::Output, source: &Node<D>, target: &Node<D>);

    /// Up-and-down walks stop climbing once this returns true for an ancestor.
    /// Sources outside that ancestor are then reached top-down from the root.
    fn stop_ascent(&self, _ancestor: &Node<D>, _target: &Node<D>) -> bool {
        false
    }
}
