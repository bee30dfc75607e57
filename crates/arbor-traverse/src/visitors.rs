//! Stock visitors

use crate::visitor::{Opening, Visitor};
use arbor_cache::Node;
use arbor_core::{CentroidData, Data};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Counting
// ---------------------------------------------------------------------------

/// Tally of what reached one target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountOutput {
    /// Source particles accounted for, through summaries or directly.
    pub particles: usize,
    pub node_interactions: usize,
    pub leaf_interactions: usize,
}

/// Opens every source shallower than `accept_depth` and accepts the rest.
///
/// Whatever the depth, every target accounts for every particle exactly
/// once, which makes this the reference check for traversal coverage.
#[derive(Clone, Copy, Debug)]
pub struct CountVisitor {
    pub accept_depth: usize,
}

impl CountVisitor {
    /// Never accepts a summary; every interaction is particle-particle.
    pub fn exhaustive() -> Self {
        Self {
            accept_depth: usize::MAX,
        }
    }

    pub fn accepting_from(depth: usize) -> Self {
        Self {
            accept_depth: depth,
        }
    }
}

impl Default for CountVisitor {
    fn default() -> Self {
        Self::exhaustive()
    }
}

impl<D: Data> Visitor<D> for CountVisitor {
    type Output = CountOutput;

    fn output(&self, _target: &Node<D>) -> CountOutput {
        CountOutput::default()
    }

    fn open(&self, source: &Node<D>, _target: &Node<D>) -> Opening {
        if source.depth() >= self.accept_depth {
            Opening::Accept
        } else if source.is_leaf() {
            Opening::Leaf
        } else {
            Opening::Open
        }
    }

    fn node(&self, output: &mut CountOutput, source: &Node<D>, _target: &Node<D>) {
        output.particles += source.n_particles();
        output.node_interactions += 1;
    }

    fn leaf(&self, output: &mut CountOutput, source: &Node<D>, _target: &Node<D>) {
        output.particles += source.particles().len();
        output.leaf_interactions += 1;
    }
}

// ---------------------------------------------------------------------------
// Gravity
// ---------------------------------------------------------------------------

/// Barnes-Hut style monopole gravity over [`CentroidData`].
///
/// Output is one acceleration per target particle, in the leaf's particle
/// order.
#[derive(Clone, Copy, Debug)]
pub struct GravityVisitor {
    /// Opening angle; a source is accepted when `size < theta * distance`.
    pub theta: f64,
    pub softening: f64,
}

impl GravityVisitor {
    pub fn new(theta: f64, softening: f64) -> Self {
        Self { theta, softening }
    }

    fn pull(&self, acc: &mut [f64; 3], at: [f64; 3], from: [f64; 3], mass: f64) {
        let dx = [from[0] - at[0], from[1] - at[1], from[2] - at[2]];
        let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + self.softening * self.softening;
        if r2 == 0.0 {
            return;
        }
        let scale = mass / (r2 * r2.sqrt());
        for d in 0..3 {
            acc[d] += dx[d] * scale;
        }
    }
}

impl Default for GravityVisitor {
    fn default() -> Self {
        Self::new(0.7, 1e-3)
    }
}

impl Visitor<CentroidData> for GravityVisitor {
    type Output = Vec<[f64; 3]>;

    fn output(&self, target: &Node<CentroidData>) -> Self::Output {
        vec![[0.0; 3]; target.particles().len()]
    }

    fn open(&self, source: &Node<CentroidData>, target: &Node<CentroidData>) -> Opening {
        let data = source.data();
        if data.is_empty() {
            return Opening::Accept;
        }
        let fallback = if source.is_leaf() {
            Opening::Leaf
        } else {
            Opening::Open
        };
        let (Some(centroid), Some(source_box), Some(target_box)) =
            (data.centroid(), data.bounds, target.data().bounds)
        else {
            return fallback;
        };
        let distance = target_box.distance_to(centroid);
        if source_box.size() < self.theta * distance {
            Opening::Accept
        } else {
            fallback
        }
    }

    fn node(
        &self,
        output: &mut Self::Output,
        source: &Node<CentroidData>,
        target: &Node<CentroidData>,
    ) {
        let Some(centroid) = source.data().centroid() else {
            return;
        };
        let mass = source.data().mass;
        let particles = target.particles();
        for (acc, p) in output.iter_mut().zip(particles.as_slice()) {
            self.pull(acc, p.position, centroid, mass);
        }
    }

    fn leaf(
        &self,
        output: &mut Self::Output,
        source: &Node<CentroidData>,
        target: &Node<CentroidData>,
    ) {
        let sources = source.particles();
        let targets = target.particles();
        for (acc, p) in output.iter_mut().zip(targets.as_slice()) {
            for q in sources.as_slice() {
                if q.order != p.order {
                    self.pull(acc, p.position, q.position, q.mass);
                }
            }
        }
    }
}
