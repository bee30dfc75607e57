//! Aggregated node summaries
//!
//! The cache and traversal engine only rely on the monoid laws of [`Data`]:
//! `merge` is associative and commutative and `Default` is the identity.
//! [`CentroidData`] is the reference summary used by the stock visitors.

use crate::types::Particle;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A commutative, associative aggregate with `Default` as the empty value.
pub trait Data:
    Clone + Default + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Summary of a leaf's particles.
    fn from_particles(particles: &[Particle]) -> Self;

    /// Fold `other` into `self`.
    fn merge(&mut self, other: &Self);

    fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }
}

/// Axis-aligned box.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lesser: [f64; 3],
    pub greater: [f64; 3],
}

impl BoundingBox {
    pub fn point(p: [f64; 3]) -> Self {
        Self {
            lesser: p,
            greater: p,
        }
    }

    pub fn grow(&mut self, p: [f64; 3]) {
        for dim in 0..3 {
            self.lesser[dim] = self.lesser[dim].min(p[dim]);
            self.greater[dim] = self.greater[dim].max(p[dim]);
        }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        let mut out = *self;
        out.grow(other.lesser);
        out.grow(other.greater);
        out
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.lesser[0] + self.greater[0]),
            0.5 * (self.lesser[1] + self.greater[1]),
            0.5 * (self.lesser[2] + self.greater[2]),
        ]
    }

    /// Longest side.
    pub fn size(&self) -> f64 {
        (0..3)
            .map(|d| self.greater[d] - self.lesser[d])
            .fold(0.0, f64::max)
    }

    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|d| p[d] >= self.lesser[d] && p[d] <= self.greater[d])
    }

    /// Distance from `p` to the nearest point of the box (0 inside).
    pub fn distance_to(&self, p: [f64; 3]) -> f64 {
        let mut sq = 0.0;
        for d in 0..3 {
            let gap = if p[d] < self.lesser[d] {
                self.lesser[d] - p[d]
            } else if p[d] > self.greater[d] {
                p[d] - self.greater[d]
            } else {
                0.0
            };
            sq += gap * gap;
        }
        sq.sqrt()
    }

    /// Distance between the nearest points of two boxes (0 if they overlap).
    pub fn separation(&self, other: &BoundingBox) -> f64 {
        let mut sq = 0.0;
        for d in 0..3 {
            let gap = (other.lesser[d] - self.greater[d])
                .max(self.lesser[d] - other.greater[d])
                .max(0.0);
            sq += gap * gap;
        }
        sq.sqrt()
    }
}

/// Mass, centre of mass, particle count, and extent of a subtree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CentroidData {
    pub mass: f64,
    /// Mass-weighted position sum; `centroid = moment / mass`.
    pub moment: [f64; 3],
    pub count: usize,
    pub bounds: Option<BoundingBox>,
}

impl CentroidData {
    pub fn centroid(&self) -> Option<[f64; 3]> {
        if self.mass > 0.0 {
            Some([
                self.moment[0] / self.mass,
                self.moment[1] / self.mass,
                self.moment[2] / self.mass,
            ])
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Data for CentroidData {
    fn from_particles(particles: &[Particle]) -> Self {
        let mut out = CentroidData::default();
        for p in particles {
            out.mass += p.mass;
            for d in 0..3 {
                out.moment[d] += p.mass * p.position[d];
            }
            out.count += 1;
            match out.bounds.as_mut() {
                Some(b) => b.grow(p.position),
                None => out.bounds = Some(BoundingBox::point(p.position)),
            }
        }
        out
    }

    fn merge(&mut self, other: &Self) {
        self.mass += other.mass;
        for d in 0..3 {
            self.moment[d] += other.moment[d];
        }
        self.count += other.count;
        self.bounds = match (self.bounds, other.bounds) {
            (Some(a), Some(b)) => Some(a.union(&b)),
            (a, b) => a.or(b),
        };
    }
}
