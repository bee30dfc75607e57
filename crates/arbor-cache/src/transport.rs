//! Outbound message seam
//!
//! The cache and canopy never talk to a socket or channel directly; they
//! hand envelopes to a [`Transport`]. Delivery is asynchronous: `send` must
//! not call back into the sender.

use crate::sync;
use arbor_core::{Data, Endpoint, Result, Wire};
use std::sync::Mutex;

pub trait Transport<D: Data>: Send + Sync {
    fn send(&self, to: Endpoint, message: Wire<D>) -> Result<()>;
}

/// Transport that records envelopes instead of delivering them.
///
/// Useful for driving caches by hand: collect what one side sent, then feed
/// it to the other.
pub struct Outbox<D: Data> {
    sent: Mutex<Vec<(Endpoint, Wire<D>)>>,
}

impl<D: Data> Default for Outbox<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Data> Outbox<D> {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Take everything sent so far, oldest first.
    pub fn drain(&self) -> Vec<(Endpoint, Wire<D>)> {
        std::mem::take(&mut *sync::lock(&self.sent))
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.sent).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<D: Data> Transport<D> for Outbox<D> {
    fn send(&self, to: Endpoint, message: Wire<D>) -> Result<()> {
        sync::lock(&self.sent).push((to, message));
        Ok(())
    }
}
