//! In-process transport
//!
//! One unbounded tokio channel per location plus one for the canopy host.
//! Each channel is reliable and FIFO, which is all the cache protocol
//! assumes of its transport.

use crate::host::CanopyInbound;
use arbor_cache::Transport;
use arbor_core::{Data, Endpoint, Error, LocationId, Result, Wire};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

pub struct Mesh<D: Data> {
    locations: Vec<mpsc::UnboundedSender<Wire<D>>>,
    canopy: mpsc::UnboundedSender<CanopyInbound<D>>,
    sent: AtomicUsize,
}

impl<D: Data> Mesh<D> {
    /// Returns the mesh, one wire inbox per location, and the canopy inbox.
    pub fn new(
        locations: u32,
    ) -> (
        Arc<Self>,
        Vec<mpsc::UnboundedReceiver<Wire<D>>>,
        mpsc::UnboundedReceiver<CanopyInbound<D>>,
    ) {
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..locations).map(|_| mpsc::unbounded_channel()).unzip();
        let (canopy, canopy_rx) = mpsc::unbounded_channel();
        let mesh = Arc::new(Self {
            locations: senders,
            canopy,
            sent: AtomicUsize::new(0),
        });
        (mesh, receivers, canopy_rx)
    }

    pub fn n_locations(&self) -> usize {
        self.locations.len()
    }

    /// Wire messages delivered to an inbox so far.
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }

    /// Queue a command for the canopy host behind any wire traffic already sent.
    pub fn to_canopy(&self, message: CanopyInbound<D>) -> Result<()> {
        self.canopy
            .send(message)
            .map_err(|_| Error::transport("canopy inbox closed"))
    }

    fn location(&self, id: LocationId) -> Result<&mpsc::UnboundedSender<Wire<D>>> {
        self.locations
            .get(id as usize)
            .ok_or_else(|| Error::transport(format!("no location {id}")))
    }
}

impl<D: Data> Transport<D> for Mesh<D> {
    fn send(&self, to: Endpoint, message: Wire<D>) -> Result<()> {
        trace!(to = ?to, kind = message.kind(), "mesh send");
        match to {
            Endpoint::Location(id) => self
                .location(id)?
                .send(message)
                .map_err(|_| Error::transport(format!("location {id} inbox closed")))?,
            Endpoint::Canopy => self.to_canopy(CanopyInbound::Wire(message))?,
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
