//! Canopy host
//!
//! Owns the canopy vertices and the collector. Contributions and canopy
//! fetches arrive on the same inbox as driver commands, so a command sent
//! after a phase barrier is handled after every contribution of that phase.

use arbor_cache::{Collector, TreeCanopy};
use arbor_core::{CanopySummary, Data, Error, Key, LocationId, Result, StarterPack, Wire};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Where a fatal error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultSource {
    Location(LocationId),
    Canopy,
}

/// A protocol violation that stopped a task.
#[derive(Debug)]
pub struct Fault {
    pub source: FaultSource,
    pub error: Error,
}

pub enum CanopyInbound<D: Data> {
    Wire(Wire<D>),
    Command(CanopyCommand<D>),
}

pub enum CanopyCommand<D: Data> {
    RegisterOwners {
        owners: Vec<(Key, LocationId)>,
        reply: oneshot::Sender<()>,
    },
    /// Answered once every contribution queued ahead of it is folded in.
    AwaitRollup { reply: oneshot::Sender<usize> },
    StarterPack {
        limit: Option<usize>,
        reply: oneshot::Sender<StarterPack<D>>,
    },
    Select {
        keys: Vec<Key>,
        reply: oneshot::Sender<StarterPack<D>>,
    },
    Reset { reply: oneshot::Sender<()> },
    Shutdown,
}

pub struct CanopyHost<D: Data> {
    canopy: TreeCanopy<D>,
    collector: Collector<D>,
    inbox: mpsc::UnboundedReceiver<CanopyInbound<D>>,
    faults: mpsc::UnboundedSender<Fault>,
}

impl<D: Data> CanopyHost<D> {
    pub fn new(
        canopy: TreeCanopy<D>,
        inbox: mpsc::UnboundedReceiver<CanopyInbound<D>>,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Self {
        Self {
            canopy,
            collector: Collector::new(),
            inbox,
            faults,
        }
    }

    pub async fn run(mut self) {
        info!("canopy host started");
        while let Some(message) = self.inbox.recv().await {
            let step = match message {
                CanopyInbound::Wire(wire) => self.on_wire(wire),
                CanopyInbound::Command(CanopyCommand::Shutdown) => break,
                CanopyInbound::Command(command) => {
                    self.on_command(command);
                    Ok(())
                }
            };
            if let Err(error) = step {
                error!(%error, "canopy host aborted");
                let _ = self.faults.send(Fault {
                    source: FaultSource::Canopy,
                    error,
                });
                break;
            }
        }
        info!("canopy host stopped");
    }

    fn on_wire(&self, wire: Wire<D>) -> Result<()> {
        match wire {
            Wire::Contribution(CanopySummary { key, snapshot }) => {
                let Some(parent) = key.parent(self.canopy.branch_factor()) else {
                    debug!(key = %key, "contribution from the global root ignored");
                    return Ok(());
                };
                for (vertex, summary) in self.canopy.recv_data(parent, snapshot)? {
                    self.collector.recv(vertex, summary);
                }
                Ok(())
            }
            Wire::CanopyFetch(request) => self.canopy.request_data(request.key, request.requester),
            other => Err(Error::transport(format!(
                "canopy host cannot handle {}",
                other.kind()
            ))),
        }
    }

    fn on_command(&self, command: CanopyCommand<D>) {
        match command {
            CanopyCommand::RegisterOwners { owners, reply } => {
                for (key, owner) in owners {
                    self.canopy.register_owner(key, owner);
                }
                let _ = reply.send(());
            }
            CanopyCommand::AwaitRollup { reply } => {
                debug!(vertices = self.collector.len(), "canopy roll-up complete");
                let _ = reply.send(self.collector.len());
            }
            CanopyCommand::StarterPack { limit, reply } => {
                let pack = self.collector.starter_pack(limit);
                if let Some(limit) = limit {
                    if pack.len() < self.collector.len() {
                        info!(shared = pack.len(), limit, "starter pack truncated");
                    }
                }
                let _ = reply.send(pack);
            }
            CanopyCommand::Select { keys, reply } => {
                let _ = reply.send(self.collector.select(&keys));
            }
            CanopyCommand::Reset { reply } => {
                self.canopy.reset();
                self.collector.clear();
                let _ = reply.send(());
            }
            CanopyCommand::Shutdown => warn!("shutdown handled by the run loop"),
        }
    }
}
