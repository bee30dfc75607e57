//! Per-location event loop
//!
//! A location is the single consumer of two inboxes: wire traffic from the
//! mesh and phase commands from the driver. Cache mutation, resumption, and
//! traversal all run on this task, so a continuation always resumes on the
//! location that parked it.

use crate::build::{Decomposition, TreeBuilder};
use crate::config::ArborConfig;
use crate::host::{Fault, FaultSource};
use crate::mesh::Mesh;
use arbor_cache::{CacheManager, CacheStats, Resumer, Transport};
use arbor_core::{
    CanopySummary, Data, Endpoint, Error, Key, LocationId, Particle, Result, StarterPack, Wire,
};
use arbor_traverse::{Counts, TraversalKind, Traverser, Visitor};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

pub enum Command<D: Data, O> {
    /// Build the owned subtrees and send their contributions to the canopy.
    Build {
        particles: Vec<Particle>,
        reply: oneshot::Sender<usize>,
    },
    LoadCache {
        pack: StarterPack<D>,
        reply: oneshot::Sender<usize>,
    },
    PrefetchKeys { reply: oneshot::Sender<Vec<Key>> },
    /// Answered once every local target has finished.
    Traverse { reply: oneshot::Sender<()> },
    Collect {
        reply: oneshot::Sender<LocationReport<O>>,
    },
    EndIteration { reply: oneshot::Sender<()> },
    Shutdown,
}

/// What one location did during an iteration.
#[derive(Clone, Debug)]
pub struct LocationReport<O> {
    pub location: LocationId,
    pub targets: usize,
    pub counts: Counts,
    pub stats: CacheStats,
    /// Per-target visitor output, in key order.
    pub outputs: Vec<(Key, O)>,
}

pub struct Location<D: Data, V: Visitor<D>> {
    id: LocationId,
    cache: Arc<CacheManager<D>>,
    mesh: Arc<Mesh<D>>,
    builder: TreeBuilder,
    decomposition: Decomposition,
    kind: TraversalKind,
    visitor: Arc<V>,
    traverser: Option<Arc<Traverser<D, V>>>,
    on_complete: Option<oneshot::Sender<()>>,
    wire: mpsc::UnboundedReceiver<Wire<D>>,
    commands: mpsc::UnboundedReceiver<Command<D, V::Output>>,
    faults: mpsc::UnboundedSender<Fault>,
}

impl<D: Data, V: Visitor<D>> Location<D, V> {
    pub fn new(
        id: LocationId,
        config: &ArborConfig,
        mesh: Arc<Mesh<D>>,
        visitor: Arc<V>,
        wire: mpsc::UnboundedReceiver<Wire<D>>,
        commands: mpsc::UnboundedReceiver<Command<D, V::Output>>,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Result<Self> {
        let transport: Arc<dyn Transport<D>> = mesh.clone();
        let cache = CacheManager::new(id, config.cache_config(), Arc::new(Resumer::new()), transport);
        Ok(Self {
            id,
            cache: Arc::new(cache),
            mesh,
            builder: TreeBuilder::new(config.tree.branch_factor, config.tree.max_particles_per_leaf)?,
            decomposition: Decomposition::new(
                config.tree.branch_factor,
                config.tree.decomposition_depth,
                config.simulation.locations,
            )?,
            kind: config.simulation.traversal,
            visitor,
            traverser: None,
            on_complete: None,
            wire,
            commands,
            faults,
        })
    }

    pub fn cache(&self) -> &Arc<CacheManager<D>> {
        &self.cache
    }

    /// Process messages until shutdown or the first protocol violation.
    pub async fn run(mut self) {
        info!(location = self.id, "location started");
        loop {
            let step = tokio::select! {
                message = self.wire.recv() => match message {
                    Some(message) => self.on_wire(message),
                    None => break,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
            };
            if let Err(error) = step {
                error!(location = self.id, %error, "location aborted");
                let _ = self.faults.send(Fault {
                    source: FaultSource::Location(self.id),
                    error,
                });
                break;
            }
            self.check_complete();
        }
        info!(location = self.id, "location stopped");
    }

    fn on_wire(&mut self, message: Wire<D>) -> Result<()> {
        match message {
            Wire::Fetch(request) => self.cache.request_nodes(request),
            Wire::Bundle(bundle) => self.cache.add_cache(bundle),
            Wire::Summary(summary) => self.cache.restore_data(summary),
            other => Err(Error::transport(format!(
                "location {} cannot handle {}",
                self.id,
                other.kind()
            ))),
        }
    }

    fn on_command(&mut self, command: Command<D, V::Output>) -> Result<()> {
        match command {
            Command::Build { particles, reply } => {
                let roots = self.build(particles)?;
                let _ = reply.send(roots);
            }
            Command::LoadCache { pack, reply } => {
                let restored = self.cache.recv_starter_pack(pack)?;
                let _ = reply.send(restored);
            }
            Command::PrefetchKeys { reply } => {
                let _ = reply.send(self.cache.prefetch_keys());
            }
            Command::Traverse { reply } => {
                self.traverse()?;
                self.on_complete = Some(reply);
            }
            Command::Collect { reply } => {
                let _ = reply.send(self.report());
            }
            Command::EndIteration { reply } => {
                self.traverser = None;
                self.cache.destroy(true);
                self.cache.resumer().reset();
                debug!(location = self.id, "iteration state cleared");
                let _ = reply.send(());
            }
            Command::Shutdown => {}
        }
        Ok(())
    }

    fn build(&mut self, particles: Vec<Particle>) -> Result<usize> {
        let owned = self.decomposition.owned_by(self.id);
        let tree = self.builder.build::<D>(self.id, particles, &owned)?;
        for root in &tree.roots {
            self.cache.connect(Arc::clone(root), false)?;
            self.mesh.send(
                Endpoint::Canopy,
                Wire::Contribution(CanopySummary::new(root.key(), root.snapshot())),
            )?;
        }
        info!(
            location = self.id,
            roots = tree.roots.len(),
            particles = tree.buffer.len(),
            "build complete"
        );
        Ok(tree.roots.len())
    }

    fn traverse(&mut self) -> Result<()> {
        let targets = self
            .cache
            .local_roots()
            .iter()
            .flat_map(|root| root.leaves())
            .collect();
        let traverser = Traverser::new(
            self.kind,
            Arc::clone(&self.visitor),
            Arc::clone(&self.cache),
            targets,
        );
        traverser.start()?;
        self.traverser = Some(traverser);
        Ok(())
    }

    fn check_complete(&mut self) {
        let done = self.traverser.as_ref().is_some_and(|t| t.is_complete());
        if done {
            if let Some(reply) = self.on_complete.take() {
                debug!(location = self.id, "traversal complete");
                let _ = reply.send(());
            }
        }
    }

    fn report(&self) -> LocationReport<V::Output> {
        let stats = self.cache.stats();
        match &self.traverser {
            Some(t) => LocationReport {
                location: self.id,
                targets: t.n_targets(),
                counts: t.counts(),
                stats,
                outputs: t.outputs(),
            },
            None => LocationReport {
                location: self.id,
                targets: 0,
                counts: Counts::default(),
                stats,
                outputs: Vec::new(),
            },
        }
    }
}
