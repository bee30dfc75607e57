//! Iteration driver
//!
//! Each iteration runs the same phases: build, canopy roll-up, cache
//! loading, traversal, collection, and teardown. Every phase is a barrier:
//! the driver waits for each location to acknowledge before starting the
//! next. A fault from any task aborts the run.

use crate::build::{uniform_particles, Decomposition};
use crate::config::{ArborConfig, PrefetchMode};
use crate::host::{CanopyCommand, CanopyHost, CanopyInbound, Fault};
use crate::location::{Command, Location, LocationReport};
use crate::mesh::Mesh;
use arbor_cache::{Transport, TreeCanopy};
use arbor_core::{Data, Error, Key, Particle, Result};
use arbor_traverse::{Counts, Visitor};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Wall time spent in each phase of one iteration.
#[derive(Clone, Copy, Debug, Default)]
pub struct PhaseTimings {
    pub build: Duration,
    pub rollup: Duration,
    pub cache_loading: Duration,
    pub traversal: Duration,
}

#[derive(Clone, Debug)]
pub struct IterationReport<O> {
    pub iteration: usize,
    pub canopy_vertices: usize,
    /// Summed over locations.
    pub counts: Counts,
    pub locations: Vec<LocationReport<O>>,
    pub timings: PhaseTimings,
}

impl<O> IterationReport<O> {
    pub fn targets(&self) -> usize {
        self.locations.iter().map(|l| l.targets).sum()
    }

    pub fn fetches(&self) -> usize {
        self.locations.iter().map(|l| l.stats.fetches_sent).sum()
    }

    /// Every target output of the iteration.
    pub fn outputs(&self) -> impl Iterator<Item = &(Key, O)> {
        self.locations.iter().flat_map(|l| l.outputs.iter())
    }
}

pub struct Simulation<D: Data, V: Visitor<D>> {
    config: ArborConfig,
    visitor: Arc<V>,
    particles: Option<Vec<Particle>>,
    _data: PhantomData<fn() -> D>,
}

impl<D: Data, V: Visitor<D>> Simulation<D, V> {
    pub fn new(config: ArborConfig, visitor: V) -> Self {
        Self {
            config,
            visitor: Arc::new(visitor),
            particles: None,
            _data: PhantomData,
        }
    }

    /// Use `particles` instead of the seeded uniform distribution.
    pub fn with_particles(mut self, particles: Vec<Particle>) -> Self {
        self.particles = Some(particles);
        self
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    /// Spawn the canopy host and every location, run all iterations, and
    /// shut everything down. Must be called inside a tokio runtime.
    pub async fn run(self) -> Result<Vec<IterationReport<V::Output>>> {
        self.config.validate()?;
        let tree = &self.config.tree;
        let sim = &self.config.simulation;
        let decomposition =
            Decomposition::new(tree.branch_factor, tree.decomposition_depth, sim.locations)?;
        let particles = match &self.particles {
            Some(particles) => particles.clone(),
            None => uniform_particles(sim.particles, sim.seed, tree.branch_factor)?,
        };
        let parts = decomposition.partition(&particles)?;

        let mut driver = Driver::<D, V::Output>::spawn(&self.config, &self.visitor)?;
        info!(
            locations = sim.locations,
            particles = particles.len(),
            traversal = %sim.traversal,
            "simulation started"
        );

        let outcome: Result<Vec<_>> = async {
            let owners = decomposition
                .roots()
                .map(|k| (k, decomposition.owner(k)))
                .collect();
            driver
                .canopy(|reply| CanopyCommand::RegisterOwners { owners, reply })
                .await?;
            let mut reports = Vec::new();
            for iteration in 0..sim.iterations {
                reports.push(driver.iteration(&self.config, iteration, &parts).await?);
            }
            Ok(reports)
        }
        .await;

        driver.shutdown().await;
        outcome
    }
}

struct Driver<D: Data, O> {
    mesh: Arc<Mesh<D>>,
    commands: Vec<mpsc::UnboundedSender<Command<D, O>>>,
    faults: mpsc::UnboundedReceiver<Fault>,
    // Held so `faults` never reports closed while tasks are alive.
    _fault_tx: mpsc::UnboundedSender<Fault>,
    handles: Vec<JoinHandle<()>>,
}

impl<D: Data, O: Clone + Send + 'static> Driver<D, O> {
    fn spawn<V: Visitor<D, Output = O>>(config: &ArborConfig, visitor: &Arc<V>) -> Result<Self> {
        let (mesh, inboxes, canopy_inbox) = Mesh::new(config.simulation.locations);
        let (fault_tx, faults) = mpsc::unbounded_channel();

        let transport: Arc<dyn Transport<D>> = mesh.clone();
        let canopy = TreeCanopy::new(config.tree.branch_factor, transport);
        let host = CanopyHost::new(canopy, canopy_inbox, fault_tx.clone());

        let mut commands = Vec::new();
        let mut locations = Vec::new();
        for (id, wire) in inboxes.into_iter().enumerate() {
            let (tx, rx) = mpsc::unbounded_channel();
            locations.push(Location::new(
                id as u32,
                config,
                Arc::clone(&mesh),
                Arc::clone(visitor),
                wire,
                rx,
                fault_tx.clone(),
            )?);
            commands.push(tx);
        }
        let mut handles = vec![tokio::spawn(host.run())];
        handles.extend(locations.into_iter().map(|l| tokio::spawn(l.run())));
        Ok(Self {
            mesh,
            commands,
            faults,
            _fault_tx: fault_tx,
            handles,
        })
    }

    async fn iteration(
        &mut self,
        config: &ArborConfig,
        iteration: usize,
        parts: &[Vec<Particle>],
    ) -> Result<IterationReport<O>> {
        let mut timings = PhaseTimings::default();

        let started = Instant::now();
        let roots: usize = self
            .broadcast(|i, reply| Command::Build {
                particles: parts[i].clone(),
                reply,
            })
            .await?
            .into_iter()
            .sum();
        timings.build = started.elapsed();
        info!(iteration, roots, elapsed = ?timings.build, "build phase done");

        let started = Instant::now();
        let canopy_vertices = self
            .canopy(|reply| CanopyCommand::AwaitRollup { reply })
            .await?;
        timings.rollup = started.elapsed();
        info!(iteration, canopy_vertices, elapsed = ?timings.rollup, "canopy roll-up done");

        let started = Instant::now();
        let restored = self.load_caches(config).await?;
        timings.cache_loading = started.elapsed();
        info!(iteration, restored, elapsed = ?timings.cache_loading, "cache loading done");

        let started = Instant::now();
        self.broadcast(|_, reply| Command::Traverse { reply }).await?;
        timings.traversal = started.elapsed();

        let locations = self
            .broadcast(|_, reply| Command::Collect { reply })
            .await?;
        let mut counts = Counts::default();
        for report in &locations {
            counts += report.counts;
        }
        info!(
            iteration,
            node_interactions = counts.node_interactions,
            leaf_interactions = counts.leaf_interactions,
            opens = counts.opens,
            closes = counts.closes,
            suspensions = counts.suspensions,
            messages = self.mesh.sent(),
            elapsed = ?timings.traversal,
            "traversal done"
        );

        self.broadcast(|_, reply| Command::EndIteration { reply })
            .await?;
        self.canopy(|reply| CanopyCommand::Reset { reply }).await?;

        Ok(IterationReport {
            iteration,
            canopy_vertices,
            counts,
            locations,
            timings,
        })
    }

    async fn load_caches(&mut self, config: &ArborConfig) -> Result<usize> {
        let restored: Vec<usize> = match config.cache.prefetch {
            PrefetchMode::StarterPack => {
                let limit = (config.cache.share_nodes > 0).then_some(config.cache.share_nodes);
                let pack = self
                    .canopy(|reply| CanopyCommand::StarterPack { limit, reply })
                    .await?;
                self.broadcast(|_, reply| Command::LoadCache {
                    pack: pack.clone(),
                    reply,
                })
                .await?
            }
            PrefetchMode::Parents => {
                let wanted = self
                    .broadcast(|_, reply| Command::PrefetchKeys { reply })
                    .await?;
                let mut packs = Vec::with_capacity(wanted.len());
                for keys in wanted {
                    packs.push(
                        self.canopy(|reply| CanopyCommand::Select { keys, reply })
                            .await?,
                    );
                }
                let mut packs = packs.into_iter();
                self.broadcast(|_, reply| Command::LoadCache {
                    pack: packs.next().unwrap_or_default(),
                    reply,
                })
                .await?
            }
        };
        Ok(restored.into_iter().sum())
    }

    /// Send one command per location, then wait for every reply in order.
    async fn broadcast<T>(
        &mut self,
        mut make: impl FnMut(usize, oneshot::Sender<T>) -> Command<D, O>,
    ) -> Result<Vec<T>> {
        let mut pending = Vec::with_capacity(self.commands.len());
        for (i, tx) in self.commands.iter().enumerate() {
            let (reply, rx) = oneshot::channel();
            tx.send(make(i, reply))
                .map_err(|_| Error::transport(format!("location {i} command inbox closed")))?;
            pending.push(rx);
        }
        let mut out = Vec::with_capacity(pending.len());
        for (i, rx) in pending.into_iter().enumerate() {
            out.push(self.wait(rx, &format!("location {i}")).await?);
        }
        Ok(out)
    }

    async fn canopy<T>(
        &mut self,
        make: impl FnOnce(oneshot::Sender<T>) -> CanopyCommand<D>,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.mesh.to_canopy(CanopyInbound::Command(make(reply)))?;
        self.wait(rx, "canopy host").await
    }

    async fn wait<T>(&mut self, rx: oneshot::Receiver<T>, from: &str) -> Result<T> {
        tokio::select! {
            biased;
            fault = self.faults.recv() => match fault {
                Some(fault) => {
                    warn!(source = ?fault.source, "run aborted by fault");
                    Err(fault.error)
                }
                None => Err(Error::transport("fault channel closed")),
            },
            reply = rx => reply.map_err(|_| Error::transport(format!("{from} stopped without replying"))),
        }
    }

    async fn shutdown(self) {
        for tx in &self.commands {
            let _ = tx.send(Command::Shutdown);
        }
        let _ = self.mesh.to_canopy(CanopyInbound::Command(CanopyCommand::Shutdown));
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!("task ended abnormally: {}", e);
            }
        }
    }
}
