//! Arbor - run the distributed tree-walk over an in-process mesh
//!
//! Usage:
//!   arbor --locations 8 --particles 100000 --traversal up_and_down
//!   arbor --dump-config > arbor.toml

use arbor::{
    ArborConfig, CentroidData, CountVisitor, GravityVisitor, IterationReport, Simulation,
    TraversalKind, VisitorKind, DEFAULT_LOG_FILTER,
};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "arbor", about = "Distributed tree-code cache and traversal driver")]
struct Cli {
    /// Path to config file (TOML)
    #[arg(long, default_value = "arbor.toml")]
    config: PathBuf,

    /// Dump the effective config as TOML and exit
    #[arg(long)]
    dump_config: bool,

    /// Number of locations
    #[arg(long)]
    locations: Option<u32>,

    /// Number of iterations
    #[arg(long)]
    iterations: Option<usize>,

    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,

    /// Traversal kind: down, up_and_down, or dual
    #[arg(long)]
    traversal: Option<TraversalKind>,

    /// Seed for the particle generator
    #[arg(long)]
    seed: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut ArborConfig) {
        let sim = &mut config.simulation;
        if let Some(v) = self.locations {
            sim.locations = v;
        }
        if let Some(v) = self.iterations {
            sim.iterations = v;
        }
        if let Some(v) = self.particles {
            sim.particles = v;
        }
        if let Some(v) = self.traversal {
            sim.traversal = v;
        }
        if let Some(v) = self.seed {
            sim.seed = v;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = ArborConfig::load(&cli.config);
    cli.apply(&mut config);

    if cli.dump_config {
        println!("{}", config.to_toml());
        return Ok(());
    }
    config.validate()?;

    let sim = config.simulation.clone();
    match sim.visitor {
        VisitorKind::Gravity => {
            let visitor = GravityVisitor::new(sim.theta, sim.softening);
            let reports = Simulation::<CentroidData, _>::new(config, visitor).run().await?;
            summarize(&reports);
        }
        VisitorKind::Count => {
            let reports = Simulation::<CentroidData, _>::new(config, CountVisitor::exhaustive())
                .run()
                .await?;
            summarize(&reports);
            for report in &reports {
                if let Some((key, out)) = report
                    .outputs()
                    .find(|(_, out)| out.particles != sim.particles)
                {
                    anyhow::bail!(
                        "iteration {}: target {} saw {} of {} particles",
                        report.iteration,
                        key,
                        out.particles,
                        sim.particles
                    );
                }
            }
            info!("every target accounted for every particle");
        }
    }
    Ok(())
}

fn summarize<O>(reports: &[IterationReport<O>]) {
    for r in reports {
        println!(
            "iteration {}: {} targets, {} node / {} leaf interactions, {} fetches, \
             build {:?}, load {:?}, traverse {:?}",
            r.iteration,
            r.targets(),
            r.counts.node_interactions,
            r.counts.leaf_interactions,
            r.fetches(),
            r.timings.build,
            r.timings.cache_loading,
            r.timings.traversal,
        );
    }
}
