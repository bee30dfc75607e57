//! End-to-end tests: full iterations over the in-process mesh.
//!
//! Each test runs build, canopy roll-up, cache loading, and traversal on
//! every location, then checks the per-target results against what a
//! single location computes on its own.

use arbor::*;
use std::collections::HashMap;
use std::time::Duration;

const PARTICLES: usize = 400;

fn config(locations: u32, traversal: TraversalKind) -> ArborConfig {
    let mut config = ArborConfig::default();
    config.tree.decomposition_depth = 2;
    config.tree.max_particles_per_leaf = 6;
    config.simulation.locations = locations;
    config.simulation.particles = PARTICLES;
    config.simulation.traversal = traversal;
    config.simulation.seed = 17;
    config
}

async fn run<V: Visitor<CentroidData>>(
    config: ArborConfig,
    visitor: V,
) -> Vec<IterationReport<V::Output>> {
    let sim = Simulation::<CentroidData, _>::new(config, visitor);
    tokio::time::timeout(Duration::from_secs(60), sim.run())
        .await
        .expect("simulation stalled")
        .expect("simulation failed")
}

fn assert_counted(report: &IterationReport<CountOutput>) {
    let mut targets = 0;
    for (key, out) in report.outputs() {
        assert_eq!(out.particles, PARTICLES, "target {key}");
        targets += 1;
    }
    assert_eq!(targets, report.targets());
    assert!(targets > 0);
}

// ============================================================
// Coverage per traversal kind and prefetch mode
// ============================================================

#[tokio::test]
async fn every_kind_counts_every_particle() {
    for kind in [TraversalKind::Down, TraversalKind::UpAndDown, TraversalKind::Dual] {
        let reports = run(config(4, kind), CountVisitor::exhaustive()).await;
        assert_counted(&reports[0]);
    }
}

#[tokio::test]
async fn accepted_summaries_count_every_particle() {
    for kind in [TraversalKind::Down, TraversalKind::UpAndDown, TraversalKind::Dual] {
        let reports = run(config(3, kind), CountVisitor::accepting_from(2)).await;
        assert_counted(&reports[0]);
        assert!(reports[0].counts.node_interactions > 0);
    }
}

#[tokio::test]
async fn parent_prefetch_counts_every_particle() {
    let mut cfg = config(4, TraversalKind::UpAndDown);
    cfg.cache.prefetch = PrefetchMode::Parents;
    let reports = run(cfg, CountVisitor::exhaustive()).await;
    assert_counted(&reports[0]);
}

#[tokio::test]
async fn truncated_starter_pack_fetches_the_rest() {
    let full = run(config(4, TraversalKind::Down), CountVisitor::exhaustive()).await;
    let mut cfg = config(4, TraversalKind::Down);
    cfg.cache.share_nodes = 1;
    let truncated = run(cfg, CountVisitor::exhaustive()).await;
    assert_counted(&truncated[0]);
    assert!(truncated[0].fetches() > full[0].fetches());
}

#[tokio::test]
async fn repeated_iterations_give_identical_results() {
    let mut cfg = config(3, TraversalKind::Down);
    cfg.simulation.iterations = 3;
    let reports = run(cfg, CountVisitor::exhaustive()).await;
    assert_eq!(reports.len(), 3);
    for report in &reports {
        assert_counted(report);
        assert_eq!(report.counts, reports[0].counts);
        assert_eq!(report.fetches(), reports[0].fetches());
        assert_eq!(report.canopy_vertices, 1 + 8);
    }
}

#[tokio::test]
async fn shared_cache_with_workers() {
    let mut cfg = config(2, TraversalKind::Down);
    cfg.cache.workers = 4;
    let reports = run(cfg, CountVisitor::exhaustive()).await;
    assert_counted(&reports[0]);
}

#[tokio::test]
async fn more_locations_than_roots() {
    let mut cfg = config(12, TraversalKind::Down);
    cfg.tree.decomposition_depth = 1;
    let reports = run(cfg, CountVisitor::exhaustive()).await;
    assert_counted(&reports[0]);
    let idle = reports[0].locations.iter().filter(|l| l.targets == 0).count();
    assert_eq!(idle, 4);
}

// ============================================================
// Gravity against a single location
// ============================================================

fn by_key(report: &IterationReport<Vec<[f64; 3]>>) -> HashMap<Key, Vec<[f64; 3]>> {
    report.outputs().cloned().collect()
}

fn assert_same(got: &HashMap<Key, Vec<[f64; 3]>>, want: &HashMap<Key, Vec<[f64; 3]>>) {
    assert_eq!(got.len(), want.len());
    for (key, accs) in want {
        let other = &got[key];
        assert_eq!(other.len(), accs.len());
        for (a, b) in other.iter().zip(accs) {
            for d in 0..3 {
                assert!(
                    (a[d] - b[d]).abs() <= 1e-9 * (1.0 + b[d].abs()),
                    "leaf {key}: {a:?} vs {b:?}"
                );
            }
        }
    }
}

#[tokio::test]
async fn distributed_gravity_matches_single_location() {
    let visitor = GravityVisitor::new(0.6, 1e-3);
    for kind in [TraversalKind::Down, TraversalKind::UpAndDown, TraversalKind::Dual] {
        let mut single = config(1, kind);
        single.tree.decomposition_depth = 1;
        let reference = by_key(&run(single, visitor).await[0]);

        let mut cfg = config(4, kind);
        cfg.tree.decomposition_depth = 1;
        let got = by_key(&run(cfg, visitor).await[0]);
        assert_same(&got, &reference);
    }
}

#[tokio::test]
async fn zero_theta_kinds_agree() {
    let visitor = GravityVisitor::new(0.0, 1e-3);
    let down = by_key(&run(config(3, TraversalKind::Down), visitor).await[0]);
    for kind in [TraversalKind::UpAndDown, TraversalKind::Dual] {
        let got = by_key(&run(config(3, kind), visitor).await[0]);
        assert_same(&got, &down);
    }
}

// ============================================================
// Logging
// ============================================================

#[test]
fn default_log_filter_covers_every_crate() {
    let directives: Vec<&str> = DEFAULT_LOG_FILTER.split(',').collect();
    for target in ["arbor", "arbor_core", "arbor_cache", "arbor_traverse", "arbor_runtime"] {
        assert!(
            directives.contains(&format!("{target}=info").as_str()),
            "{target} missing from {DEFAULT_LOG_FILTER}"
        );
    }
}
