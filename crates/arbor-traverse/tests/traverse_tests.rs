//! Tests for arbor-traverse: coverage of every traversal kind across
//! locations, suspension bookkeeping, and the stock visitors

use arbor_cache::*;
use arbor_core::*;
use arbor_traverse::*;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const B: usize = 8;
type D = CentroidData;

// ===========================================================================
// Harness: caches wired by hand through outboxes
// ===========================================================================

fn position(order: u64) -> [f64; 3] {
    let o = order as f64;
    [
        (o * 0.618_034).fract(),
        (o * 0.414_214 + 0.1).fract(),
        (o * 0.732_051 + 0.2).fract(),
    ]
}

fn subtree(key: Key, owner: LocationId, levels: usize, order: &mut u64) -> Arc<Node<D>> {
    if levels == 0 {
        let p = Particle::new(*order, key, 1.0 + (*order % 3) as f64, position(*order));
        *order += 1;
        return Node::leaf(key, owner, Particles::owned(vec![p]), B);
    }
    let children = key
        .children(B)
        .map(|k| Some(subtree(k, owner, levels - 1, order)))
        .collect();
    Node::branch(key, Role::Internal, Some(owner), children, B)
}

struct Loc {
    cache: Arc<CacheManager<D>>,
    outbox: Arc<Outbox<D>>,
}

struct Cluster {
    locs: Vec<Loc>,
    canopy: TreeCanopy<D>,
    canopy_out: Arc<Outbox<D>>,
    particles: Vec<Particle>,
}

/// 64 single-particle leaves at depth 2, owned roots at `split_depth`,
/// handed out round-robin over `n_locations`.
fn cluster(n_locations: u32, split_depth: usize) -> Cluster {
    let locs: Vec<Loc> = (0..n_locations)
        .map(|id| {
            let outbox = Arc::new(Outbox::new());
            let transport: Arc<dyn Transport<D>> = outbox.clone();
            let config = CacheConfig {
                branch_factor: B,
                bundle_depth: 2,
                workers: 1,
            };
            let cache = CacheManager::new(id, config, Arc::new(Resumer::new()), transport);
            Loc {
                cache: Arc::new(cache),
                outbox,
            }
        })
        .collect();
    let canopy_out = Arc::new(Outbox::new());
    let transport: Arc<dyn Transport<D>> = canopy_out.clone();
    let canopy = TreeCanopy::new(B, transport);
    let collector = Collector::new();

    let first = B.pow(split_depth as u32) as u64;
    let mut order = 0;
    let mut particles = Vec::new();
    for (i, raw) in (first..2 * first).enumerate() {
        let key = Key::new(raw);
        let owner = i as u32 % n_locations;
        let root = subtree(key, owner, 2 - split_depth, &mut order);
        for leaf in root.leaves() {
            particles.extend_from_slice(leaf.particles().as_slice());
        }
        canopy.register_owner(key, owner);
        if let Some(parent) = key.parent(B) {
            for (k, snapshot) in canopy.recv_data(parent, root.snapshot()).unwrap() {
                collector.recv(k, snapshot);
            }
        }
        locs[owner as usize].cache.connect(root, false).unwrap();
    }
    let pack = collector.starter_pack(None);
    for loc in &locs {
        loc.cache.recv_starter_pack(pack.clone()).unwrap();
    }
    Cluster {
        locs,
        canopy,
        canopy_out,
        particles,
    }
}

impl Cluster {
    fn targets(&self, location: usize) -> Vec<Arc<Node<D>>> {
        self.locs[location]
            .cache
            .local_roots()
            .iter()
            .flat_map(|root| root.leaves())
            .collect()
    }

    /// Deliver messages until every outbox is empty.
    fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let mut batch = self.canopy_out.drain();
            for loc in &self.locs {
                batch.extend(loc.outbox.drain());
            }
            if batch.is_empty() {
                return delivered;
            }
            for (to, message) in batch {
                delivered += 1;
                match (to, message) {
                    (Endpoint::Canopy, Wire::CanopyFetch(req)) => {
                        self.canopy.request_data(req.key, req.requester).unwrap()
                    }
                    (Endpoint::Location(j), Wire::Fetch(req)) => {
                        self.locs[j as usize].cache.request_nodes(req).unwrap()
                    }
                    (Endpoint::Location(j), Wire::Bundle(bundle)) => {
                        self.locs[j as usize].cache.add_cache(bundle).unwrap()
                    }
                    (Endpoint::Location(j), Wire::Summary(summary)) => {
                        self.locs[j as usize].cache.restore_data(summary).unwrap()
                    }
                    (to, other) => panic!("unexpected {} to {:?}", other.kind(), to),
                }
            }
        }
    }

    fn run<V: Visitor<D>>(&self, kind: TraversalKind, visitor: V) -> Vec<Arc<Traverser<D, V>>> {
        let visitor = Arc::new(visitor);
        let traversers: Vec<_> = (0..self.locs.len())
            .map(|i| {
                Traverser::new(
                    kind,
                    Arc::clone(&visitor),
                    Arc::clone(&self.locs[i].cache),
                    self.targets(i),
                )
            })
            .collect();
        for t in &traversers {
            t.start().unwrap();
        }
        self.pump();
        traversers
    }
}

fn assert_full_coverage<V: Visitor<D, Output = CountOutput>>(
    traversers: &[Arc<Traverser<D, V>>],
    n: usize,
) {
    let mut targets = 0;
    for t in traversers {
        assert!(t.is_complete(), "traversal {} incomplete", t.id());
        assert_eq!(t.pending(), 0);
        for (key, out) in t.outputs() {
            assert_eq!(out.particles, n, "target {} saw {}", key, out.particles);
            targets += 1;
        }
    }
    assert_eq!(targets, n);
}

// ===========================================================================
// Coverage
// ===========================================================================

#[test]
fn down_covers_every_particle() {
    for split in [1, 2] {
        let c = cluster(3, split);
        let ts = c.run(TraversalKind::Down, CountVisitor::exhaustive());
        assert_full_coverage(&ts, 64);
    }
}

#[test]
fn up_and_down_covers_every_particle() {
    for split in [1, 2] {
        let c = cluster(3, split);
        let ts = c.run(TraversalKind::UpAndDown, CountVisitor::exhaustive());
        assert_full_coverage(&ts, 64);
    }
}

#[test]
fn dual_covers_every_particle() {
    for split in [1, 2] {
        let c = cluster(3, split);
        let ts = c.run(TraversalKind::Dual, CountVisitor::exhaustive());
        assert_full_coverage(&ts, 64);
    }
}

#[test]
fn accepted_summaries_still_cover_every_particle() {
    for kind in [
        TraversalKind::Down,
        TraversalKind::UpAndDown,
        TraversalKind::Dual,
    ] {
        let c = cluster(2, 1);
        let ts = c.run(kind, CountVisitor::accepting_from(1));
        assert_full_coverage(&ts, 64);
        let counts = ts.iter().fold(Counts::default(), |mut acc, t| {
            acc += t.counts();
            acc
        });
        assert!(counts.node_interactions > 0, "{kind} accepted nothing");
    }
}

/// Counts like [`CountVisitor`] but stops climbing at shallow ancestors.
struct StopAscentAt {
    inner: CountVisitor,
    depth: usize,
}

impl Visitor<D> for StopAscentAt {
    type Output = CountOutput;

    fn output(&self, target: &Node<D>) -> CountOutput {
        <CountVisitor as Visitor<D>>::output(&self.inner, target)
    }

    fn open(&self, source: &Node<D>, target: &Node<D>) -> Opening {
        <CountVisitor as Visitor<D>>::open(&self.inner, source, target)
    }

    fn node(&self, output: &mut CountOutput, source: &Node<D>, target: &Node<D>) {
        <CountVisitor as Visitor<D>>::node(&self.inner, output, source, target)
    }

    fn leaf(&self, output: &mut CountOutput, source: &Node<D>, target: &Node<D>) {
        <CountVisitor as Visitor<D>>::leaf(&self.inner, output, source, target)
    }

    fn stop_ascent(&self, ancestor: &Node<D>, _target: &Node<D>) -> bool {
        ancestor.depth() <= self.depth
    }
}

fn total_counts<V: Visitor<D>>(traversers: &[Arc<Traverser<D, V>>]) -> Counts {
    traversers.iter().fold(Counts::default(), |mut acc, t| {
        acc += t.counts();
        acc
    })
}

#[test]
fn stopped_ascent_still_covers_every_particle() {
    for split in [1, 2] {
        let c = cluster(3, split);
        let plain = c.run(TraversalKind::UpAndDown, CountVisitor::exhaustive());
        assert_full_coverage(&plain, 64);

        let c = cluster(3, split);
        let stopped = c.run(
            TraversalKind::UpAndDown,
            StopAscentAt {
                inner: CountVisitor::exhaustive(),
                depth: 1,
            },
        );
        assert_full_coverage(&stopped, 64);

        // The root is opened once per target on the way around the stop.
        let (plain, stopped) = (total_counts(&plain), total_counts(&stopped));
        assert_eq!(stopped.opens, plain.opens + 64);
        assert_eq!(stopped.leaf_interactions, plain.leaf_interactions);
    }
}

#[test]
fn stopped_ascent_with_accepted_summaries() {
    let c = cluster(2, 2);
    let ts = c.run(
        TraversalKind::UpAndDown,
        StopAscentAt {
            inner: CountVisitor::accepting_from(1),
            depth: 1,
        },
    );
    assert_full_coverage(&ts, 64);
    assert!(total_counts(&ts).node_interactions > 0);
}

#[test]
fn single_location_needs_no_messages() {
    let c = cluster(1, 1);
    let visitor = Arc::new(CountVisitor::exhaustive());
    let t = Traverser::new(
        TraversalKind::Down,
        visitor,
        Arc::clone(&c.locs[0].cache),
        c.targets(0),
    );
    t.start().unwrap();
    assert!(t.is_complete());
    assert!(c.locs[0].outbox.is_empty());
    assert_eq!(t.counts().suspensions, 0);
    assert_eq!(t.counts().leaf_interactions, 64 * 64);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn coverage_holds_for_any_split(
        locations in 1u32..5,
        split in 1usize..3,
        kind in prop::sample::select(vec![
            TraversalKind::Down,
            TraversalKind::UpAndDown,
            TraversalKind::Dual,
        ]),
        accept in 0usize..4,
        stop in 0usize..3,
    ) {
        let c = cluster(locations, split);
        let visitor = StopAscentAt {
            inner: CountVisitor::accepting_from(accept),
            depth: stop,
        };
        let ts = c.run(kind, visitor);
        for t in &ts {
            prop_assert!(t.is_complete());
            for (_, out) in t.outputs() {
                prop_assert_eq!(out.particles, 64);
            }
        }
    }
}

// ===========================================================================
// Suspension
// ===========================================================================

#[test]
fn shared_miss_fetches_once_and_resumes_all() {
    let c = cluster(2, 1);
    let visitor = Arc::new(CountVisitor::exhaustive());
    let t = Traverser::new(
        TraversalKind::Down,
        visitor,
        Arc::clone(&c.locs[0].cache),
        c.targets(0),
    );
    t.start().unwrap();
    assert!(!t.is_complete());

    let resumer = c.locs[0].cache.resumer();
    let n_targets = t.n_targets();
    assert_eq!(n_targets, 32);
    assert_eq!(resumer.waiting_on(Key::new(9)), n_targets);
    // Location 0 owns the even roots; the four odd ones are fetched once each.
    assert_eq!(c.locs[0].cache.stats().fetches_sent, 4);
    assert_eq!(t.counts().suspensions, 4 * n_targets as u64);

    c.pump();
    assert!(t.is_complete());
    assert_eq!(resumer.waiting(), 0);
    assert_eq!(c.locs[0].cache.stats().bundles_received, 4);
}

#[test]
fn restarted_traversal_reuses_resolved_keys() {
    let c = cluster(2, 1);
    let first = c.run(TraversalKind::Down, CountVisitor::exhaustive());
    assert_full_coverage(&first, 64);
    let fetches = c.locs[0].cache.stats().fetches_sent;

    let again = c.run(TraversalKind::Down, CountVisitor::exhaustive());
    assert_full_coverage(&again, 64);
    assert_eq!(c.locs[0].cache.stats().fetches_sent, fetches);
}

#[test]
fn start_twice_is_ignored() {
    let c = cluster(1, 1);
    let t = Traverser::new(
        TraversalKind::Down,
        Arc::new(CountVisitor::exhaustive()),
        Arc::clone(&c.locs[0].cache),
        c.targets(0),
    );
    t.start().unwrap();
    let counts = t.counts();
    t.start().unwrap();
    assert_eq!(t.counts(), counts);
}

#[test]
fn empty_leaves_are_not_targets() {
    let c = cluster(1, 1);
    let empty = Node::leaf(Key::new(4096), 0, Particles::default(), B);
    let mut targets = c.targets(0);
    targets.push(empty);
    let t = Traverser::new(
        TraversalKind::Down,
        Arc::new(CountVisitor::exhaustive()),
        Arc::clone(&c.locs[0].cache),
        targets,
    );
    assert_eq!(t.n_targets(), 64);
}

// ===========================================================================
// Gravity
// ===========================================================================

fn direct_sum(particles: &[Particle], softening: f64) -> HashMap<u64, [f64; 3]> {
    let mut out = HashMap::new();
    for p in particles {
        let mut acc = [0.0; 3];
        for q in particles {
            if q.order == p.order {
                continue;
            }
            let dx = [
                q.position[0] - p.position[0],
                q.position[1] - p.position[1],
                q.position[2] - p.position[2],
            ];
            let r2 = dx[0] * dx[0] + dx[1] * dx[1] + dx[2] * dx[2] + softening * softening;
            let scale = q.mass / (r2 * r2.sqrt());
            for d in 0..3 {
                acc[d] += dx[d] * scale;
            }
        }
        out.insert(p.order, acc);
    }
    out
}

fn accelerations(c: &Cluster, ts: &[Arc<Traverser<D, GravityVisitor>>]) -> HashMap<u64, [f64; 3]> {
    let mut out = HashMap::new();
    for (i, t) in ts.iter().enumerate() {
        assert!(t.is_complete());
        let leaves: HashMap<Key, Arc<Node<D>>> = c
            .targets(i)
            .into_iter()
            .map(|leaf| (leaf.key(), leaf))
            .collect();
        for (key, accs) in t.outputs() {
            let particles = leaves[&key].particles();
            for (p, acc) in particles.as_slice().iter().zip(accs) {
                out.insert(p.order, acc);
            }
        }
    }
    out
}

fn close(a: [f64; 3], b: [f64; 3]) -> bool {
    (0..3).all(|d| (a[d] - b[d]).abs() <= 1e-9 * (1.0 + b[d].abs()))
}

#[test]
fn zero_theta_gravity_matches_direct_sum() {
    let c = cluster(3, 1);
    let ts = c.run(TraversalKind::Down, GravityVisitor::new(0.0, 1e-2));
    let got = accelerations(&c, &ts);
    let want = direct_sum(&c.particles, 1e-2);
    assert_eq!(got.len(), 64);
    for (order, acc) in &want {
        assert!(close(got[order], *acc), "particle {order}");
    }
}

#[test]
fn distributed_gravity_matches_single_location() {
    let visitor = GravityVisitor::new(0.5, 1e-2);
    let single = cluster(1, 1);
    let ts = single.run(TraversalKind::Down, visitor);
    let reference = accelerations(&single, &ts);

    let split = cluster(3, 1);
    let ts = split.run(TraversalKind::Down, visitor);
    let got = accelerations(&split, &ts);
    for (order, acc) in &reference {
        assert!(close(got[order], *acc), "particle {order}");
    }
}

// ===========================================================================
// Kinds
// ===========================================================================

#[test]
fn traversal_kind_parses() {
    assert_eq!("down".parse::<TraversalKind>().unwrap(), TraversalKind::Down);
    assert_eq!(
        "up-and-down".parse::<TraversalKind>().unwrap(),
        TraversalKind::UpAndDown
    );
    assert_eq!(TraversalKind::Dual.to_string(), "dual");
    assert!("sideways".parse::<TraversalKind>().is_err());
    assert_eq!(
        serde_json::to_string(&TraversalKind::UpAndDown).unwrap(),
        r#""up_and_down""#
    );
}
