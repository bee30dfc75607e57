//! Tests for arbor-core: key arithmetic, roles, summaries, wire encoding, errors

use arbor_core::*;

const B: usize = 8;

fn particle(order: u64, mass: f64, position: [f64; 3]) -> Particle {
    Particle::new(order, Key::ROOT, mass, position)
}

// ===========================================================================
// Key
// ===========================================================================

#[test]
fn key_root_and_children() {
    assert!(Key::ROOT.is_root());
    assert_eq!(Key::ROOT.child(0, B), Key::new(8));
    assert_eq!(Key::ROOT.child(7, B), Key::new(15));
    assert_eq!(Key::new(9).child(3, B), Key::new(75));
    let children: Vec<Key> = Key::new(2).children(4).collect();
    assert_eq!(children, vec![Key::new(8), Key::new(9), Key::new(10), Key::new(11)]);
}

#[test]
fn key_parent_and_index() {
    assert_eq!(Key::new(75).parent(B), Some(Key::new(9)));
    assert_eq!(Key::new(75).child_index(B), 3);
    assert_eq!(Key::new(9).parent(B), Some(Key::ROOT));
    assert_eq!(Key::ROOT.parent(B), None);
}

#[test]
fn key_depth_ranges() {
    assert_eq!(Key::ROOT.depth(B), 0);
    for raw in 8..16 {
        assert_eq!(Key::new(raw).depth(B), 1);
    }
    assert_eq!(Key::new(64).depth(B), 2);
    assert_eq!(Key::new(127).depth(B), 2);
    assert_eq!(Key::new(128).depth(B), 3);
    assert_eq!(Key::new(4).depth(2), 2);
}

#[test]
fn key_ancestor_at() {
    let k = Key::new(75);
    assert_eq!(k.ancestor_at(0, B), Some(Key::ROOT));
    assert_eq!(k.ancestor_at(1, B), Some(Key::new(9)));
    assert_eq!(k.ancestor_at(2, B), Some(k));
    assert_eq!(k.ancestor_at(3, B), None);
}

#[test]
fn key_prefix_is_inclusive() {
    assert!(Key::ROOT.is_prefix_of(Key::new(75), B));
    assert!(Key::new(9).is_prefix_of(Key::new(75), B));
    assert!(Key::new(75).is_prefix_of(Key::new(75), B));
    assert!(!Key::new(10).is_prefix_of(Key::new(75), B));
    assert!(!Key::new(75).is_prefix_of(Key::new(9), B));
}

#[test]
fn key_ancestors_nearest_first() {
    let chain: Vec<Key> = Key::new(75).ancestors(B).collect();
    assert_eq!(chain, vec![Key::new(9), Key::ROOT]);
    assert_eq!(Key::ROOT.ancestors(B).count(), 0);
}

#[test]
fn key_path_to_descendant() {
    assert_eq!(Key::ROOT.path_to(Key::new(75), B), Some(vec![1, 3]));
    assert_eq!(Key::new(9).path_to(Key::new(9), B), Some(vec![]));
    assert_eq!(Key::new(10).path_to(Key::new(75), B), None);
}

#[test]
fn key_serializes_as_number() {
    assert_eq!(serde_json::to_string(&Key::new(42)).unwrap(), "42");
    let back: Key = serde_json::from_str("42").unwrap();
    assert_eq!(back, Key::new(42));
    assert_eq!(format!("{}", Key::new(42)), "42");
}

// ===========================================================================
// Role
// ===========================================================================

#[test]
fn role_residency_partition() {
    let all = [
        Role::Internal,
        Role::Boundary,
        Role::Leaf,
        Role::EmptyLeaf,
        Role::Remote,
        Role::RemoteAboveOwnedKey,
        Role::CachedRemote,
        Role::CachedRemoteLeaf,
        Role::CachedBoundary,
    ];
    for role in all {
        assert_ne!(role.is_build_resident(), role.is_cache_resident(), "{}", role);
    }
    assert!(Role::Remote.is_placeholder());
    assert!(Role::RemoteAboveOwnedKey.is_placeholder());
    assert!(!Role::CachedRemote.is_placeholder());
    assert!(Role::CachedRemoteLeaf.is_leaf());
    assert!(!Role::CachedBoundary.is_leaf());
}

#[test]
fn role_serializes_snake_case() {
    assert_eq!(
        serde_json::to_string(&Role::RemoteAboveOwnedKey).unwrap(),
        r#""remote_above_owned_key""#
    );
    assert_eq!(format!("{}", Role::CachedBoundary), "cached_boundary");
}

// ===========================================================================
// CentroidData
// ===========================================================================

#[test]
fn centroid_from_particles() {
    let d = CentroidData::from_particles(&[
        particle(0, 1.0, [0.0, 0.0, 0.0]),
        particle(1, 3.0, [1.0, 0.0, 0.0]),
    ]);
    assert_eq!(d.count, 2);
    assert_eq!(d.mass, 4.0);
    assert_eq!(d.centroid(), Some([0.75, 0.0, 0.0]));
    let bounds = d.bounds.unwrap();
    assert_eq!(bounds.lesser, [0.0, 0.0, 0.0]);
    assert_eq!(bounds.greater, [1.0, 0.0, 0.0]);
}

#[test]
fn centroid_default_is_identity() {
    let d = CentroidData::from_particles(&[particle(0, 2.0, [0.5, 0.5, 0.5])]);
    assert_eq!(d.clone().merged(&CentroidData::default()), d);
    assert_eq!(CentroidData::default().merged(&d), d);
    assert!(CentroidData::default().is_empty());
    assert_eq!(CentroidData::default().centroid(), None);
}

#[test]
fn centroid_merge_commutes() {
    let a = CentroidData::from_particles(&[particle(0, 1.0, [0.0, 0.25, 0.5])]);
    let b = CentroidData::from_particles(&[
        particle(1, 2.0, [0.5, 0.0, 0.0]),
        particle(2, 0.5, [0.125, 1.0, 0.25]),
    ]);
    assert_eq!(a.clone().merged(&b), b.clone().merged(&a));
}

#[test]
fn bounding_box_distances() {
    let a = BoundingBox {
        lesser: [0.0, 0.0, 0.0],
        greater: [1.0, 1.0, 1.0],
    };
    let b = BoundingBox {
        lesser: [3.0, 0.0, 0.0],
        greater: [4.0, 1.0, 1.0],
    };
    assert_eq!(a.distance_to([0.5, 0.5, 0.5]), 0.0);
    assert_eq!(a.distance_to([2.0, 0.5, 0.5]), 1.0);
    assert_eq!(a.separation(&b), 2.0);
    assert_eq!(a.union(&b).size(), 4.0);
    assert!(a.contains(a.center()));
}

// ===========================================================================
// Protocol
// ===========================================================================

#[test]
fn bundle_entry_bound() {
    assert_eq!(Bundle::<CentroidData>::max_entries(8, 0), 1);
    assert_eq!(Bundle::<CentroidData>::max_entries(8, 1), 9);
    assert_eq!(Bundle::<CentroidData>::max_entries(8, 2), 73);
    assert_eq!(Bundle::<CentroidData>::max_entries(4, 2), 21);
}

#[test]
fn starter_pack_sorts_by_key() {
    let pack = StarterPack::new(vec![
        (Key::new(9), Snapshot::<CentroidData>::empty()),
        (Key::ROOT, Snapshot::empty()),
        (Key::new(8), Snapshot::empty()),
    ]);
    let keys: Vec<Key> = pack.entries.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![Key::ROOT, Key::new(8), Key::new(9)]);
    assert_eq!(pack.len(), 3);
}

#[test]
fn wire_fetch_json_shape() {
    let msg: Wire<CentroidData> = Wire::Fetch(FetchRequest::new(Key::new(9), 1));
    let json = msg.to_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["type"], "fetch");
    assert_eq!(value["key"], 9);
    assert_eq!(value["requester"], 1);
    assert_eq!(msg.kind(), "fetch");
}

#[test]
fn wire_bundle_survives_json() {
    let leaf = [particle(4, 1.5, [0.1, 0.2, 0.3])];
    let mut bundle = Bundle::new(0);
    bundle.entries.push((
        Key::new(9),
        Snapshot::new(CentroidData::from_particles(&leaf), 1, true, 1),
    ));
    bundle.particles.extend_from_slice(&leaf);
    bundle.leaf_counts.push(1);

    let json = Wire::Bundle(bundle).to_json().unwrap();
    match Wire::<CentroidData>::from_json(&json).unwrap() {
        Wire::Bundle(back) => {
            assert_eq!(back.source, 0);
            assert_eq!(back.top_key(), Some(Key::new(9)));
            assert_eq!(back.particles, leaf.to_vec());
            assert_eq!(back.leaf_counts, vec![1]);
            assert!(back.entries[0].1.is_leaf);
        }
        other => panic!("expected bundle, got {}", other.kind()),
    }
}

// ===========================================================================
// Error
// ===========================================================================

#[test]
fn error_display_and_classification() {
    let err = Error::unknown_key(Key::new(99), 2);
    assert_eq!(err.to_string(), "unknown key 99 on location 2");
    assert!(err.is_protocol_violation());
    assert!(!Error::transport("closed").is_protocol_violation());
    let role = Error::unexpected_role(Key::new(3), Role::Leaf, "fetch");
    assert!(role.to_string().contains("leaf"));
}

#[test]
fn error_from_json() {
    let err: Error = serde_json::from_str::<Key>("nope").unwrap_err().into();
    assert!(matches!(err, Error::Json(_)));
}
