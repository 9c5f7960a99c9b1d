//! Randomized checks of what every pass guarantees.

mod common;

use common::{accessor, drawn_positions, position_of, Builder};
use gltf_squash::{prelude::*, Document};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use serde_json::{json, Value};

const PALETTE: [[f32; 3]; 5] = [
    [0.0, 0.0, 0.0],
    [1.0, 0.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 1.0],
    [1.0, 1.0, 1.0],
];

/// One indexed triangle list whose vertices repeat palette entries.
fn triangle_soup(picks: &[u8], seeds: &[u8]) -> Option<Document> {
    let picks = &picks[..picks.len().min(48)];
    if picks.is_empty() {
        return None;
    }
    let points: Vec<[f32; 3]> = picks
        .iter()
        .map(|&pick| PALETTE[pick as usize % PALETTE.len()])
        .collect();
    let faces = seeds.len().min(60) / 3 * 3;
    if faces == 0 {
        return None;
    }
    let indices: Vec<u16> = seeds[..faces]
        .iter()
        .map(|&seed| (seed as usize % points.len()) as u16)
        .collect();

    let mut builder = Builder::new();
    let positions = builder.positions(&points);
    let indices = builder.indices(&indices);
    Some(builder.finish(json!({
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{ "primitives": [{
            "attributes": { "POSITION": positions },
            "indices": indices
        }]}]
    })))
}

#[quickcheck]
fn welding_keeps_every_drawn_vertex(picks: Vec<u8>, seeds: Vec<u8>) -> TestResult {
    let Some(mut doc) = triangle_soup(&picks, &seeds) else {
        return TestResult::discard();
    };
    let primitive = doc.root.meshes[0].primitives[0].clone();
    let drawn = drawn_positions(&doc, &primitive);
    let before = accessor(&doc, position_of(&primitive)).count();

    weld(&mut doc, &WeldOptions::default(), &mut Silent).unwrap();

    let primitive = &doc.root.meshes[0].primitives[0];
    let after = accessor(&doc, position_of(primitive)).count();
    TestResult::from_bool(after <= before && drawn_positions(&doc, primitive) == drawn)
}

#[quickcheck]
fn welding_twice_changes_nothing(picks: Vec<u8>, seeds: Vec<u8>) -> TestResult {
    let Some(mut doc) = triangle_soup(&picks, &seeds) else {
        return TestResult::discard();
    };
    weld(&mut doc, &WeldOptions::default(), &mut Silent).unwrap();
    let accessors = doc.root.accessors.len();
    let again = weld(&mut doc, &WeldOptions::default(), &mut Silent).unwrap();
    TestResult::from_bool(again.welded == 0 && doc.root.accessors.len() == accessors)
}

/// Several meshes over a handful of scalar accessors drawn from a small pool,
/// so that equal payloads and equal meshes are common.
fn repetitive_graph(values: &[u8], meshes: &[(u8, u8)]) -> Document {
    let mut builder = Builder::new();
    let accessors: Vec<u32> = values
        .iter()
        .take(12)
        .map(|&value| builder.scalars(&[f32::from(value % 3), 1.0]))
        .collect();
    let pick = |seed: u8| accessors[seed as usize % accessors.len()];

    let meshes: Vec<Value> = meshes
        .iter()
        .take(12)
        .map(|&(weights, joints)| {
            json!({ "primitives": [{
                "attributes": { "WEIGHTS_0": pick(weights), "JOINTS_0": pick(joints) },
                "mode": 0
            }]})
        })
        .collect();
    let nodes: Vec<Value> = (0..meshes.len()).map(|m| json!({ "mesh": m })).collect();
    let roots: Vec<usize> = (0..nodes.len()).collect();
    builder.finish(json!({
        "scenes": [{ "nodes": roots }],
        "nodes": nodes,
        "meshes": meshes
    }))
}

#[quickcheck]
fn dedup_is_idempotent(values: Vec<u8>, meshes: Vec<(u8, u8)>) -> TestResult {
    if values.is_empty() || meshes.is_empty() {
        return TestResult::discard();
    }
    let mut doc = repetitive_graph(&values, &meshes);
    dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
    if doc.check_references().is_err() {
        return TestResult::failed();
    }
    let again = dedup(&mut doc, &DedupOptions::default(), &mut Silent).unwrap();
    TestResult::from_bool(again.removed() == 0)
}

/// A forest where every node only parents later nodes, with meshes on some
/// of them and a random subset of roots listed in the scene.
fn random_forest(links: &[(u8, bool)], roots: &[u8]) -> Document {
    let count = links.len().min(24);
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (n, &(parent, _)) in links.iter().take(count).enumerate().skip(1) {
        children[parent as usize % n].push(n);
    }

    let mut builder = Builder::new();
    let positions = builder.positions(&PALETTE[..3]);
    let nodes: Vec<Value> = links
        .iter()
        .take(count)
        .zip(&children)
        .map(|(&(_, has_mesh), children)| {
            let mut node = json!({});
            if has_mesh {
                node["mesh"] = json!(0);
            }
            if !children.is_empty() {
                node["children"] = json!(children);
            }
            node
        })
        .collect();
    let mut scene: Vec<usize> = roots.iter().map(|&r| r as usize % count).collect();
    scene.sort_unstable();
    scene.dedup();
    builder.finish(json!({
        "scenes": [{ "nodes": scene }],
        "nodes": nodes,
        "meshes": [{ "primitives": [{ "attributes": { "POSITION": positions } }] }]
    }))
}

#[quickcheck]
fn pruning_is_sound_and_idempotent(links: Vec<(u8, bool)>, roots: Vec<u8>) -> TestResult {
    if links.is_empty() || roots.is_empty() {
        return TestResult::discard();
    }
    let mut doc = random_forest(&links, &roots);
    if prune(&mut doc, &PruneOptions::default(), &mut Silent).is_err() {
        return TestResult::failed();
    }
    if doc.check_references().is_err() {
        return TestResult::failed();
    }
    if doc.root.scenes[0].nodes.is_empty() {
        let again = prune(&mut doc, &PruneOptions::default(), &mut Silent);
        return TestResult::from_bool(
            doc.root.nodes.is_empty() && matches!(again, Err(Error::NoSceneRoots)),
        );
    }
    // Every surviving node carries a mesh or leads to one.
    let meshless_leaf = doc.root.nodes.iter().any(|node| {
        node.mesh.is_none() && node.children.as_ref().is_none_or(Vec::is_empty)
    });
    let again = prune(&mut doc, &PruneOptions::default(), &mut Silent).unwrap();
    TestResult::from_bool(!meshless_leaf && again.removed.total() == 0 && again.leaves == 0)
}

#[quickcheck]
fn pipeline_keeps_references_valid(picks: Vec<u8>, seeds: Vec<u8>) -> TestResult {
    let Some(mut doc) = triangle_soup(&picks, &seeds) else {
        return TestResult::discard();
    };
    let drawn = drawn_positions(&doc, &doc.root.meshes[0].primitives[0]);
    run_passes(&mut doc, &OptimizeConfig::default(), &mut Silent).unwrap();
    TestResult::from_bool(
        doc.check_references().is_ok()
            && drawn_positions(&doc, &doc.root.meshes[0].primitives[0]) == drawn,
    )
}
