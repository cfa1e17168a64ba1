// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Unit tests for the pruning walks, driving node state directly instead of
//! going through the execution loop.

use std::path::PathBuf;

use crate::node::{NodeId, OutputClass, PruneStatus};
use crate::tests::{add_named, chain, statuses, test_graph, TestManager};
use crate::Graph;

fn complete(graph: &mut Graph<TestManager>, ids: &[NodeId]) {
    for &id in ids {
        graph.pg[id].completed = true;
    }
}

fn classify(graph: &mut Graph<TestManager>, id: NodeId, class: OutputClass) {
    graph.pg[id].output = Some(class);
}

fn shared(name: &str) -> OutputClass {
    OutputClass::Shared(PathBuf::from(format!("/ckpt/{name}")))
}

fn sorted(mut ids: Vec<NodeId>) -> Vec<NodeId> {
    ids.sort();
    ids
}

#[test]
fn safe_walk_excludes_parents_with_incomplete_outside_children() {
    let mut graph = test_graph();
    let ids = add_named(&mut graph, &["a", "b", "c", "d"]);
    let (a, b, c, d) = (ids[0], ids[1], ids[2], ids[3]);
    graph.add_dependency(a, b).unwrap();
    graph.add_dependency(a, c).unwrap();
    graph.add_dependency(b, d).unwrap();

    for (&id, name) in ids.iter().zip(["a", "b", "c", "d"]) {
        classify(&mut graph, id, shared(name));
    }
    complete(&mut graph, &[a, b, d]);

    // c is an unfinished consumer of a, so the walk from d stops at b.
    assert_eq!(sorted(graph.find_safe_ancestors(d)), vec![b]);
}

#[test]
fn safe_walk_treats_safe_parents_as_sealed_boundaries() {
    let mut graph = test_graph();
    let ids = add_named(&mut graph, &["a", "b", "c"]);
    chain(&mut graph, &ids);
    for (&id, name) in ids.iter().zip(["a", "b", "c"]) {
        classify(&mut graph, id, shared(name));
    }
    complete(&mut graph, &ids);
    graph.pg[ids[0]].prune_status = PruneStatus::Safe;

    // a was already reclaimed; only b is new work.
    assert_eq!(sorted(graph.find_safe_ancestors(ids[2])), vec![ids[1]]);
}

#[test]
fn safe_walk_blocks_on_unsafely_pruned_children() {
    let mut graph = test_graph();
    let ids = add_named(&mut graph, &["p", "x", "y", "z"]);
    let (p, x, y, z) = (ids[0], ids[1], ids[2], ids[3]);
    graph.add_dependency(p, x).unwrap();
    graph.add_dependency(p, y).unwrap();
    graph.add_dependency(x, z).unwrap();

    for (&id, name) in ids.iter().zip(["p", "x", "y", "z"]) {
        classify(&mut graph, id, shared(name));
    }
    complete(&mut graph, &ids);
    graph.pg[y].prune_status = PruneStatus::Unsafe;

    // y's data is gone but might be resurrected; p must stay intact for the
    // recovery chain, so the walk from z reclaims only x.
    assert_eq!(sorted(graph.find_safe_ancestors(z)), vec![x]);
}

#[test]
fn walk_includes_temp_ancestors_reached_through_the_walked_subgraph() {
    let mut graph = test_graph();
    let ids = add_named(&mut graph, &["a", "b", "c"]);
    chain(&mut graph, &ids);
    classify(&mut graph, ids[0], OutputClass::Temp);
    classify(&mut graph, ids[1], OutputClass::Temp);
    classify(&mut graph, ids[2], shared("c"));
    complete(&mut graph, &ids);

    // b is an ephemeral completed node, so it is not persisted; but as a
    // member of the walked subgraph it does not block a's reclamation.
    assert_eq!(
        sorted(graph.find_safe_ancestors(ids[2])),
        vec![ids[0], ids[1]]
    );
}

#[test]
fn parents_beyond_the_roots_do_not_exist() {
    let mut graph = test_graph();
    let ids = add_named(&mut graph, &["a", "b", "c"]);
    chain(&mut graph, &ids);
    assert!(graph.find_parents_at_depth(ids[2], 5).is_empty());
}

#[test]
fn ephemeral_prune_at_depth_two_skips_the_immediate_parent() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = crate::tests::test_graph_in(&dir);
    graph.tune("prune-depth", "2").unwrap();
    let ids = add_named(&mut graph, &["a", "b", "c", "d"]);
    chain(&mut graph, &ids);
    graph.compute_topology_metrics().unwrap();

    complete(&mut graph, &ids);
    graph.prune_ancestors(ids[3]);

    assert_eq!(
        statuses(&graph, &ids),
        vec![
            PruneStatus::NotPruned,
            PruneStatus::Unsafe,
            PruneStatus::NotPruned,
            PruneStatus::NotPruned,
        ]
    );
}

#[test]
fn prune_is_a_no_op_for_incomplete_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = crate::tests::test_graph_in(&dir);
    let ids = add_named(&mut graph, &["a", "b"]);
    chain(&mut graph, &ids);
    graph.compute_topology_metrics().unwrap();
    complete(&mut graph, &ids[..1]);

    graph.prune_ancestors(ids[1]);
    assert_eq!(statuses(&graph, &ids), vec![PruneStatus::NotPruned; 2]);
}
