// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::{Path, PathBuf};

use fnv::FnvHashSet;
use petgraph::graph::NodeIndex;

use crate::manager::{FileId, Task};

// 2^32 Nodes ought to be more than enough for anyone!
pub type NodeId = NodeIndex<u32>;

///
/// Where a node's output lives once the producing task has finished.
///
/// `Local` and `Shared` outputs are durable: a worker crash cannot lose them.
/// `Temp` outputs live only on worker-local storage and may vanish with the
/// worker that holds them, in which case the Manager recomputes them with a
/// recovery task.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OutputClass {
    /// Persisted on the manager host; the only class the driver can retrieve
    /// through the standard file-return path.
    Local(PathBuf),
    /// Written by the worker directly into a shared filesystem path.
    Shared(PathBuf),
    /// Ephemeral, worker-local.
    Temp,
}

impl OutputClass {
    pub fn is_persisted(&self) -> bool {
        matches!(self, OutputClass::Local(_) | OutputClass::Shared(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            OutputClass::Local(_) => "local",
            OutputClass::Shared(_) => "shared-filesystem",
            OutputClass::Temp => "temp",
        }
    }
}

///
/// Pruning state of a node's output.
///
/// `Safe` is terminal: the output has been deleted and every transitive
/// consumer is complete and persisted, so it can never be needed again.
/// `Unsafe` records a deletion the Manager may still have to undo with a
/// recovery task, because a downstream ephemeral consumer could itself fail.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PruneStatus {
    NotPruned,
    Safe,
    Unsafe,
}

/// Structural metrics cached on each node by topology computation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TopologyMetrics {
    pub depth: usize,
    pub height: usize,
    pub upstream_subgraph_size: usize,
    pub downstream_subgraph_size: usize,
    pub fan_in: usize,
    pub fan_out: usize,
}

impl TopologyMetrics {
    /// Approximates how much downstream work still depends on preserving
    /// this output: nodes deep in the graph with large upstream influence
    /// and shallow downstream influence score highest. The `+ 1` avoids
    /// dividing by zero at leaves.
    pub fn heavy_score(&self) -> f64 {
        let up = (self.depth * self.upstream_subgraph_size * self.fan_in) as f64;
        let down = (self.height * self.downstream_subgraph_size * self.fan_out) as f64;
        up / (down + 1.0)
    }
}

/// Per-node timing figures, in microseconds. Emitted as a CSV row at
/// shutdown when the time-metrics knob is set.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeTimings {
    pub submission_us: u64,
    pub scheduling_us: u64,
    pub commit_us: u64,
    pub execution_us: u64,
    pub retrieval_us: u64,
    pub postprocessing_us: u64,
}

///
/// One logical computation in the graph.
///
/// A node carries no scheduling policy of its own; policy lives in the
/// dispatch layer. All mutation happens through graph-owned operations.
///
#[derive(Debug)]
pub struct Node {
    pub(crate) key: String,
    pub(crate) is_target: bool,
    /// Name under which the worker produces the output. Starts as a UUID;
    /// rewritten to the full checkpoint path when the node is assigned the
    /// shared-filesystem class.
    pub(crate) remote_name: String,
    pub(crate) infile: FileId,
    /// The managed output file. `None` until classes are assigned, and for
    /// shared-filesystem nodes, whose output bypasses the Manager entirely.
    pub(crate) outfile: Option<FileId>,
    /// Assigned exactly once, before execution starts.
    pub(crate) output: Option<OutputClass>,
    pub(crate) task: Task,
    pub(crate) completed: bool,
    pub(crate) retries_left: u32,
    pub(crate) prune_depth: u32,
    pub(crate) prune_status: PruneStatus,
    pub(crate) pending_parents: FnvHashSet<NodeId>,
    pub(crate) outfile_size_bytes: u64,
    pub(crate) metrics: TopologyMetrics,
    pub(crate) heavy_score: f64,
    pub(crate) timings: NodeTimings,
    pub(crate) critical_path_time_us: u64,
}

impl Node {
    pub(crate) fn new(
        key: String,
        is_target: bool,
        remote_name: String,
        infile: FileId,
        task: Task,
        prune_depth: u32,
        retries: u32,
    ) -> Node {
        Node {
            key,
            is_target,
            remote_name,
            infile,
            outfile: None,
            output: None,
            task,
            completed: false,
            retries_left: retries,
            prune_depth,
            prune_status: PruneStatus::NotPruned,
            pending_parents: FnvHashSet::default(),
            outfile_size_bytes: 0,
            metrics: TopologyMetrics::default(),
            heavy_score: 0.0,
            timings: NodeTimings::default(),
            critical_path_time_us: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_target(&self) -> bool {
        self.is_target
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn prune_status(&self) -> PruneStatus {
        self.prune_status
    }

    pub fn metrics(&self) -> &TopologyMetrics {
        &self.metrics
    }

    pub fn heavy_score(&self) -> f64 {
        self.heavy_score
    }

    /// The node's output class. Panics if topology metrics have not been
    /// computed yet, which would be a sequencing bug in the caller.
    pub fn output_class(&self) -> &OutputClass {
        self.output
            .as_ref()
            .expect("output class is assigned by compute_topology_metrics")
    }

    /// A completed node whose output class is durable. Ephemeral outputs are
    /// never persisted, no matter how many replicas exist.
    pub(crate) fn output_is_persisted(&self) -> bool {
        if !self.completed {
            return false;
        }
        match &self.output {
            Some(class) => class.is_persisted(),
            None => false,
        }
    }

    pub(crate) fn shared_path(&self) -> Option<&Path> {
        match &self.output {
            Some(OutputClass::Shared(path)) => Some(path),
            _ => None,
        }
    }

    ///
    /// The JSON document shipped to the worker as the task's `infile`. The
    /// proxy function reads the node key from `fn_args[0]` and performs the
    /// application work under that identifier.
    ///
    pub(crate) fn task_arguments(key: &str) -> String {
        serde_json::json!({
            "fn_args": [key],
            "fn_kwargs": {},
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_arguments_shape() {
        let doc: serde_json::Value =
            serde_json::from_str(&Node::task_arguments("alpha")).unwrap();
        assert_eq!(doc["fn_args"][0], "alpha");
        assert!(doc["fn_kwargs"].as_object().unwrap().is_empty());
    }

    #[test]
    fn heavy_score_leaf_does_not_divide_by_zero() {
        let m = TopologyMetrics {
            depth: 3,
            height: 0,
            upstream_subgraph_size: 5,
            downstream_subgraph_size: 0,
            fan_in: 2,
            fan_out: 0,
        };
        assert_eq!(m.heavy_score(), 30.0);
    }

    #[test]
    fn persisted_requires_completion() {
        let task = Task::new("fn");
        let mut node = Node::new(
            "n".to_string(),
            false,
            "uuid".to_string(),
            FileId(1),
            task,
            1,
            1,
        );
        node.output = Some(OutputClass::Shared(PathBuf::from("/ckpt/uuid")));
        assert!(!node.output_is_persisted());
        node.completed = true;
        assert!(node.output_is_persisted());
    }
}
