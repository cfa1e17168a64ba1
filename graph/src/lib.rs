// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

pub mod manager;
mod node;

mod dispatch;
mod execute;
mod prune;
mod topology;

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use log::error;
use petgraph::dot;
use petgraph::graph::DiGraph;
use petgraph::Direction;
use uuid::Uuid;

use crate::manager::{CacheLevel, FileId, Manager, Task, TaskId, TaskResult};

pub use crate::dispatch::TaskPriorityMode;
pub use crate::node::{Node, NodeId, NodeTimings, OutputClass, PruneStatus, TopologyMetrics};

type PGraph = DiGraph<Node, (), u32>;

/// Current time as microseconds since the unix epoch.
pub(crate) fn timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Surely you're not before the unix epoch?")
        .as_micros() as u64
}

///
/// Errors surfaced to the driver. Configuration problems abort before or
/// during setup; task failures become errors only once the retry budget is
/// exhausted. Protocol invariant violations are not represented here: those
/// are bugs and panic with a diagnostic dump.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GraphError {
    /// Unknown tuning key, out-of-range value, missing proxy function, or an
    /// uncreatable directory.
    Config(String),
    /// A node identifier that does not exist in the graph.
    UnknownNode(String),
    /// An application key that was added twice.
    DuplicateNode(String),
    /// The topological sort visited fewer nodes than the graph contains.
    Cycle { sorted: usize, total: usize },
    /// A task returned a non-success result or non-zero exit code and the
    /// node has no retries left.
    TaskFailed {
        key: String,
        result: TaskResult,
        exit_code: i32,
    },
    /// A task claimed success but its shared-filesystem output cannot be
    /// stat'ed, and the node has no retries left.
    MissingSharedOutput { key: String, path: PathBuf },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GraphError::Config(msg) => write!(f, "configuration error: {msg}"),
            GraphError::UnknownNode(key) => write!(f, "node {key} not found"),
            GraphError::DuplicateNode(key) => write!(f, "node {key} already exists"),
            GraphError::Cycle { sorted, total } => write!(
                f,
                "graph contains a cycle or is malformed: sorted {sorted} of {total} nodes"
            ),
            GraphError::TaskFailed {
                key,
                result,
                exit_code,
            } => write!(
                f,
                "node {key} failed (result={result}, exit={exit_code}) with no retries left"
            ),
            GraphError::MissingSharedOutput { key, path } => write!(
                f,
                "node {key} succeeded but its shared-filesystem output {} is missing and no \
                 retries are left",
                path.display()
            ),
        }
    }
}

impl std::error::Error for GraphError {}

/// Tunable configuration, all reachable through [`Graph::tune`].
#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// How many hops upstream an ephemeral completion looks for prunable
    /// ancestors. 0 disables pruning entirely; 1 is most aggressive.
    pub prune_depth: u32,
    /// Fraction of non-target nodes checkpointed to the shared filesystem.
    pub checkpoint_fraction: f64,
    pub priority_mode: TaskPriorityMode,
    /// Test-only: evict a worker each time progress crosses the next
    /// multiple of this percentage. Disabled when non-positive.
    pub failure_injection_step_percent: f64,
    pub output_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub progress_update_interval_sec: f64,
    pub time_metrics_path: Option<PathBuf>,
    pub max_retry_attempts: u32,
    pub debug_log_enabled: bool,
}

impl Config {
    fn new() -> Config {
        Config {
            prune_depth: 1,
            checkpoint_fraction: 0.0,
            priority_mode: TaskPriorityMode::LargestInputFirst,
            failure_injection_step_percent: -1.0,
            output_dir: PathBuf::from("."),
            checkpoint_dir: PathBuf::from("."),
            progress_update_interval_sec: 0.1,
            time_metrics_path: None,
            max_retry_attempts: 1,
            debug_log_enabled: true,
        }
    }
}

/// Counters and timestamps accumulated over one execution.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunStats {
    pub regular_completed: usize,
    pub recovery_observed: u64,
    pub first_dispatch_us: Option<u64>,
    pub last_retrieval_us: Option<u64>,
    pub time_prune_persisted_us: u64,
    pub time_prune_temp_us: u64,
    pub time_unlink_us: u64,
}

///
/// A DAG of computation nodes driven to completion against an external
/// [`Manager`]. Nodes live in a central arena and refer to each other by
/// [`NodeId`]; parent/child links are graph edges, so there are no ownership
/// cycles to reason about.
///
pub struct Graph<M: Manager> {
    pub(crate) manager: M,
    pub(crate) pg: PGraph,
    /// Application key to arena index.
    keys: FnvHashMap<String, NodeId>,
    /// Dispatched task to originating node; populated on submit, read on
    /// completion and by the recovery-task producer scan.
    pub(crate) tasks: FnvHashMap<TaskId, NodeId>,
    /// Worker-side cached output file to producing node. A node appears here
    /// only while its prune status is NotPruned or Unsafe.
    pub(crate) cached_outputs: FnvHashMap<FileId, NodeId>,
    pub(crate) config: Config,
    pub(crate) proxy_function_name: Option<String>,
    pub(crate) proxy_library_name: String,
    pub(crate) topology_assigned: bool,
    pub(crate) executed: bool,
    pub(crate) stats: RunStats,
    /// Tests replace the process-wide SIGINT flag with a local one so runs
    /// in the same process cannot interrupt each other.
    pub(crate) interrupt_override: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,
    next_auto_key: u64,
}

impl<M: Manager> Graph<M> {
    pub fn new(manager: M) -> Graph<M> {
        Graph {
            manager,
            pg: DiGraph::new(),
            keys: FnvHashMap::default(),
            tasks: FnvHashMap::default(),
            cached_outputs: FnvHashMap::default(),
            config: Config::new(),
            proxy_function_name: None,
            proxy_library_name: Uuid::new_v4().to_string(),
            topology_assigned: false,
            executed: false,
            stats: RunStats::default(),
            interrupt_override: None,
            next_auto_key: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pg.node_count()
    }

    ///
    /// Creates a node with an auto-assigned key and returns its id. The
    /// proxy function name must be set first: every node's task invokes it.
    ///
    pub fn add_node(&mut self) -> Result<NodeId, GraphError> {
        loop {
            self.next_auto_key += 1;
            let key = self.next_auto_key.to_string();
            if !self.keys.contains_key(&key) {
                return self.create_node(key);
            }
        }
    }

    /// Creates a node under an application-chosen key. Fails loudly if the
    /// key already exists.
    pub fn add_named_node(&mut self, key: impl Into<String>) -> Result<NodeId, GraphError> {
        let key = key.into();
        if self.keys.contains_key(&key) {
            return Err(GraphError::DuplicateNode(key));
        }
        self.create_node(key)
    }

    fn create_node(&mut self, key: String) -> Result<NodeId, GraphError> {
        let function = self
            .proxy_function_name
            .clone()
            .ok_or_else(|| GraphError::Config("proxy function name is not set".to_string()))?;

        let mut task = Task::new(function);
        task.set_library_required(self.proxy_library_name.clone());

        let arguments = Node::task_arguments(&key);
        let infile =
            self.manager
                .declare_buffer(arguments.as_bytes(), CacheLevel::Task, true);
        task.add_input(infile, "infile");

        let remote_name = Uuid::new_v4().to_string();
        let node = Node::new(
            key.clone(),
            false,
            remote_name,
            infile,
            task,
            self.config.prune_depth,
            self.config.max_retry_attempts,
        );

        let id = self.pg.add_node(node);
        self.keys.insert(key, id);
        Ok(id)
    }

    /// Marks a node as a retrieval target; its output will be assigned the
    /// local class and land in the output directory.
    pub fn set_target(&mut self, id: NodeId) -> Result<(), GraphError> {
        let node = self.node_mut_checked(id)?;
        node.is_target = true;
        Ok(())
    }

    ///
    /// Records a parent → child edge. Both nodes must already exist; a
    /// missing one fails fast with a log of every known key, which is what
    /// makes identifier typos findable in graphs of this size.
    ///
    pub fn add_dependency(&mut self, parent: NodeId, child: NodeId) -> Result<(), GraphError> {
        for (role, id) in [("parent", parent), ("child", child)] {
            if self.pg.node_weight(id).is_none() {
                error!("{role} node {id:?} not found; known keys:");
                for key in self.keys.keys() {
                    error!("  {key}");
                }
                return Err(GraphError::UnknownNode(format!("{id:?}")));
            }
        }
        self.pg.update_edge(parent, child, ());
        Ok(())
    }

    /// The worker will execute a pre-loaded function of this name, passing
    /// it the JSON arguments document.
    pub fn set_proxy_function_name(&mut self, name: impl Into<String>) {
        self.proxy_function_name = Some(name.into());
    }

    pub fn set_proxy_library_name(&mut self, name: impl Into<String>) {
        self.proxy_library_name = name.into();
    }

    pub fn proxy_library_name(&self) -> &str {
        &self.proxy_library_name
    }

    ///
    /// Adjusts a named knob. Values are validated eagerly: fractions are
    /// range-checked, mode strings are mapped against the enum, directories
    /// are created if absent.
    ///
    pub fn tune(&mut self, name: &str, value: &str) -> Result<(), GraphError> {
        match name {
            "failure-injection-step-percent" => {
                self.config.failure_injection_step_percent = parse_number(name, value)?;
            }
            "task-priority-mode" => {
                self.config.priority_mode = value
                    .parse()
                    .map_err(|_| GraphError::Config(format!("invalid priority mode: {value}")))?;
            }
            "output-dir" => {
                self.config.output_dir = ensure_dir(value)?;
            }
            "prune-depth" => {
                self.config.prune_depth = parse_number(name, value)?;
            }
            "checkpoint-fraction" => {
                let fraction: f64 = parse_number(name, value)?;
                if !(0.0..=1.0).contains(&fraction) {
                    return Err(GraphError::Config(format!(
                        "invalid checkpoint fraction: {value} (must be between 0.0 and 1.0)"
                    )));
                }
                self.config.checkpoint_fraction = fraction;
            }
            "checkpoint-dir" => {
                self.config.checkpoint_dir = ensure_dir(value)?;
            }
            "progress-bar-update-interval-sec" => {
                let interval: f64 = parse_number(name, value)?;
                self.config.progress_update_interval_sec =
                    if interval > 0.0 { interval } else { 0.1 };
            }
            "time-metrics-filename" => {
                if value == "0" {
                    return Ok(());
                }
                let path = PathBuf::from(value);
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).map_err(|e| {
                            GraphError::Config(format!(
                                "failed to create {}: {e}",
                                parent.display()
                            ))
                        })?;
                    }
                }
                File::create(&path).map_err(|e| {
                    GraphError::Config(format!("failed to create {value}: {e}"))
                })?;
                self.config.time_metrics_path = Some(path);
            }
            "enable-debug-log" => {
                if !self.config.debug_log_enabled {
                    return Err(GraphError::Config(
                        "debug log was already disabled and cannot be re-enabled".to_string(),
                    ));
                }
                if value != "1" {
                    self.config.debug_log_enabled = false;
                    log::set_max_level(log::LevelFilter::Off);
                }
            }
            "max-retry-attempts" => {
                self.config.max_retry_attempts = parse_number(name, value)?;
            }
            _ => {
                return Err(GraphError::Config(format!("invalid parameter name: {name}")));
            }
        }
        Ok(())
    }

    /// Looks up a node id by its application key.
    pub fn node_id(&self, key: &str) -> Option<NodeId> {
        self.keys.get(key).copied()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.pg.node_weight(id)
    }

    /// The name under which the worker produces the node's output.
    pub fn outfile_remote_name(&self, id: NodeId) -> Result<&str, GraphError> {
        Ok(&self.node_checked(id)?.remote_name)
    }

    /// The local path of a node's output. Only valid for the local class:
    /// it is the only class the driver can retrieve through the standard
    /// file-return path.
    pub fn local_outfile_source(&self, id: NodeId) -> Result<&Path, GraphError> {
        let node = self.node_checked(id)?;
        match &node.output {
            Some(OutputClass::Local(path)) => Ok(path),
            _ => Err(GraphError::Config(format!(
                "node {} does not have a local output file",
                node.key
            ))),
        }
    }

    pub fn heavy_score(&self, id: NodeId) -> Result<f64, GraphError> {
        Ok(self.node_checked(id)?.heavy_score)
    }

    ///
    /// Writes the graph in GraphViz DOT form, one node per line labeled with
    /// its key, storage class and prune status. Intended for debugging runs
    /// after the fact; workflows of this scale are diagnosed from logs and
    /// renderings, not debuggers.
    ///
    pub fn visualize(&self, path: &Path) -> io::Result<()> {
        let rendered = self.pg.filter_map(
            |_, node| {
                Some(format!(
                    "{} ({}, {:?})",
                    node.key,
                    node.output.as_ref().map_or("unassigned", OutputClass::label),
                    node.prune_status
                ))
            },
            |_, _| Some(String::new()),
        );

        let file = File::create(path)?;
        let mut f = BufWriter::new(file);
        f.write_all(
            format!(
                "{}",
                dot::Dot::with_config(&rendered, &[dot::Config::EdgeNoLabel])
            )
            .as_bytes(),
        )?;
        f.flush()
    }

    /// Wall-clock span from the first task dispatch to the last retrieval.
    pub fn makespan_us(&self) -> u64 {
        match (self.stats.first_dispatch_us, self.stats.last_retrieval_us) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        }
    }

    pub fn regular_completed(&self) -> usize {
        self.stats.regular_completed
    }

    pub fn recovery_observed(&self) -> u64 {
        self.stats.recovery_observed
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut M {
        &mut self.manager
    }

    pub(crate) fn node_checked(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.pg
            .node_weight(id)
            .ok_or_else(|| GraphError::UnknownNode(format!("{id:?}")))
    }

    fn node_mut_checked(&mut self, id: NodeId) -> Result<&mut Node, GraphError> {
        self.pg
            .node_weight_mut(id)
            .ok_or_else(|| GraphError::UnknownNode(format!("{id:?}")))
    }

    pub(crate) fn parents(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.pg.neighbors_directed(id, Direction::Incoming)
    }

    pub(crate) fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.pg.neighbors_directed(id, Direction::Outgoing)
    }
}

impl<M: Manager> Drop for Graph<M> {
    ///
    /// Tears everything down: every input and output file is pruned from the
    /// workers and dropped from the Manager's file table, and
    /// shared-filesystem outputs are unlinked. Unlinking a file that has
    /// already been unlinked is not an error.
    ///
    fn drop(&mut self) {
        for id in self.pg.node_indices().collect::<Vec<_>>() {
            let (infile, outfile, shared_path) = {
                let node = &self.pg[id];
                (
                    node.infile,
                    node.outfile,
                    node.shared_path().map(Path::to_path_buf),
                )
            };
            self.manager.prune_file(infile);
            self.manager.forget_file(infile);
            if let Some(outfile) = outfile {
                self.manager.prune_file(outfile);
                self.manager.forget_file(outfile);
                self.cached_outputs.remove(&outfile);
            }
            if let Some(path) = shared_path {
                let _ = fs::remove_file(path);
            }
        }
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, GraphError> {
    value
        .parse()
        .map_err(|_| GraphError::Config(format!("invalid value for {name}: {value}")))
}

fn ensure_dir(value: &str) -> Result<PathBuf, GraphError> {
    fs::create_dir_all(value)
        .map_err(|e| GraphError::Config(format!("failed to create directory {value}: {e}")))?;
    Ok(PathBuf::from(value))
}

#[cfg(test)]
mod prune_tests;
