// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use fixedbitset::FixedBitSet;
use fnv::FnvHashSet;
use log::{debug, error};
use petgraph::visit::{NodeIndexable, VisitMap, Visitable};

use crate::manager::{CacheLevel, Manager};
use crate::node::{NodeId, OutputClass};
use crate::{Graph, GraphError};

impl<M: Manager> Graph<M> {
    ///
    /// Produces a topological order of the whole graph, breaking ties on the
    /// node key so the order is deterministic across runs. An undercount
    /// means a cycle: that is a fatal configuration error, reported with a
    /// dump of every node still holding unresolved parents.
    ///
    pub(crate) fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let total = self.pg.node_count();
        let mut in_degree = vec![0usize; self.pg.node_bound()];
        let mut ready = BinaryHeap::new();

        for id in self.pg.node_indices() {
            let degree = self.parents(id).count();
            in_degree[id.index()] = degree;
            if degree == 0 {
                ready.push(Reverse((self.pg[id].key.clone(), id)));
            }
        }

        let mut order = Vec::with_capacity(total);
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id);
            for child in self.children(id).collect::<Vec<_>>() {
                in_degree[child.index()] -= 1;
                if in_degree[child.index()] == 0 {
                    ready.push(Reverse((self.pg[child].key.clone(), child)));
                }
            }
        }

        if order.len() != total {
            error!(
                "graph contains cycles or is malformed: expected {total} nodes, sorted {}",
                order.len()
            );
            for id in self.pg.node_indices() {
                if in_degree[id.index()] > 0 {
                    error!(
                        "  node {} has in-degree {}; parents:",
                        self.pg[id].key,
                        in_degree[id.index()]
                    );
                    for parent in self.parents(id) {
                        error!("    -> {}", self.pg[parent].key);
                    }
                }
            }
            return Err(GraphError::Cycle {
                sorted: order.len(),
                total,
            });
        }

        Ok(order)
    }

    ///
    /// Computes depth, height, transitive subgraph sizes, fan-in/out and the
    /// heavy score for every node, then assigns each node its output storage
    /// class. Must be called after all nodes and edges are added and before
    /// execution.
    ///
    /// Metric computation is idempotent; class assignment runs only on the
    /// first call, since a node's class is final once assigned.
    ///
    pub fn compute_topology_metrics(&mut self) -> Result<(), GraphError> {
        let order = self.topological_order()?;

        // Depth in forward order, height in reverse order.
        for &id in &order {
            let depth = self
                .parents(id)
                .map(|p| self.pg[p].metrics.depth + 1)
                .max()
                .unwrap_or(0);
            self.pg[id].metrics.depth = depth;
        }
        for &id in order.iter().rev() {
            let height = self
                .children(id)
                .map(|c| self.pg[c].metrics.height + 1)
                .max()
                .unwrap_or(0);
            self.pg[id].metrics.height = height;
        }

        // Transitive parent/child sets by set-union propagation along the
        // topological order.
        let bound = self.pg.node_bound();
        let mut upstream: Vec<FnvHashSet<NodeId>> = vec![FnvHashSet::default(); bound];
        let mut downstream: Vec<FnvHashSet<NodeId>> = vec![FnvHashSet::default(); bound];
        for &id in &order {
            for parent in self.parents(id).collect::<Vec<_>>() {
                let inherited = upstream[parent.index()].clone();
                let own = &mut upstream[id.index()];
                own.extend(inherited);
                own.insert(parent);
            }
        }
        for &id in order.iter().rev() {
            for child in self.children(id).collect::<Vec<_>>() {
                let inherited = downstream[child.index()].clone();
                let own = &mut downstream[id.index()];
                own.extend(inherited);
                own.insert(child);
            }
        }

        for &id in &order {
            let fan_in = self.parents(id).count();
            let fan_out = self.children(id).count();
            let node = &mut self.pg[id];
            node.metrics.upstream_subgraph_size = upstream[id.index()].len();
            node.metrics.downstream_subgraph_size = downstream[id.index()].len();
            node.metrics.fan_in = fan_in;
            node.metrics.fan_out = fan_out;
            node.heavy_score = node.metrics.heavy_score();
        }

        if !self.topology_assigned {
            self.assign_output_classes(&order);
            self.topology_assigned = true;
        }

        self.log_component_census();

        Ok(())
    }

    ///
    /// Assigns each node its output class, walking nodes in descending order
    /// of heavy score: targets are always local, the heaviest
    /// `(total - targets) * checkpoint_fraction` non-targets become
    /// shared-filesystem checkpoints, and everything else is ephemeral.
    /// Declared outputs are bound onto the tasks so the Manager knows to
    /// transfer or record them.
    ///
    fn assign_output_classes(&mut self, order: &[NodeId]) {
        let total = order.len();
        let targets = order.iter().filter(|&&id| self.pg[id].is_target).count();
        let checkpoint_count =
            ((total - targets) as f64 * self.config.checkpoint_fraction) as usize;

        let mut by_weight: Vec<NodeId> = order.to_vec();
        by_weight.sort_by(|&a, &b| {
            self.pg[b]
                .heavy_score
                .partial_cmp(&self.pg[a].heavy_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.pg[a].key.cmp(&self.pg[b].key))
        });

        let mut assigned_checkpoints = 0;
        for id in by_weight {
            if self.pg[id].is_target {
                // Declared as a managed file so it is retrieved to the output
                // directory through the standard file-return path.
                let path = self.config.output_dir.join(&self.pg[id].remote_name);
                let file = self.manager.declare_file(&path, CacheLevel::Workflow);
                let node = &mut self.pg[id];
                node.outfile = Some(file);
                node.output = Some(OutputClass::Local(path));
            } else if assigned_checkpoints < checkpoint_count {
                // Checkpointed outputs are written straight to the shared
                // filesystem; the Manager does not track them.
                let path = self.config.checkpoint_dir.join(&self.pg[id].remote_name);
                let node = &mut self.pg[id];
                node.remote_name = path.to_string_lossy().into_owned();
                node.output = Some(OutputClass::Shared(path));
                assigned_checkpoints += 1;
            } else {
                let file = self.manager.declare_temp();
                let node = &mut self.pg[id];
                node.outfile = Some(file);
                node.output = Some(OutputClass::Temp);
            }
        }

        for &id in order {
            let node = &mut self.pg[id];
            if let Some(outfile) = node.outfile {
                let remote_name = node.remote_name.clone();
                node.task.add_output(outfile, remote_name);
            }
        }
    }

    /// Counts the weakly connected components. Debug output only, but
    /// invaluable when a workflow that should be one component turns out to
    /// be several.
    fn log_component_census(&self) {
        let mut visited: FixedBitSet = self.pg.visit_map();
        let mut component_sizes = Vec::new();

        for start in self.pg.node_indices() {
            if !visited.visit(start) {
                continue;
            }
            let mut size = 1;
            let mut queue = VecDeque::from([start]);
            while let Some(id) = queue.pop_front() {
                for neighbor in self.pg.neighbors_undirected(id) {
                    if visited.visit(neighbor) {
                        size += 1;
                        queue.push_back(neighbor);
                    }
                }
            }
            component_sizes.push(size);
        }

        debug!(
            "graph has {} weakly connected components",
            component_sizes.len()
        );
        for (index, size) in component_sizes.iter().enumerate() {
            debug!("component {index} size: {size}");
        }
    }
}
