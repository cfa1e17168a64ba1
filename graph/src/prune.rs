// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Incremental reclamation of intermediate outputs.
//!
//! Outputs fall into two durability classes. Completed local and
//! shared-filesystem outputs are *persisted*: a worker crash cannot lose
//! them, so a completion of one proves the whole upstream subtree reachable
//! only through persisted consumers can never be needed again. Completed
//! ephemeral outputs prove nothing of the sort: the Manager may lose one to
//! a worker failure and recompute it with a recovery task that needs the
//! very inputs we would like to delete. The two pruning paths below encode
//! that asymmetry; mixing them up turns storage reclamation into silent
//! recomputation storms.

use std::collections::VecDeque;
use std::fs;

use fixedbitset::FixedBitSet;
use log::debug;
use petgraph::visit::{VisitMap, Visitable};

use crate::manager::Manager;
use crate::node::{NodeId, OutputClass, PruneStatus};
use crate::{timestamp_us, Graph};

impl<M: Manager> Graph<M> {
    ///
    /// The set of ancestors exactly `depth` hops up the parent relation.
    /// A depth of zero is the node itself. The visited set keeps diamond
    /// topologies from being walked twice.
    ///
    pub(crate) fn find_parents_at_depth(&self, start: NodeId, depth: u32) -> Vec<NodeId> {
        let mut visited: FixedBitSet = self.pg.visit_map();
        let mut result = Vec::new();
        let mut stack = vec![(start, depth)];

        while let Some((id, remaining)) = stack.pop() {
            if !visited.visit(id) {
                continue;
            }
            if remaining == 0 {
                result.push(id);
                continue;
            }
            for parent in self.parents(id) {
                stack.push((parent, remaining - 1));
            }
        }

        result
    }

    ///
    /// The set of ancestors (excluding `start`) whose outputs can never be
    /// needed again once `start` has completed with a persisted output.
    ///
    /// A reverse breadth-first walk from `start`. A parent joins the safe
    /// set only if every one of its children outside the walked subgraph is
    /// completed with a persisted output and was not unsafely pruned; the
    /// walk refuses to cross a parent that fails the test, because some
    /// consumer of it could still trigger a recovery chain. A parent already
    /// marked `Safe` is a sealed boundary: no work remains behind it, which
    /// is what keeps the amortized cost of pruning linear over the whole
    /// workflow.
    ///
    pub(crate) fn find_safe_ancestors(&self, start: NodeId) -> Vec<NodeId> {
        let mut visited: FixedBitSet = self.pg.visit_map();
        visited.visit(start);

        let mut safe = Vec::new();
        let mut queue = VecDeque::from([start]);

        while let Some(current) = queue.pop_front() {
            for parent in self.parents(current) {
                if visited.is_visited(&parent) {
                    continue;
                }
                if self.pg[parent].prune_status == PruneStatus::Safe {
                    continue;
                }

                let mut all_children_safe = true;
                for child in self.children(parent) {
                    if visited.is_visited(&child) {
                        continue;
                    }
                    if !self.pg[child].output_is_persisted() {
                        all_children_safe = false;
                        break;
                    }
                    if self.pg[child].prune_status == PruneStatus::Unsafe {
                        all_children_safe = false;
                        break;
                    }
                }
                if !all_children_safe {
                    continue;
                }

                visited.visit(parent);
                queue.push_back(parent);
                safe.push(parent);
            }
        }

        safe
    }

    ///
    /// Reclaims whatever the completion of `id` has made reclaimable.
    /// Invoked exactly once per node, immediately after it is marked
    /// completed; recovery-task completions do not come through here.
    ///
    pub(crate) fn prune_ancestors(&mut self, id: NodeId) {
        if self.config.prune_depth == 0 {
            return;
        }
        if !self.pg[id].completed {
            return;
        }

        let start_time = timestamp_us();
        let pruned = if self.pg[id].output_is_persisted() {
            self.prune_ancestors_of_persisted(id)
        } else {
            self.prune_ancestors_of_ephemeral(id)
        };

        debug!(
            "pruned {pruned} ancestors of node {} in {:.6} seconds",
            self.pg[id].key,
            (timestamp_us() - start_time) as f64 / 1e6
        );
    }

    ///
    /// The aggressive path: `id` completed with a durable output, so every
    /// safe ancestor's output is deleted for good. Shared-filesystem files
    /// are unlinked directly; ephemeral replicas are removed from every
    /// worker; local files are left in place, they are the driver's to
    /// consume. Each reclaimed ancestor becomes `Safe`, which is terminal.
    ///
    fn prune_ancestors_of_persisted(&mut self, id: NodeId) -> usize {
        let start_time = timestamp_us();
        let ancestors = self.find_safe_ancestors(id);

        let mut pruned = 0;
        for ancestor in ancestors {
            let class = self.pg[ancestor]
                .output
                .clone()
                .expect("output class is assigned before execution");
            match class {
                OutputClass::Local(_) => {}
                OutputClass::Temp => {
                    if let Some(outfile) = self.pg[ancestor].outfile {
                        self.manager.prune_file(outfile);
                    }
                }
                OutputClass::Shared(path) => {
                    let unlink_start = timestamp_us();
                    // Unlinking an already-unlinked file is not an error.
                    let _ = fs::remove_file(&path);
                    self.stats.time_unlink_us += timestamp_us() - unlink_start;
                }
            }
            self.pg[ancestor].prune_status = PruneStatus::Safe;
            pruned += 1;
        }

        self.stats.time_prune_persisted_us += timestamp_us() - start_time;
        pruned
    }

    ///
    /// The cautious path: `id` completed with an ephemeral output, which
    /// proves nothing about persistence of this subtree. Only ancestors at
    /// exactly `prune_depth` hops producing ephemeral outputs are
    /// candidates, and a candidate is released only when all of its children
    /// are complete and none of their ephemeral outputs has a recovery task
    /// mid-flight; a live recovery task may need the candidate as input.
    /// Released ancestors become `Unsafe`: deleted, but the Manager may ask
    /// for them back.
    ///
    fn prune_ancestors_of_ephemeral(&mut self, id: NodeId) -> usize {
        let node = &self.pg[id];
        if node.outfile.is_none() || node.prune_depth == 0 {
            return 0;
        }
        let depth = node.prune_depth;

        let start_time = timestamp_us();
        let candidates = self.find_parents_at_depth(id, depth);

        let mut pruned = 0;
        'candidates: for parent in candidates {
            if self.pg[parent].output != Some(OutputClass::Temp) {
                continue;
            }
            if self.pg[parent].prune_status == PruneStatus::Safe {
                continue;
            }

            for child in self.children(parent).collect::<Vec<_>>() {
                let child_node = &self.pg[child];
                if !child_node.completed {
                    continue 'candidates;
                }
                if child_node.output == Some(OutputClass::Temp) {
                    if let Some(outfile) = child_node.outfile {
                        if self.manager.recovery_state(outfile).is_in_flight() {
                            continue 'candidates;
                        }
                    }
                }
            }

            if let Some(outfile) = self.pg[parent].outfile {
                pruned += self.manager.prune_file(outfile);
            }
            self.pg[parent].prune_status = PruneStatus::Unsafe;
        }

        self.stats.time_prune_temp_us += timestamp_us() - start_time;
        pruned
    }
}
