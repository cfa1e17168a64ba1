// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use log::{debug, error};
use rand::Rng;
use strum_macros::{EnumString, IntoStaticStr};

use crate::manager::{Manager, TaskReport};
use crate::node::NodeId;
use crate::{timestamp_us, Graph};

///
/// How ready tasks are ordered when more of them exist than the fleet can
/// run. Selectable per graph via the `task-priority-mode` knob.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, EnumString, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum TaskPriorityMode {
    Random,
    DepthFirst,
    BreadthFirst,
    Fifo,
    Lifo,
    LargestInputFirst,
    LargestStorageFootprintFirst,
}

impl<M: Manager> Graph<M> {
    ///
    /// Scores a node under the selected priority mode. Input-size modes sum
    /// over parents whose output is materialized as a managed file;
    /// shared-filesystem parents have no tracked file object and are
    /// skipped.
    ///
    pub(crate) fn task_priority(&self, id: NodeId) -> f64 {
        let node = &self.pg[id];
        match self.config.priority_mode {
            TaskPriorityMode::Random => rand::thread_rng().gen::<f64>(),
            TaskPriorityMode::DepthFirst => node.metrics.depth as f64,
            TaskPriorityMode::BreadthFirst => -(node.metrics.depth as f64),
            TaskPriorityMode::Fifo => -(timestamp_us() as f64),
            TaskPriorityMode::Lifo => timestamp_us() as f64,
            TaskPriorityMode::LargestInputFirst => self
                .parents(id)
                .filter_map(|p| self.pg[p].outfile)
                .map(|file| self.manager.file_size(file) as f64)
                .sum(),
            TaskPriorityMode::LargestStorageFootprintFirst => self
                .parents(id)
                .filter_map(|p| {
                    let parent = &self.pg[p];
                    parent
                        .outfile
                        .map(|file| (file, parent.timings.execution_us))
                })
                .map(|(file, execution_us)| {
                    self.manager.file_size(file) as f64 * execution_us as f64
                })
                .sum(),
        }
    }

    ///
    /// Submits a node's task: computes its priority, hands the task to the
    /// Manager, and records the returned task id so the completion can be
    /// mapped back. The cost of the submit call itself is recorded on the
    /// node, off the critical path.
    ///
    pub(crate) fn submit_node(&mut self, id: NodeId) {
        let priority = self.task_priority(id);

        let start = timestamp_us();
        let node = &mut self.pg[id];
        node.task.set_priority(priority);
        let task_id = self.manager.submit(&node.task);
        node.timings.submission_us = timestamp_us() - start;

        self.tasks.insert(task_id, id);
        if self.stats.first_dispatch_us.is_none() {
            self.stats.first_dispatch_us = Some(start);
        }

        debug!(
            "submitted node {} with task id {task_id}",
            self.pg[id].key
        );
    }

    ///
    /// Maps a returned task back to its node. Standard tasks resolve
    /// directly through the task map. Recovery tasks were never submitted by
    /// us, so when the direct lookup misses we scan the report's output
    /// bindings for the original producer's task id and map that instead.
    /// If neither lookup succeeds the protocol has been violated and we
    /// abort.
    ///
    pub(crate) fn resolve_report(&self, report: &TaskReport) -> NodeId {
        if let Some(&id) = self.tasks.get(&report.task_id) {
            return id;
        }
        for output in &report.outputs {
            if let Some(producer) = output.original_producer_task_id {
                if let Some(&id) = self.tasks.get(&producer) {
                    return id;
                }
            }
        }
        error!(
            "fatal: task {} ({:?}) could not be mapped to a node, this indicates a serious bug",
            report.task_id, report.kind
        );
        panic!(
            "task {} has no originating node and no original producer task id",
            report.task_id
        );
    }

    ///
    /// Walks a completed node's children, removing the node from each
    /// child's pending-parents set; a child whose set drains is submitted.
    /// An edge must fire exactly once even under retries, so a parent that
    /// is already absent from the set means a double activation: that is a
    /// protocol bug and we abort rather than corrupt the schedule.
    ///
    pub(crate) fn activate_children(&mut self, id: NodeId) {
        for child in self.children(id).collect::<Vec<_>>() {
            if !self.pg[child].pending_parents.remove(&id) {
                panic!(
                    "inconsistent pending set: child={} missing parent={}",
                    self.pg[child].key, self.pg[id].key
                );
            }
            if self.pg[child].pending_parents.is_empty() {
                self.submit_node(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskPriorityMode;

    #[test]
    fn priority_mode_strings_parse() {
        for (s, mode) in [
            ("random", TaskPriorityMode::Random),
            ("depth-first", TaskPriorityMode::DepthFirst),
            ("breadth-first", TaskPriorityMode::BreadthFirst),
            ("fifo", TaskPriorityMode::Fifo),
            ("lifo", TaskPriorityMode::Lifo),
            ("largest-input-first", TaskPriorityMode::LargestInputFirst),
            (
                "largest-storage-footprint-first",
                TaskPriorityMode::LargestStorageFootprintFirst,
            ),
        ] {
            assert_eq!(s.parse::<TaskPriorityMode>().unwrap(), mode);
        }
    }

    #[test]
    fn unknown_priority_mode_is_rejected() {
        assert!("steepest-descent".parse::<TaskPriorityMode>().is_err());
    }
}
