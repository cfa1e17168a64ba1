// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use fnv::FnvHashSet;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info, warn};

use crate::manager::{Manager, TaskKind, TaskResult};
use crate::node::{NodeId, OutputClass};
use crate::{timestamp_us, Graph, GraphError};

/// Process-wide interrupt state, set by the SIGINT handler and polled at the
/// top of every loop iteration. Once set it stays set, exactly like the
/// signal it mirrors.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t);
    }
}

impl<M: Manager> Graph<M> {
    fn interrupted(&self) -> bool {
        match &self.interrupt_override {
            Some(flag) => flag.load(Ordering::Relaxed),
            None => INTERRUPTED.load(Ordering::Relaxed),
        }
    }

    ///
    /// Drives the graph to completion: seeds the initially-ready nodes,
    /// drains the Manager, retries failed tasks, prunes reclaimed outputs
    /// and reports progress. Blocks until every regular node has completed
    /// or the run is interrupted.
    ///
    /// Topology metrics must have been computed first, and a graph executes
    /// at most once.
    ///
    pub fn execute(&mut self) -> Result<(), GraphError> {
        if !self.topology_assigned {
            return Err(GraphError::Config(
                "compute_topology_metrics must be called before execute".to_string(),
            ));
        }
        if self.executed {
            return Err(GraphError::Config(
                "a graph can only be executed once".to_string(),
            ));
        }
        self.executed = true;

        install_sigint_handler();

        debug!("start executing task graph");
        for id in self.pg.node_indices().collect::<Vec<_>>() {
            self.debug_dump_node(id);
        }

        // Recovery tasks must flow back through wait so the loop can observe
        // them and count progress honestly.
        self.manager.enable_return_recovery_tasks();

        for id in self.pg.node_indices().collect::<Vec<_>>() {
            if let Some(outfile) = self.pg[id].outfile {
                self.cached_outputs.insert(outfile, id);
            }
        }

        // Declare every parent output as an input of the child task under the
        // parent's remote name; this is what lets the Manager stage files
        // between workers.
        let order = self.topological_order()?;
        for &id in &order {
            let inputs: Vec<_> = self
                .parents(id)
                .filter_map(|p| {
                    let parent = &self.pg[p];
                    parent
                        .outfile
                        .map(|file| (file, parent.remote_name.clone()))
                })
                .collect();
            let node = &mut self.pg[id];
            for (file, remote_name) in inputs {
                node.task.add_input(file, remote_name);
            }
        }

        for &id in &order {
            let pending: FnvHashSet<NodeId> = self.parents(id).collect();
            self.pg[id].pending_parents = pending;
        }

        for &id in &order {
            if self.pg[id].pending_parents.is_empty() {
                self.submit_node(id);
            }
        }

        let total_regular = self.pg.node_count();
        let mut next_failure_threshold = if self.config.failure_injection_step_percent > 0.0 {
            self.config.failure_injection_step_percent / 100.0
        } else {
            f64::INFINITY
        };

        let draw_hz = (1.0 / self.config.progress_update_interval_sec)
            .round()
            .clamp(1.0, 60.0) as u8;
        let multi = MultiProgress::with_draw_target(ProgressDrawTarget::stderr_with_hz(draw_hz));
        let style = ProgressStyle::default_bar()
            .template("{prefix:>8} [{bar:30}] {pos}/{len} ({elapsed_precise})")
            .expect("Valid template.");
        let regular_bar = multi.add(ProgressBar::new(total_regular as u64).with_style(style.clone()));
        regular_bar.set_prefix("Regular");
        let recovery_bar = multi.add(ProgressBar::new(0).with_style(style));
        recovery_bar.set_prefix("Recovery");

        let base_timeout = Duration::from_secs(1);
        let mut wait_timeout = base_timeout;

        while self.stats.regular_completed < total_regular {
            if self.interrupted() {
                info!(
                    "interrupted with {} of {total_regular} nodes completed",
                    self.stats.regular_completed
                );
                break;
            }

            let report = self.manager.wait(wait_timeout);
            recovery_bar.set_length(self.manager.submitted_recovery_tasks());
            let Some(report) = report else {
                wait_timeout = base_timeout;
                recovery_bar.tick();
                continue;
            };
            // A returned task often means more are already retrievable:
            // drain them without sleeping.
            wait_timeout = Duration::ZERO;

            let postprocessing_start = timestamp_us();
            let id = self.resolve_report(&report);

            if report.result != TaskResult::Success || report.exit_code != 0 {
                if report.kind == TaskKind::Recovery {
                    // The Manager owns the retry policy for recovery tasks.
                    warn!(
                        "recovery task {} for node {} failed (result={}, exit={})",
                        report.task_id, self.pg[id].key, report.result, report.exit_code
                    );
                    continue;
                }
                let node = &mut self.pg[id];
                if node.retries_left == 0 {
                    error!(
                        "task {} failed (result={}, exit={}); node {} has no retries left, aborting",
                        report.task_id, report.result, report.exit_code, node.key
                    );
                    return Err(GraphError::TaskFailed {
                        key: node.key.clone(),
                        result: report.result,
                        exit_code: report.exit_code,
                    });
                }
                node.retries_left -= 1;
                warn!(
                    "task {} failed (result={}, exit={}); retrying node {} (remaining={})",
                    report.task_id, report.result, report.exit_code, node.key, node.retries_left
                );
                self.submit_node(id);
                continue;
            }

            // Shared-filesystem outputs bypass the Manager, so the only
            // proof of existence is a stat on the expected path. A missing
            // file is a task failure regardless of the reported result.
            let class = self.pg[id]
                .output
                .clone()
                .expect("output class is assigned before execution");
            match &class {
                OutputClass::Shared(path) => match fs::metadata(path) {
                    Ok(meta) => self.pg[id].outfile_size_bytes = meta.len(),
                    Err(_) => {
                        let node = &mut self.pg[id];
                        if node.retries_left == 0 {
                            error!(
                                "task {} succeeded but sharedfs output {} is missing; no retries \
                                 left for node {}, aborting",
                                report.task_id,
                                path.display(),
                                node.key
                            );
                            return Err(GraphError::MissingSharedOutput {
                                key: node.key.clone(),
                                path: path.clone(),
                            });
                        }
                        node.retries_left -= 1;
                        warn!(
                            "task {} succeeded but sharedfs output {} is missing; retrying node \
                             {} (remaining={})",
                            report.task_id,
                            path.display(),
                            node.key,
                            node.retries_left
                        );
                        self.submit_node(id);
                        continue;
                    }
                },
                OutputClass::Local(_) | OutputClass::Temp => {
                    if let Some(outfile) = self.pg[id].outfile {
                        self.pg[id].outfile_size_bytes = self.manager.file_size(outfile);
                    }
                }
            }

            if report.kind == TaskKind::Recovery {
                // The node already completed once; the Manager's recovery
                // path handles any descendants that depend on the recovered
                // file. We only account for it.
                self.stats.recovery_observed += 1;
                recovery_bar.inc(1);
                continue;
            }

            let node = &mut self.pg[id];
            if node.completed {
                panic!(
                    "node {} reported a second regular completion, this indicates a serious bug",
                    node.key
                );
            }
            node.completed = true;
            node.timings.scheduling_us = report.timings.scheduling_us;
            node.timings.commit_us = report.timings.commit_us;
            node.timings.execution_us = report.timings.execution_us;
            node.timings.retrieval_us = report.timings.retrieval_us;
            self.stats.last_retrieval_us = Some(timestamp_us());
            debug!(
                "node {} completed with outfile {} size: {} bytes",
                self.pg[id].key, self.pg[id].remote_name, self.pg[id].outfile_size_bytes
            );

            self.prune_ancestors(id);

            // Anchor elapsed time to the first real completion rather than
            // loop startup.
            if self.stats.regular_completed == 0 {
                regular_bar.reset_elapsed();
            }

            self.update_critical_path_time(id);

            self.stats.regular_completed += 1;
            regular_bar.inc(1);

            if self.config.failure_injection_step_percent > 0.0 {
                let progress = self.stats.regular_completed as f64 / total_regular as f64;
                if progress >= next_failure_threshold && self.manager.evict_random_worker() {
                    debug!(
                        "evicted a worker at {:.2}% (threshold {:.2}%)",
                        progress * 100.0,
                        next_failure_threshold * 100.0
                    );
                    next_failure_threshold += self.config.failure_injection_step_percent / 100.0;
                }
            }

            if class == OutputClass::Temp {
                if let Some(outfile) = self.pg[id].outfile {
                    self.manager.temp_replicate_file_later(outfile);
                }
            }

            self.activate_children(id);

            self.pg[id].timings.postprocessing_us = timestamp_us() - postprocessing_start;
        }

        regular_bar.finish();
        recovery_bar.finish();

        debug!(
            "total time spent pruning ancestors of ephemeral nodes: {:.6} seconds",
            self.stats.time_prune_temp_us as f64 / 1e6
        );
        debug!(
            "total time spent pruning ancestors of persisted nodes: {:.6} seconds",
            self.stats.time_prune_persisted_us as f64 / 1e6
        );
        debug!(
            "total time spent unlinking shared-filesystem files: {:.6} seconds",
            self.stats.time_unlink_us as f64 / 1e6
        );

        if let Some(path) = self.config.time_metrics_path.clone() {
            if let Err(e) = self.write_time_metrics(&path) {
                error!("failed to write time metrics to {}: {e}", path.display());
            }
        }

        Ok(())
    }

    fn update_critical_path_time(&mut self, id: NodeId) {
        let max_parent = self
            .parents(id)
            .map(|p| self.pg[p].critical_path_time_us)
            .max()
            .unwrap_or(0);
        let node = &mut self.pg[id];
        node.critical_path_time_us = max_parent + node.timings.execution_us;
    }

    fn write_time_metrics(&self, path: &Path) -> io::Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(
            w,
            "node_id,submission_time_us,scheduling_time_us,commit_time_us,execution_time_us,\
             retrieval_time_us,postprocessing_time_us"
        )?;
        for id in self.pg.node_indices() {
            let node = &self.pg[id];
            let t = &node.timings;
            writeln!(
                w,
                "{},{},{},{},{},{},{}",
                node.key,
                t.submission_us,
                t.scheduling_us,
                t.commit_us,
                t.execution_us,
                t.retrieval_us,
                t.postprocessing_us
            )?;
        }
        w.flush()
    }

    /// Deterministic dump of one node. Workflows of this scale are debugged
    /// largely from logs.
    fn debug_dump_node(&self, id: NodeId) {
        let node = &self.pg[id];
        debug!("---------------- Node Info ----------------");
        debug!("key: {}", node.key);
        debug!("is_target: {}", node.is_target);
        debug!("depth: {}", node.metrics.depth);
        debug!("height: {}", node.metrics.height);
        debug!("prune_depth: {}", node.prune_depth);
        debug!("outfile_remote_name: {}", node.remote_name);
        debug!(
            "outfile_type: {}",
            node.output.as_ref().map_or("unassigned", OutputClass::label)
        );
        let parents = self.joined_keys(self.parents(id));
        let children = self.joined_keys(self.children(id));
        debug!("parents: {parents}");
        debug!("children: {children}");
        debug!("-------------------------------------------");
    }

    fn joined_keys(&self, ids: impl Iterator<Item = NodeId>) -> String {
        let keys: Vec<&str> = ids.map(|n| self.pg[n].key.as_str()).collect();
        if keys.is_empty() {
            "(none)".to_string()
        } else {
            keys.join(", ")
        }
    }
}
