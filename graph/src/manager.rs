// Copyright 2025 Trellis project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::path::Path;
use std::time::Duration;

///
/// An opaque handle to a file tracked by the Manager: a concrete file on the
/// manager host, an ephemeral worker-side temp file, or an in-memory buffer
/// shipped as a task input.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FileId(pub u64);

/// Identifier assigned by the Manager when a task is submitted.
pub type TaskId = u64;

/// How long the Manager should keep a declared file cached on workers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheLevel {
    /// Discarded as soon as the consuming task is done.
    Task,
    /// Retained for the lifetime of the workflow.
    Workflow,
}

/// Whether a returned task was submitted by us or synthesized by the Manager
/// to recompute a lost ephemeral output.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    Standard,
    Recovery,
}

/// Outcome reported by the Manager for a finished task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskResult {
    Success,
    InputMissing,
    OutputMissing,
    WorkerFailure,
}

impl fmt::Display for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            TaskResult::Success => "success",
            TaskResult::InputMissing => "input missing",
            TaskResult::OutputMissing => "output missing",
            TaskResult::WorkerFailure => "worker failure",
        };
        write!(f, "{s}")
    }
}

///
/// The state of the recovery task (if any) that the Manager holds for an
/// ephemeral file. A file whose recovery task is mid-flight still needs its
/// inputs, so its producers must not be pruned underneath it.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecoveryState {
    /// No recovery task exists for the file.
    None,
    /// A recovery task exists but has not been dispatched.
    Initial,
    /// A recovery task is currently queued or running.
    InFlight,
    /// The recovery task ran to completion.
    Done,
}

impl RecoveryState {
    pub fn is_in_flight(self) -> bool {
        self == RecoveryState::InFlight
    }
}

/// One input or output attachment of a task: the file and the name under
/// which it appears in the task's sandbox.
#[derive(Clone, Debug)]
pub struct TaskBinding {
    pub file: FileId,
    pub remote_name: String,
}

///
/// A task as the core describes it to the Manager: the pre-loaded function to
/// invoke, the library hosting it, a scheduling priority, and the file
/// bindings the Manager must stage in and collect out.
///
#[derive(Clone, Debug)]
pub struct Task {
    pub function: String,
    pub library: Option<String>,
    pub priority: f64,
    pub inputs: Vec<TaskBinding>,
    pub outputs: Vec<TaskBinding>,
}

impl Task {
    pub fn new(function: impl Into<String>) -> Task {
        Task {
            function: function.into(),
            library: None,
            priority: 0.0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn set_library_required(&mut self, library: impl Into<String>) {
        self.library = Some(library.into());
    }

    pub fn add_input(&mut self, file: FileId, remote_name: impl Into<String>) {
        self.inputs.push(TaskBinding {
            file,
            remote_name: remote_name.into(),
        });
    }

    pub fn add_output(&mut self, file: FileId, remote_name: impl Into<String>) {
        self.outputs.push(TaskBinding {
            file,
            remote_name: remote_name.into(),
        });
    }

    pub fn set_priority(&mut self, priority: f64) {
        self.priority = priority;
    }
}

/// An output attachment of a returned task. For recovery tasks the Manager
/// records which original submission produced the file being recomputed.
#[derive(Clone, Debug)]
pub struct OutputReport {
    pub file: FileId,
    pub original_producer_task_id: Option<TaskId>,
}

/// Timing figures the Manager measured for a returned task, in microseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReportTimings {
    pub scheduling_us: u64,
    pub commit_us: u64,
    pub execution_us: u64,
    pub retrieval_us: u64,
    /// Epoch microseconds at which the task began committing to a worker.
    pub commit_start_us: u64,
}

/// A finished task handed back by [`Manager::wait`].
#[derive(Clone, Debug)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub result: TaskResult,
    pub exit_code: i32,
    pub outputs: Vec<OutputReport>,
    pub timings: ReportTimings,
}

///
/// The external collaborator that owns workers, sockets and transfers. The
/// graph drives it through this interface and nothing else; all concurrency
/// lives behind it.
///
/// The methods mirror the manager-facing operations the orchestration layer
/// consumes: file declarations, task submission and retrieval, replica
/// pruning, temp replication, and the test-only worker eviction hook.
///
pub trait Manager {
    /// Declares a concrete file on the manager host. The worker's output is
    /// transferred back to `path` when the producing task finishes.
    fn declare_file(&mut self, path: &Path, cache: CacheLevel) -> FileId;

    /// Declares an ephemeral file that lives only on worker-local storage.
    fn declare_temp(&mut self) -> FileId;

    /// Declares an in-memory buffer shipped to workers as a task input.
    /// `unlink_when_done` asks the worker to remove its copy once the
    /// consuming task completes.
    fn declare_buffer(&mut self, bytes: &[u8], cache: CacheLevel, unlink_when_done: bool)
        -> FileId;

    /// Submits a task for execution and returns its identifier.
    fn submit(&mut self, task: &Task) -> TaskId;

    /// Blocks for up to `timeout` until some task finishes. Returns `None`
    /// if nothing completed within the timeout.
    fn wait(&mut self, timeout: Duration) -> Option<TaskReport>;

    /// Asks the Manager to hand recovery tasks back through [`Manager::wait`]
    /// rather than swallowing them internally.
    fn enable_return_recovery_tasks(&mut self);

    /// Removes every cached replica of `file` from all workers. Returns the
    /// number of replicas removed; removing an absent replica is not an
    /// error.
    fn prune_file(&mut self, file: FileId) -> usize;

    /// Drops `file` from the Manager's file table entirely.
    fn forget_file(&mut self, file: FileId);

    /// Enqueues background replication of an ephemeral file so that a single
    /// worker loss does not force a recomputation.
    fn temp_replicate_file_later(&mut self, file: FileId);

    /// The state of the recovery task currently associated with `file`.
    fn recovery_state(&self, file: FileId) -> RecoveryState;

    /// Running count of recovery tasks the Manager has synthesized.
    fn submitted_recovery_tasks(&self) -> u64;

    /// Size in bytes of a file the Manager tracks.
    fn file_size(&self, file: FileId) -> u64;

    /// Evicts one randomly chosen worker. Test hook used by failure
    /// injection; returns false when no worker is connected.
    fn evict_random_worker(&mut self) -> bool;
}
