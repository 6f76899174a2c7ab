use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of an automation task.
///
/// ```text
/// WAITING → SCHEDULED → RUNNING → SUCCESS
///                               → FAILED
///         → BLOCKED (unroutable — operator action required)
/// ```
///
/// SCHEDULED marks "handed to a scheduling job, dispatch attempt in flight";
/// RUNNING marks "accepted by the executor, awaiting outcome". RETRY is a
/// transient marker used by manual/automatic retry paths. SUCCESS and FAILED
/// are terminal unless explicitly reopened by a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Waiting,
    Scheduled,
    Running,
    Success,
    Failed,
    Blocked,
    Retry,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Scheduled => "SCHEDULED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::Retry => "RETRY",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(Self::Waiting),
            "SCHEDULED" => Some(Self::Scheduled),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "BLOCKED" => Some(Self::Blocked),
            "RETRY" => Some(Self::Retry),
            _ => None,
        }
    }

    /// Whether the task has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

/// How a task is executed. Immutable once set: it fully determines the
/// dispatch path and which status-transition rules apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum RunMode {
    /// Push: serialized onto a message-queue topic serviced by agents.
    Worker { topic: String },
    /// Pull: submitted as a one-shot job to the remote execution platform.
    Execute { service: String, handler: String },
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One execution variable. Secret values are stored encrypted and decrypted
/// only at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskVariable {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub secret: bool,
}

/// The unit of work driving one workflow automation step.
///
/// All time fields are epoch milliseconds. `utime` advances on every status
/// mutation and serves as the staleness clock for the recovery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: i64,

    // --- identity ---
    pub process_instance_id: i64,
    pub node_id: String,

    // --- routing ---
    pub run_mode: RunMode,
    /// Remote platform's job id, populated only after a successful
    /// EXECUTE-mode dispatch; required for remote-sync lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,

    // --- scheduling ---
    /// Deferred fire time. `None` means immediate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<i64>,

    // --- execution state ---
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    /// Bumped atomically by the re-dispatch guard; cleared only when the
    /// task is explicitly reopened for retry.
    #[serde(default)]
    pub retry_count: i64,
    /// Idempotency flag consumed by the auto-pass job.
    #[serde(default)]
    pub mark_passed: bool,
    /// Last mutation time.
    pub utime: i64,

    // --- payload ---
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    /// Opaque execution arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub variables: Vec<TaskVariable>,
}

impl Task {
    /// Whether this is a timed (deferred) task.
    pub fn is_timing(&self) -> bool {
        self.scheduled_time.is_some()
    }
}

// ---------------------------------------------------------------------------
// TaskEvent — the wire payload for WORKER-mode dispatch
// ---------------------------------------------------------------------------

/// Payload produced onto a topic for agents to execute. Variables are
/// already decrypted here; secrets never reach the wire encrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: i64,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}
