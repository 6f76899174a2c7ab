use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use opsflow_core::ServiceError;

/// Status of one execution attempt on the remote platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Failed,
    FailedRetryable,
    FailedReschedulable,
    Running,
    Unknown,
}

/// One execution attempt of a submitted job. The attempt with the highest
/// `attempt` id is the latest.
#[derive(Debug, Clone)]
pub struct Execution {
    pub attempt: i64,
    pub status: ExecStatus,
}

/// Parameters for a one-shot job submission.
#[derive(Debug, Clone)]
pub struct RemoteTaskSpec {
    pub task_id: i64,
    pub service: String,
    pub handler: String,
    /// One-shot point-in-time fire expression (epoch ms).
    pub fire_time: i64,
    pub language: String,
    pub code: String,
    pub args: serde_json::Value,
    /// Already decrypted.
    pub variables: HashMap<String, String>,
}

/// The remote execution platform (RPC), consumed as an external
/// collaborator.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Submit a one-shot job; returns the platform-assigned id.
    async fn create_task(&self, spec: &RemoteTaskSpec) -> Result<String, ServiceError>;

    /// All execution attempts of a previously submitted job.
    async fn list_executions(&self, external_id: &str) -> Result<Vec<Execution>, ServiceError>;
}

/// In-memory executor (tests and local development).
#[derive(Default)]
pub struct MemExecutor {
    jobs: Mutex<HashMap<String, Job>>,
    next_id: AtomicU64,
    reject: AtomicBool,
}

struct Job {
    spec: RemoteTaskSpec,
    executions: Vec<Execution>,
}

impl MemExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent `create_task` calls fail (test hook).
    pub fn reject_submissions(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    /// Record an execution attempt for a submitted job (test hook).
    pub fn push_execution(&self, external_id: &str, attempt: i64, status: ExecStatus) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(external_id) {
            job.executions.push(Execution { attempt, status });
        }
    }

    /// The submitted spec for an external id (test hook).
    pub fn submitted(&self, external_id: &str) -> Option<RemoteTaskSpec> {
        self.jobs
            .lock()
            .unwrap()
            .get(external_id)
            .map(|j| j.spec.clone())
    }
}

#[async_trait]
impl RemoteExecutor for MemExecutor {
    async fn create_task(&self, spec: &RemoteTaskSpec) -> Result<String, ServiceError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable("executor unavailable".into()));
        }
        let id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.jobs.lock().unwrap().insert(
            id.clone(),
            Job {
                spec: spec.clone(),
                executions: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn list_executions(&self, external_id: &str) -> Result<Vec<Execution>, ServiceError> {
        self.jobs
            .lock()
            .unwrap()
            .get(external_id)
            .map(|j| j.executions.clone())
            .ok_or_else(|| ServiceError::NotFound(format!("job {external_id}")))
    }
}
