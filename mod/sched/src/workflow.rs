use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opsflow_core::ServiceError;

/// One automation step inside the external workflow engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub name: String,
}

/// The external workflow engine, consumed through two calls. Both are
/// idempotent / safe to call once per success.
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// The automation step for (process instance, node). `None` means the
    /// step no longer exists — a benign skip, not an error.
    async fn get_step(
        &self,
        process_instance_id: i64,
        node_id: &str,
    ) -> Result<Option<Step>, ServiceError>;

    /// Advance the workflow past this step.
    async fn pass_step(&self, step: &Step, comment: &str) -> Result<(), ServiceError>;
}

/// The crypto service, consumed only as a decrypt capability for secret
/// task variables at dispatch time.
#[async_trait]
pub trait Crypto: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, ServiceError>;
}

/// Pass-through crypto (tests and local development with unencrypted
/// variables).
pub struct PlainCrypto;

#[async_trait]
impl Crypto for PlainCrypto {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, ServiceError> {
        Ok(ciphertext.to_string())
    }
}

/// In-memory workflow engine (tests and local development).
#[derive(Default)]
pub struct MemWorkflow {
    steps: Mutex<HashMap<(i64, String), Step>>,
    passed: Mutex<Vec<String>>,
}

impl MemWorkflow {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_step(&self, process_instance_id: i64, node_id: &str, step: Step) {
        self.steps
            .lock()
            .unwrap()
            .insert((process_instance_id, node_id.to_string()), step);
    }

    /// Ids of steps passed so far, in order (test hook).
    pub fn passed_steps(&self) -> Vec<String> {
        self.passed.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowEngine for MemWorkflow {
    async fn get_step(
        &self,
        process_instance_id: i64,
        node_id: &str,
    ) -> Result<Option<Step>, ServiceError> {
        Ok(self
            .steps
            .lock()
            .unwrap()
            .get(&(process_instance_id, node_id.to_string()))
            .cloned())
    }

    async fn pass_step(&self, step: &Step, _comment: &str) -> Result<(), ServiceError> {
        self.passed.lock().unwrap().push(step.id.clone());
        Ok(())
    }
}
