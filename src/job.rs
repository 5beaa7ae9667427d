//! Jobs and tasks
//!
//! A Job is a batch of Tasks submitted for execution by one Manager. Jobs
//! are persisted on every mutation so the backlog survives a crash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{InstanceId, JobId, Priority, TaskId};

/// One unit of work inside a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    pub name: String,
    /// Background prompt sent to the Specialist before the instruction
    pub context: String,
    pub instruction: String,
    /// Task-specific completion regex, checked alongside the defaults
    pub completion_pattern: Option<String>,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        context: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            name: name.into(),
            context: context.into(),
            instruction: instruction.into(),
            completion_pattern: None,
        }
    }

    pub fn with_completion_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.completion_pattern = Some(pattern.into());
        self
    }
}

/// Task execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the backlog (possibly for a retry time)
    Pending,
    /// Handed to a Manager, not yet running
    Assigned,
    /// Running under a Manager; attempts was incremented on entry
    Active,
    Completed,
    Failed,
}

/// A batch of tasks submitted for execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tasks: Vec<TaskSpec>,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Epoch milliseconds before which the job is not ready, after a failure
    pub next_retry_at: Option<u64>,
    pub manager_id: Option<InstanceId>,
    pub created_at: DateTime<Utc>,
    /// Terminal error, for permanently failed jobs
    pub error: Option<String>,
    /// Aggregate results recorded on completion
    pub results: Option<serde_json::Value>,
}

impl Job {
    pub fn new(tasks: Vec<TaskSpec>, priority: Priority, max_attempts: u32) -> Self {
        Self {
            id: JobId::new(),
            tasks,
            priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry_at: None,
            manager_id: None,
            created_at: Utc::now(),
            error: None,
            results: None,
        }
    }

    /// Ready to be handed out: pending and past any retry time
    pub fn is_ready(&self, now_epoch_ms: u64) -> bool {
        self.status == JobStatus::Pending
            && self.next_retry_at.map(|at| now_epoch_ms >= at).unwrap_or(true)
    }
}
