//! Orchestrator error types

use thiserror::Error;

use crate::types::{InstanceId, InstanceRole, InstanceStatus, JobId};

/// Errors that can occur in the orchestration control plane
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Instance not found in the registry
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// Spawn request violates the hierarchy shape
    #[error("spawn denied: {0}")]
    SpawnDenied(String),

    /// Caller role is not allowed to spawn the requested child role
    #[error("role {role} may not spawn {child}")]
    RoleViolation {
        role: InstanceRole,
        child: InstanceRole,
    },

    /// Workspace mode invalid for the requested role
    #[error("invalid workspace mode for {role}: {reason}")]
    InvalidWorkspaceMode { role: InstanceRole, reason: String },

    /// Status transition not permitted
    #[error("invalid transition for {id}: {from:?} -> {to:?}")]
    InvalidTransition {
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
    },

    /// Circuit breaker rejected the call without contacting the instance.
    /// Retryable once `retry_at_ms` (epoch milliseconds) has elapsed.
    #[error("circuit open for {instance}, retry at {retry_at_ms}")]
    CircuitOpen {
        instance: InstanceId,
        retry_at_ms: u64,
    },

    /// Operation exceeded its deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Job not found in the queue
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Non-cascading terminate on an instance that still has children
    #[error("instance {0} has live children; terminate with cascade")]
    HasChildren(InstanceId),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// State store error
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Source control error
    #[error("scm error: {0}")]
    Scm(#[from] crate::scm::ScmError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}
