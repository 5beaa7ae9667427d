//! # Conclave
//!
//! Hierarchical agent orchestration control plane.
//!
//! This crate coordinates a three-level hierarchy of autonomous text-driven
//! worker agents running in terminal-multiplexer sessions, keeping many
//! concurrent, unreliable, long-lived workers converged under resource and
//! ordering constraints.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         EXECUTIVE (root)                              │
//! │                    plans work, spawns Managers                        │
//! └────────────────────────────┬─────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!   ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!   │   Manager   │     │   Manager   │     │   Manager   │
//!   │ (executor)  │     │ (executor)  │     │ (executor)  │
//!   └──────┬──────┘     └──────┬──────┘     └──────┬──────┘
//!          │                   │                   │
//!     ┌────┴────┐         ┌────┴────┐         ┌────┴────┐
//!     ▼    ▼    ▼         ▼    ▼    ▼         ▼    ▼    ▼
//!   ┌───┐┌───┐┌───┐     ┌───┐┌───┐┌───┐     ┌───┐┌───┐┌───┐
//!   │S1 ││S2 ││S3 │     │S4 ││S5 ││S6 │     │S7 ││S8 ││S9 │
//!   └───┘└───┘└───┘     └───┘└───┘└───┘     └───┘└───┘└───┘
//!                    (single-use Specialists)
//! ```
//!
//! Six components interlock around one shared instance registry:
//!
//! - **Instance Registry** - the authoritative map of workers, their
//!   hierarchy and lifecycle transitions
//! - **Circuit Breaker** - per-instance failure isolation around every
//!   read/send that reaches a worker
//! - **Parallel Executor** - per-Manager bounded-concurrency fan-out of
//!   tasks onto transient Specialists
//! - **Job Queue** - durable, priority-ordered backlog with retry backoff
//! - **Auto Scaler** - control loop growing/shrinking the Manager pool
//!   from observed load
//! - **Health Monitor** - periodic probe with restart/retire recovery
//!
//! ## Key Concepts
//!
//! - **Instance**: a supervised worker living in its own transport session
//! - **Job**: a prioritized batch of tasks executed by one Manager
//! - **Completion pattern**: a regex over worker output, the only signal
//!   of task state the control plane gets

pub mod breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod health;
pub mod job;
pub mod orchestrator;
pub mod patterns;
pub mod queue;
pub mod registry;
pub mod scaler;
pub mod scm;
pub mod store;
pub mod transport;
pub mod types;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use executor::{ExecutionReport, ExecutorStatus, ParallelExecutor};
pub use health::{HealthCheck, HealthMonitor, HealthState};
pub use job::{Job, JobStatus, TaskSpec, TaskStatus};
pub use orchestrator::Orchestrator;
pub use patterns::PatternSet;
pub use queue::{JobQueue, QueueStatistics};
pub use registry::{Instance, InstanceHandle, InstanceRegistry, InstanceSnapshot};
pub use scaler::{AutoScaler, ScalingDecision, ScalingMetrics};
pub use scm::{GitCli, MergeOutcome, SourceControl};
pub use store::{MemoryStore, RedisStore, StateStore};
pub use transport::{TmuxTransport, Transport, TransportError};
pub use types::{
    InstanceId, InstanceRole, InstanceStatus, JobId, Priority, TaskId, WorkspaceMode,
};
