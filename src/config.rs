//! Component configuration
//!
//! Thresholds, intervals and limits are empirically chosen defaults carried
//! over from operating the system, not invariants. Every component takes its
//! config at construction.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_window` before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes required to close again
    pub success_threshold: u32,
    /// Retry delay after a half-open probe fails
    pub open_timeout: Duration,
    /// Retry delay after the circuit first opens
    pub reset_timeout: Duration,
    /// Sliding window over which failures are counted
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(120),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

/// Parallel executor tuning (per Manager)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Hard bound on concurrently active Specialists
    pub max_concurrent: usize,
    /// Output polling cadence while monitoring a Specialist
    pub poll_interval: Duration,
    /// Per-task deadline; exceeding it counts as failure
    pub task_timeout: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            poll_interval: Duration::from_secs(2),
            task_timeout: Duration::from_secs(300),
            max_retries: 2,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Job queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts before a job becomes permanently failed
    pub max_attempts: u32,
    /// Base for exponential retry backoff, in milliseconds
    pub backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds
    pub backoff_cap_ms: u64,
    /// Lease duration for the per-job mutation lock
    pub lock_ttl_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
            lock_ttl_ms: 5000,
        }
    }
}

/// Auto scaler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerConfig {
    /// Evaluation cadence
    pub interval: Duration,
    /// Utilization at or above which the pool grows
    pub scale_up_threshold: f64,
    /// Utilization at or below which the pool shrinks
    pub scale_down_threshold: f64,
    /// Average worker response time above which the pool grows
    pub latency_threshold_ms: u64,
    pub min_managers: usize,
    pub max_managers: usize,
    /// Specialists spawned under each new Manager
    pub specialists_per_manager: usize,
    /// Minimum gap between two successful scaling actions
    pub cooldown: Duration,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            latency_threshold_ms: 5000,
            min_managers: 1,
            max_managers: 10,
            specialists_per_manager: 4,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Health monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Check cadence
    pub interval: Duration,
    /// Deadline for a single liveness read
    pub read_timeout: Duration,
    /// Consecutive failed checks before recovery is attempted
    pub unhealthy_threshold: u32,
    /// Pause before the recovery liveness probe
    pub recovery_delay: Duration,
    /// Bounded per-instance check history
    pub history_len: usize,
    /// Minimum score considered healthy
    pub healthy_score: i32,
    /// Latency penalty thresholds, in milliseconds
    pub latency_warn_ms: u64,
    pub latency_critical_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            recovery_delay: Duration::from_secs(2),
            history_len: 10,
            healthy_score: 70,
            latency_warn_ms: 3000,
            latency_critical_ms: 5000,
        }
    }
}

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Root under which per-instance working directories are created
    pub base_dir: PathBuf,
    /// Command line sent into a fresh session to start the worker process
    pub worker_command: String,
    /// Lines of terminal buffer captured per read
    pub capture_lines: u32,
    pub breaker: CircuitBreakerConfig,
    pub executor: ExecutorConfig,
    pub queue: QueueConfig,
    pub scaler: ScalerConfig,
    pub health: HealthConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/tmp/conclave"),
            worker_command: "claude".to_string(),
            capture_lines: 50,
            breaker: CircuitBreakerConfig::default(),
            executor: ExecutorConfig::default(),
            queue: QueueConfig::default(),
            scaler: ScalerConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_operating_values() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.success_threshold, 2);
        assert_eq!(config.executor.max_concurrent, 3);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.scaler.scale_up_threshold, 0.8);
        assert_eq!(config.health.unhealthy_threshold, 3);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = OrchestratorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: OrchestratorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.scaler.max_managers, config.scaler.max_managers);
        assert_eq!(back.executor.task_timeout, config.executor.task_timeout);
    }
}
