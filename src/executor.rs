//! Bounded-concurrency parallel executor
//!
//! Each Manager owns one executor. A batch of tasks fans out to freshly
//! spawned, single-use Specialists, never more than `max_concurrent` at a
//! time. Task outcomes are inferred by polling Specialist output against
//! completion and failure pattern sets; failures retry with a fixed delay.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::ExecutorConfig;
use crate::error::OrchestratorError;
use crate::job::TaskSpec;
use crate::patterns::PatternSet;
use crate::registry::{InstanceHandle, InstanceRegistry};
use crate::transport::Transport;
use crate::types::{InstanceId, InstanceRole, TaskId, WorkspaceMode};

const CAPTURE_LINES: u32 = 50;

/// A task that ran to completion
#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub task: TaskSpec,
    pub specialist: InstanceId,
    pub attempts: u32,
}

/// A task whose retries are exhausted
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task: TaskSpec,
    pub error: String,
    pub attempts: u32,
}

/// Aggregate outcome of one `execute_parallel` batch
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub completed_tasks: Vec<TaskSuccess>,
    pub failed_tasks: Vec<TaskFailure>,
}

/// Live executor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStatus {
    pub active: usize,
    pub queued: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    active: usize,
    peak_active: usize,
    queued: usize,
    completed: usize,
    failed: usize,
}

/// Per-Manager bounded dispatcher of tasks onto transient Specialists
pub struct ParallelExecutor {
    manager_id: InstanceId,
    registry: Arc<InstanceRegistry>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: ExecutorConfig,
    completion: PatternSet,
    failure: PatternSet,
    /// Specialist currently working each in-flight task
    active: Mutex<HashMap<TaskId, InstanceId>>,
    counters: Mutex<Counters>,
    stop_tx: watch::Sender<bool>,
}

impl ParallelExecutor {
    pub fn new(
        manager_id: InstanceId,
        registry: Arc<InstanceRegistry>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: ExecutorConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            manager_id,
            registry,
            breaker,
            transport,
            clock,
            config,
            completion: PatternSet::completion_defaults(),
            failure: PatternSet::failure_defaults(),
            active: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            stop_tx,
        }
    }

    /// Replace the default completion/failure pattern sets
    pub fn with_patterns(mut self, completion: PatternSet, failure: PatternSet) -> Self {
        self.completion = completion;
        self.failure = failure;
        self
    }

    /// Run a batch of tasks to completion. Returns once every task has
    /// either completed or exhausted its retries.
    pub async fn execute_parallel(
        self: &Arc<Self>,
        tasks: Vec<TaskSpec>,
    ) -> Result<ExecutionReport, OrchestratorError> {
        self.stop_tx.send_replace(false);
        let total = tasks.len();
        self.counters.lock().queued += total;

        info!(
            manager_id = %self.manager_id,
            tasks = total,
            max_concurrent = self.config.max_concurrent,
            "Parallel execution started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut running: JoinSet<Result<TaskSuccess, TaskFailure>> = JoinSet::new();

        for task in tasks {
            let executor = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            running.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(permit) => executor.run_task(task, permit).await,
                    Err(_) => Err(TaskFailure {
                        task,
                        error: "executor shut down".into(),
                        attempts: 0,
                    }),
                }
            });
        }

        let mut report = ExecutionReport {
            total,
            ..ExecutionReport::default()
        };
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(Ok(success)) => report.completed_tasks.push(success),
                Ok(Err(failure)) => report.failed_tasks.push(failure),
                Err(e) => warn!(error = %e, "Task worker aborted"),
            }
        }
        report.completed = report.completed_tasks.len();
        report.failed = report.failed_tasks.len();

        info!(
            manager_id = %self.manager_id,
            completed = report.completed,
            failed = report.failed,
            "Parallel execution finished"
        );
        Ok(report)
    }

    pub fn status(&self) -> ExecutorStatus {
        let counters = self.counters.lock();
        ExecutorStatus {
            active: counters.active,
            queued: counters.queued,
            completed: counters.completed,
            failed: counters.failed,
        }
    }

    /// Abort the batch: force-terminate every active Specialist and fail
    /// whatever has not started. In-flight monitors notice within one poll
    /// interval.
    pub async fn emergency_stop(&self) {
        warn!(manager_id = %self.manager_id, "Emergency stop");
        self.stop_tx.send_replace(true);

        let active: Vec<(TaskId, InstanceId)> = self.active.lock().drain().collect();
        for (task_id, specialist) in active {
            debug!(task_id = %task_id, specialist = %specialist, "Force-terminating specialist");
            if let Err(e) = self.registry.terminate(&specialist, false).await {
                debug!(specialist = %specialist, error = %e, "Specialist already gone");
            }
        }
    }

    async fn run_task(
        self: Arc<Self>,
        task: TaskSpec,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Result<TaskSuccess, TaskFailure> {
        {
            let mut counters = self.counters.lock();
            counters.queued = counters.queued.saturating_sub(1);
            counters.active += 1;
            counters.peak_active = counters.peak_active.max(counters.active);
        }

        let result = self.attempt_with_retries(&task).await;

        {
            let mut counters = self.counters.lock();
            counters.active -= 1;
            match &result {
                Ok(_) => counters.completed += 1,
                Err(_) => counters.failed += 1,
            }
        }

        match result {
            Ok((specialist, attempts)) => Ok(TaskSuccess {
                task,
                specialist,
                attempts,
            }),
            Err((error, attempts)) => Err(TaskFailure {
                task,
                error,
                attempts,
            }),
        }
    }

    async fn attempt_with_retries(
        &self,
        task: &TaskSpec,
    ) -> Result<(InstanceId, u32), (String, u32)> {
        let mut stop_rx = self.stop_tx.subscribe();
        let max_attempts = self.config.max_retries + 1;
        let mut last_error = "not attempted".to_string();
        let mut attempts = 0u32;

        for attempt in 1..=max_attempts {
            if *stop_rx.borrow() {
                return Err(("emergency stop".into(), attempts));
            }
            attempts = attempt;

            match self.attempt_task(task, &mut stop_rx).await {
                Ok(specialist) => return Ok((specialist, attempt)),
                Err(error) => {
                    warn!(
                        task = %task.name,
                        attempt,
                        max_attempts,
                        error,
                        "Task attempt failed"
                    );
                    last_error = error;
                    if attempt < max_attempts && !*stop_rx.borrow() {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
        Err((last_error, attempts))
    }

    /// One attempt: spawn a Specialist, drive it to a terminal state, and
    /// terminate it regardless of outcome (Specialists are single-use).
    async fn attempt_task(
        &self,
        task: &TaskSpec,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<InstanceId, String> {
        let specialist = self
            .registry
            .spawn(
                InstanceRole::Specialist,
                Some(&self.manager_id),
                WorkspaceMode::Isolated,
            )
            .await
            .map_err(|e| format!("spawn failed: {e}"))?;
        let specialist_id = specialist.id().clone();

        self.active
            .lock()
            .insert(task.id, specialist_id.clone());

        let outcome = self.drive(&specialist, task, stop_rx).await;

        self.active.lock().remove(&task.id);
        if let Err(e) = self.registry.terminate(&specialist_id, false).await {
            debug!(specialist = %specialist_id, error = %e, "Specialist cleanup");
        }

        outcome.map(|_| specialist_id)
    }

    /// Send the task to a Specialist and poll its output until a terminal
    /// signal, a timeout, instance death, or an emergency stop.
    async fn drive(
        &self,
        specialist: &InstanceHandle,
        task: &TaskSpec,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), String> {
        let session = specialist.session.clone();
        let id = specialist.id().clone();

        if let Some(branch) = &specialist.branch_ref {
            let setup = format!("git checkout -b {branch}");
            self.breaker
                .execute(&id, || async {
                    self.transport
                        .send_keys(&session, &setup, true)
                        .await
                        .map_err(Into::into)
                })
                .await
                .map_err(|e| format!("branch setup failed: {e}"))?;
        }

        let prompt = format!("{}\n\n{}", task.context, task.instruction);
        self.breaker
            .execute(&id, || async {
                self.transport
                    .send_keys(&session, &prompt, true)
                    .await
                    .map_err(Into::into)
            })
            .await
            .map_err(|e| format!("instruction send failed: {e}"))?;

        let task_pattern = match &task.completion_pattern {
            Some(source) => Some(
                PatternSet::compile(&[source])
                    .map_err(|e| format!("bad completion pattern: {e}"))?,
            ),
            None => None,
        };

        let deadline = self.clock.now() + self.config.task_timeout;
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Err("emergency stop".into());
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
            if *stop_rx.borrow() {
                return Err("emergency stop".into());
            }

            if !self.transport.session_exists(&session).await {
                return Err("specialist session disappeared".into());
            }

            let pane = self
                .breaker
                .execute(&id, || async {
                    self.transport
                        .capture(&session, CAPTURE_LINES)
                        .await
                        .map_err(Into::into)
                })
                .await
                .map_err(|e| format!("output read failed: {e}"))?;

            let task_done = task_pattern
                .as_ref()
                .map(|p| p.is_match(&pane))
                .unwrap_or(false);
            if task_done || self.completion.is_match(&pane) {
                debug!(task = %task.name, specialist = %id, "Completion pattern matched");
                return Ok(());
            }
            if self.failure.is_match(&pane) {
                return Err("failure pattern in output".into());
            }
            if self.clock.now() >= deadline {
                return Err(format!(
                    "timed out after {}ms",
                    self.config.task_timeout.as_millis()
                ));
            }
        }
    }
}
