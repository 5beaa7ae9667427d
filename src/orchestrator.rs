//! Main orchestrator - the control surface over the six core components
//!
//! Constructs each component exactly once and passes them by reference;
//! nothing in the crate is a process-wide singleton. Role capability checks
//! live here, at the boundary, so the components below can assume a valid
//! hierarchy.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::breaker::{CircuitBreaker, CircuitSnapshot};
use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::executor::{ExecutionReport, ExecutorStatus, ParallelExecutor};
use crate::health::HealthMonitor;
use crate::job::{Job, TaskSpec};
use crate::queue::{JobQueue, QueueStatistics};
use crate::registry::{InstanceRegistry, InstanceSnapshot};
use crate::scaler::AutoScaler;
use crate::scm::SourceControl;
use crate::store::StateStore;
use crate::transport::Transport;
use crate::types::{InstanceId, InstanceRole, Priority, WorkspaceMode};

/// The orchestration control plane
pub struct Orchestrator {
    config: OrchestratorConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    registry: Arc<InstanceRegistry>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<JobQueue>,
    health: Arc<HealthMonitor>,
    scaler: Arc<AutoScaler>,
    /// One executor per Manager, created on first use
    executors: RwLock<HashMap<InstanceId, Arc<ParallelExecutor>>>,
    /// Managers currently running a distributed job
    busy_managers: Mutex<HashSet<InstanceId>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        scm: Arc<dyn SourceControl>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(InstanceRegistry::new(
            transport.clone(),
            scm,
            store.clone(),
            config.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone(), clock.clone()));
        let queue = Arc::new(JobQueue::new(store, clock.clone(), config.queue.clone()));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            breaker.clone(),
            transport.clone(),
            clock.clone(),
            config.health.clone(),
        ));
        let scaler = Arc::new(AutoScaler::new(
            registry.clone(),
            queue.clone(),
            health.clone(),
            clock.clone(),
            config.scaler.clone(),
        ));

        Self {
            config,
            transport,
            clock,
            registry,
            breaker,
            queue,
            health,
            scaler,
            executors: RwLock::new(HashMap::new()),
            busy_managers: Mutex::new(HashSet::new()),
        }
    }

    /// Recover persisted state and start the background control loops
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        self.registry.reconcile().await?;
        self.queue.restore().await?;
        self.health.start_monitoring();
        self.scaler.start_monitoring();
        info!("Orchestrator started");
        Ok(())
    }

    /// Stop control loops and abort all in-flight parallel work
    pub async fn shutdown(&self) {
        self.scaler.stop_monitoring();
        self.health.stop_monitoring();
        let executors: Vec<Arc<ParallelExecutor>> =
            self.executors.read().values().cloned().collect();
        for executor in executors {
            executor.emergency_stop().await;
        }
        info!("Orchestrator stopped");
    }

    // --- control surface -------------------------------------------------

    /// Spawn an instance on behalf of `caller`. An absent caller is the
    /// external entry point and may only bootstrap the Executive root; for
    /// everything else the capability table decides.
    pub async fn spawn(
        &self,
        caller: Option<&InstanceId>,
        role: InstanceRole,
        workspace_mode: WorkspaceMode,
    ) -> Result<InstanceSnapshot, OrchestratorError> {
        match caller {
            None => {
                if role != InstanceRole::Executive {
                    return Err(OrchestratorError::SpawnDenied(format!(
                        "external callers may only spawn the executive, not {role}"
                    )));
                }
                let handle = self.registry.spawn(role, None, workspace_mode).await?;
                Ok(handle.snapshot())
            }
            Some(caller_id) => {
                let caller_handle = self
                    .registry
                    .get(caller_id)
                    .ok_or_else(|| OrchestratorError::InstanceNotFound(caller_id.clone()))?;
                if !caller_handle.role.can_spawn(role) {
                    return Err(OrchestratorError::RoleViolation {
                        role: caller_handle.role,
                        child: role,
                    });
                }
                let handle = self
                    .registry
                    .spawn(role, Some(caller_id), workspace_mode)
                    .await?;
                Ok(handle.snapshot())
            }
        }
    }

    /// Send text to an instance's worker, guarded by its circuit
    pub async fn send(&self, id: &InstanceId, text: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;
        self.breaker
            .execute(id, || async {
                self.transport
                    .send_keys(&handle.session, text, true)
                    .await
                    .map_err(Into::into)
            })
            .await
    }

    /// Read recent output from an instance's worker, guarded by its circuit
    pub async fn read(
        &self,
        id: &InstanceId,
        lines: Option<u32>,
    ) -> Result<String, OrchestratorError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;
        let lines = lines.unwrap_or(self.config.capture_lines);
        self.breaker
            .execute(id, || async {
                self.transport
                    .capture(&handle.session, lines)
                    .await
                    .map_err(Into::into)
            })
            .await
    }

    pub fn list(
        &self,
        role: Option<InstanceRole>,
        parent: Option<&InstanceId>,
    ) -> Vec<InstanceSnapshot> {
        self.registry
            .list(role, parent)
            .iter()
            .map(|h| h.snapshot())
            .collect()
    }

    /// Terminate an instance, stopping any executor it owns first so its
    /// monitors abort promptly
    pub async fn terminate(
        &self,
        id: &InstanceId,
        cascade: bool,
    ) -> Result<(), OrchestratorError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(id.clone()))?;

        let mut owned_managers = Vec::new();
        match handle.role {
            InstanceRole::Manager => owned_managers.push(id.clone()),
            InstanceRole::Executive if cascade => owned_managers.extend(handle.children()),
            _ => {}
        }
        for manager_id in owned_managers {
            let executor = self.executors.write().remove(&manager_id);
            if let Some(executor) = executor {
                executor.emergency_stop().await;
            }
            self.busy_managers.lock().remove(&manager_id);
        }

        self.registry.terminate(id, cascade).await
    }

    pub async fn restart(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        self.registry.restart(id).await
    }

    /// Run a batch of tasks under a Manager's executor
    pub async fn execute_parallel(
        &self,
        manager_id: &InstanceId,
        tasks: Vec<TaskSpec>,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let executor = self.executor_for(manager_id)?;
        executor.execute_parallel(tasks).await
    }

    pub fn parallel_status(&self, manager_id: &InstanceId) -> Option<ExecutorStatus> {
        self.executors.read().get(manager_id).map(|e| e.status())
    }

    /// Enqueue a job and hand ready work to idle Managers
    pub async fn distribute_work(
        self: &Arc<Self>,
        tasks: Vec<TaskSpec>,
        priority: Priority,
    ) -> Result<Job, OrchestratorError> {
        let job = self.queue.enqueue(tasks, priority).await;
        self.assign_ready_jobs().await;
        Ok(job)
    }

    /// Pair ready jobs with idle Managers; each pairing runs as its own
    /// task so a slow job never blocks assignment of the next
    //
    // Returns a boxed future rather than being a plain `async fn`: this
    // method and `run_job` are mutually recursive (it spawns `run_job`,
    // which awaits it back), and type-erasing one side to a `Send` boxed
    // future is the only way to break the auto-trait inference cycle that
    // `tokio::spawn`'s `Send` bound would otherwise leave unresolvable.
    pub fn assign_ready_jobs<'a>(
        self: &'a Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let Some(manager_id) = self.idle_manager() else {
                    return;
                };
                let Some(job) = self.queue.dequeue().await else {
                    return;
                };
                if let Err(e) = self.queue.mark_active(&job.id, &manager_id).await {
                    warn!(job_id = %job.id, error = %e, "Could not activate job");
                    return;
                }
                self.busy_managers.lock().insert(manager_id.clone());

                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    orchestrator.run_job(manager_id, job).await;
                });
            }
        })
    }

    async fn run_job(self: &Arc<Self>, manager_id: InstanceId, job: Job) {
        info!(job_id = %job.id, manager_id = %manager_id, "Job dispatched");

        let outcome = self.execute_parallel(&manager_id, job.tasks.clone()).await;
        match outcome {
            Ok(report) if report.failed == 0 => {
                let results = serde_json::json!({
                    "completed": report.completed,
                    "tasks": report
                        .completed_tasks
                        .iter()
                        .map(|t| t.task.name.clone())
                        .collect::<Vec<_>>(),
                });
                if let Err(e) = self.queue.mark_completed(&job.id, results).await {
                    warn!(job_id = %job.id, error = %e, "Could not complete job");
                }
            }
            Ok(report) => {
                let summary = format!(
                    "{} of {} tasks failed: {}",
                    report.failed,
                    report.total,
                    report
                        .failed_tasks
                        .iter()
                        .map(|f| f.error.as_str())
                        .collect::<Vec<_>>()
                        .join("; ")
                );
                if let Err(e) = self.queue.mark_failed(&job.id, &summary).await {
                    warn!(job_id = %job.id, error = %e, "Could not fail job");
                }
            }
            Err(e) => {
                if let Err(e2) = self.queue.mark_failed(&job.id, &e.to_string()).await {
                    warn!(job_id = %job.id, error = %e2, "Could not fail job");
                }
            }
        }

        self.busy_managers.lock().remove(&manager_id);
        // The freed Manager may unblock the next ready job
        self.assign_ready_jobs().await;
    }

    // --- observability ----------------------------------------------------

    pub fn queue_statistics(&self) -> QueueStatistics {
        self.queue.statistics()
    }

    pub fn circuit(&self, id: &InstanceId) -> CircuitSnapshot {
        self.breaker.snapshot(id)
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn scaler(&self) -> &Arc<AutoScaler> {
        &self.scaler
    }

    // --- internals --------------------------------------------------------

    fn executor_for(
        &self,
        manager_id: &InstanceId,
    ) -> Result<Arc<ParallelExecutor>, OrchestratorError> {
        let handle = self
            .registry
            .get(manager_id)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(manager_id.clone()))?;
        if handle.role != InstanceRole::Manager {
            return Err(OrchestratorError::SpawnDenied(format!(
                "{} is a {}, only managers execute task batches",
                manager_id, handle.role
            )));
        }

        if let Some(executor) = self.executors.read().get(manager_id) {
            return Ok(executor.clone());
        }
        let executor = Arc::new(ParallelExecutor::new(
            manager_id.clone(),
            self.registry.clone(),
            self.breaker.clone(),
            self.transport.clone(),
            self.clock.clone(),
            self.config.executor.clone(),
        ));
        self.executors
            .write()
            .entry(manager_id.clone())
            .or_insert(executor.clone());
        Ok(executor)
    }

    fn idle_manager(&self) -> Option<InstanceId> {
        let busy = self.busy_managers.lock();
        self.registry
            .list(Some(InstanceRole::Manager), None)
            .iter()
            .find(|m| {
                self.registry.is_active(m.id()) && !busy.contains(m.id())
            })
            .map(|m| m.id().clone())
    }
}
