//! Durable priority job queue
//!
//! Pending jobs are held in priority order (descending, FIFO within a
//! level). Every mutation persists the job to the state store so the
//! backlog can be rebuilt after a crash; jobs found Active at restore time
//! are demoted to Pending, since in-flight work is not trusted to have
//! survived.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::OrchestratorError;
use crate::job::{Job, JobStatus, TaskSpec};
use crate::store::StateStore;
use crate::types::{InstanceId, JobId, Priority};

const JOB_SET: &str = "jobs";

/// Aggregate queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}

struct QueueState {
    /// Sorted by priority descending; FIFO within a level
    pending: Vec<Job>,
    /// Jobs handed to a Manager (Assigned or Active)
    active: HashMap<JobId, Job>,
    /// Terminal jobs, Completed and permanently Failed
    finished: Vec<Job>,
}

/// Priority-ordered backlog of jobs awaiting a Manager
pub struct JobQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                active: HashMap::new(),
                finished: Vec::new(),
            }),
            store,
            clock,
            config,
        }
    }

    /// Add a job to the backlog
    pub async fn enqueue(&self, tasks: Vec<TaskSpec>, priority: Priority) -> Job {
        let job = Job::new(tasks, priority, self.config.max_attempts);
        {
            let mut state = self.state.lock();
            Self::insert_pending(&mut state.pending, job.clone());
        }
        self.persist(&job).await;
        info!(job_id = %job.id, priority = ?priority, "Job enqueued");
        job
    }

    /// Hand out the highest-priority ready job, marking it Assigned
    pub async fn dequeue(&self) -> Option<Job> {
        let now = self.clock.epoch_ms();
        let job = {
            let mut state = self.state.lock();
            let idx = state.pending.iter().position(|j| j.is_ready(now))?;
            let mut job = state.pending.remove(idx);
            job.status = JobStatus::Assigned;
            state.active.insert(job.id, job.clone());
            job
        };
        self.persist(&job).await;
        debug!(job_id = %job.id, "Job dequeued");
        Some(job)
    }

    /// Record that a Manager has started executing the job. Attempts count
    /// only transitions into Active.
    pub async fn mark_active(
        &self,
        job_id: &JobId,
        manager_id: &InstanceId,
    ) -> Result<(), OrchestratorError> {
        let job = {
            let mut state = self.state.lock();
            let job = state
                .active
                .get_mut(job_id)
                .ok_or(OrchestratorError::JobNotFound(*job_id))?;
            job.status = JobStatus::Active;
            job.manager_id = Some(manager_id.clone());
            job.attempts += 1;
            job.clone()
        };
        self.persist(&job).await;
        info!(job_id = %job_id, manager_id = %manager_id, attempt = job.attempts, "Job active");
        Ok(())
    }

    pub async fn mark_completed(
        &self,
        job_id: &JobId,
        results: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let job = {
            let mut state = self.state.lock();
            let mut job = state
                .active
                .remove(job_id)
                .ok_or(OrchestratorError::JobNotFound(*job_id))?;
            job.status = JobStatus::Completed;
            job.results = Some(results);
            state.finished.push(job.clone());
            job
        };
        self.persist(&job).await;
        info!(job_id = %job_id, attempts = job.attempts, "Job completed");
        Ok(())
    }

    /// Record a failed execution. The job returns to Pending with
    /// exponential backoff while attempts remain, and becomes permanently
    /// Failed otherwise.
    pub async fn mark_failed(
        &self,
        job_id: &JobId,
        error: &str,
    ) -> Result<(), OrchestratorError> {
        let job = {
            let mut state = self.state.lock();
            let mut job = state
                .active
                .remove(job_id)
                .ok_or(OrchestratorError::JobNotFound(*job_id))?;

            if job.attempts < job.max_attempts {
                let backoff = self.backoff_ms(job.attempts);
                job.status = JobStatus::Pending;
                job.manager_id = None;
                job.next_retry_at = Some(self.clock.epoch_ms() + backoff);
                job.error = Some(error.to_string());
                warn!(
                    job_id = %job_id,
                    attempt = job.attempts,
                    retry_in_ms = backoff,
                    error,
                    "Job failed, will retry"
                );
                Self::insert_pending(&mut state.pending, job.clone());
            } else {
                job.status = JobStatus::Failed;
                job.error = Some(error.to_string());
                warn!(job_id = %job_id, attempts = job.attempts, error, "Job permanently failed");
                state.finished.push(job.clone());
            }
            job
        };
        self.persist(&job).await;
        Ok(())
    }

    /// Pending jobs whose retry time has elapsed, best first
    pub fn ready_jobs(&self, limit: usize) -> Vec<Job> {
        let now = self.clock.epoch_ms();
        self.state
            .lock()
            .pending
            .iter()
            .filter(|j| j.is_ready(now))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get(&self, job_id: &JobId) -> Option<Job> {
        let state = self.state.lock();
        state
            .pending
            .iter()
            .find(|j| j.id == *job_id)
            .or_else(|| state.active.get(job_id))
            .or_else(|| state.finished.iter().find(|j| j.id == *job_id))
            .cloned()
    }

    pub fn statistics(&self) -> QueueStatistics {
        let state = self.state.lock();
        QueueStatistics {
            pending: state.pending.len(),
            active: state.active.len(),
            completed: state
                .finished
                .iter()
                .filter(|j| j.status == JobStatus::Completed)
                .count(),
            failed: state
                .finished
                .iter()
                .filter(|j| j.status == JobStatus::Failed)
                .count(),
        }
    }

    /// Jobs counted against capacity: everything not yet terminal
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.active.len()
    }

    /// Rebuild the in-memory queue from the state store. Jobs found
    /// Assigned or Active are demoted to Pending.
    pub async fn restore(&self) -> Result<usize, OrchestratorError> {
        let ids = self.store.set_members(JOB_SET).await?;
        let mut restored = 0usize;
        let mut demoted = 0usize;

        for raw_id in ids {
            let Ok(Some(json)) = self.store.get(&format!("job:{raw_id}")).await else {
                self.store.set_remove(JOB_SET, &raw_id).await.ok();
                continue;
            };
            let Ok(mut job) = serde_json::from_str::<Job>(&json) else {
                warn!(job_id = %raw_id, "Unreadable job record, skipping");
                continue;
            };

            match job.status {
                JobStatus::Assigned | JobStatus::Active => {
                    job.status = JobStatus::Pending;
                    job.manager_id = None;
                    demoted += 1;
                    self.persist(&job).await;
                    self.state.lock().pending.push(job);
                }
                JobStatus::Pending => {
                    self.state.lock().pending.push(job);
                }
                JobStatus::Completed | JobStatus::Failed => {
                    self.state.lock().finished.push(job);
                }
            }
            restored += 1;
        }

        // Re-establish priority order; FIFO within a level by enqueue time
        {
            let mut state = self.state.lock();
            state
                .pending
                .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        }

        info!(restored, demoted, "Job queue restored");
        Ok(restored)
    }

    fn backoff_ms(&self, attempts: u32) -> u64 {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempts.min(16));
        exp.min(self.config.backoff_cap_ms)
    }

    fn insert_pending(pending: &mut Vec<Job>, job: Job) {
        // First position with strictly lower priority keeps FIFO within a level
        let at = pending
            .iter()
            .position(|j| j.priority < job.priority)
            .unwrap_or(pending.len());
        pending.insert(at, job);
    }

    /// Persist under a short lease so concurrent orchestrator processes
    /// never interleave writes to the same job
    async fn persist(&self, job: &Job) {
        let resource = format!("job:{}", job.id);
        let token = match self.store.acquire_lock(&resource, self.config.lock_ttl_ms).await {
            Ok(Some(token)) => Some(token),
            Ok(None) => {
                warn!(job_id = %job.id, "Job lock contended, writing anyway");
                None
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job lock unavailable");
                None
            }
        };

        match serde_json::to_string(job) {
            Ok(json) => {
                if let Err(e) = self.store.set(&resource, &json, None).await {
                    warn!(job_id = %job.id, error = %e, "Job write failed");
                }
                if let Err(e) = self.store.set_add(JOB_SET, &job.id.to_string()).await {
                    warn!(job_id = %job.id, error = %e, "Job index failed");
                }
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "Job encode failed"),
        }

        if let Some(token) = token {
            self.store.release_lock(&resource, &token).await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn test_queue() -> (JobQueue, FakeClock, Arc<MemoryStore>) {
        let clock = FakeClock::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let queue = JobQueue::new(
            store.clone(),
            Arc::new(clock.clone()),
            QueueConfig::default(),
        );
        (queue, clock, store)
    }

    fn task() -> TaskSpec {
        TaskSpec::new("t", "ctx", "do it")
    }

    // === Ordering ===

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let (queue, _clock, _store) = test_queue();

        let low = queue.enqueue(vec![task()], Priority::Low).await;
        let critical = queue.enqueue(vec![task()], Priority::Critical).await;
        let medium_a = queue.enqueue(vec![task()], Priority::Medium).await;
        let medium_b = queue.enqueue(vec![task()], Priority::Medium).await;

        let order: Vec<JobId> = [
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
            queue.dequeue().await.unwrap(),
        ]
        .iter()
        .map(|j| j.id)
        .collect();

        assert_eq!(order, vec![critical.id, medium_a.id, medium_b.id, low.id]);
        assert!(queue.dequeue().await.is_none());
    }

    // === Retry & backoff ===

    #[tokio::test]
    async fn test_three_failures_become_permanent() {
        let (queue, clock, _store) = test_queue();
        let mgr = InstanceId::from("mgr_test".to_string());

        let job = queue.enqueue(vec![task()], Priority::Medium).await;

        for _ in 0..3 {
            // Job may be backing off between attempts
            clock.advance(Duration::from_secs(60));
            let handed = queue.dequeue().await.expect("job should be ready");
            assert_eq!(handed.id, job.id);
            queue.mark_active(&job.id, &mgr).await.unwrap();
            queue.mark_failed(&job.id, "worker crashed").await.unwrap();
        }

        let stored = queue.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.error.as_deref(), Some("worker crashed"));
        clock.advance(Duration::from_secs(120));
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_twice_then_succeed() {
        let (queue, clock, _store) = test_queue();
        let mgr = InstanceId::from("mgr_test".to_string());

        let job = queue.enqueue(vec![task()], Priority::High).await;

        for _ in 0..2 {
            clock.advance(Duration::from_secs(60));
            queue.dequeue().await.unwrap();
            queue.mark_active(&job.id, &mgr).await.unwrap();
            queue.mark_failed(&job.id, "flaky").await.unwrap();
        }

        clock.advance(Duration::from_secs(60));
        queue.dequeue().await.unwrap();
        queue.mark_active(&job.id, &mgr).await.unwrap();
        queue
            .mark_completed(&job.id, serde_json::json!({"ok": true}))
            .await
            .unwrap();

        let stored = queue.get(&job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let (queue, _clock, _store) = test_queue();
        assert_eq!(queue.backoff_ms(0), 1000);
        assert_eq!(queue.backoff_ms(1), 2000);
        assert_eq!(queue.backoff_ms(2), 4000);
        assert_eq!(queue.backoff_ms(6), 60_000);
        assert_eq!(queue.backoff_ms(20), 60_000);
    }

    #[tokio::test]
    async fn test_failed_job_waits_for_backoff() {
        let (queue, clock, _store) = test_queue();
        let mgr = InstanceId::from("mgr_test".to_string());

        let job = queue.enqueue(vec![task()], Priority::Medium).await;
        queue.dequeue().await.unwrap();
        queue.mark_active(&job.id, &mgr).await.unwrap();
        queue.mark_failed(&job.id, "nope").await.unwrap();

        // attempts=1 -> 2s backoff
        assert!(queue.dequeue().await.is_none());
        assert_eq!(queue.ready_jobs(10).len(), 0);

        clock.advance(Duration::from_millis(2001));
        assert_eq!(queue.ready_jobs(10).len(), 1);
        assert!(queue.dequeue().await.is_some());
    }

    // === Persistence & restore ===

    #[tokio::test]
    async fn test_restore_demotes_active_jobs() {
        let clock = FakeClock::new();
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let mgr = InstanceId::from("mgr_test".to_string());

        {
            let queue = JobQueue::new(
                store.clone(),
                Arc::new(clock.clone()),
                QueueConfig::default(),
            );
            let job = queue.enqueue(vec![task()], Priority::High).await;
            queue.enqueue(vec![task()], Priority::Low).await;
            queue.dequeue().await.unwrap();
            queue.mark_active(&job.id, &mgr).await.unwrap();
        }

        // Fresh process over the same store
        let queue = JobQueue::new(
            store.clone(),
            Arc::new(clock.clone()),
            QueueConfig::default(),
        );
        let restored = queue.restore().await.unwrap();
        assert_eq!(restored, 2);

        let stats = queue.statistics();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.active, 0);

        // Demoted job kept its priority position
        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.priority, Priority::High);
        assert!(first.manager_id.is_none());
    }

    #[tokio::test]
    async fn test_statistics() {
        let (queue, _clock, _store) = test_queue();
        let mgr = InstanceId::from("mgr_test".to_string());

        queue.enqueue(vec![task()], Priority::Low).await;
        let done = queue.enqueue(vec![task()], Priority::High).await;
        queue.dequeue().await.unwrap();
        queue.mark_active(&done.id, &mgr).await.unwrap();
        queue
            .mark_completed(&done.id, serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(
            queue.statistics(),
            QueueStatistics {
                pending: 1,
                active: 0,
                completed: 1,
                failed: 0,
            }
        );
        assert_eq!(queue.depth(), 1);
    }
}
