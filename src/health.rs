//! Health monitoring and recovery
//!
//! Periodically probes every active instance with a bounded-time read and
//! scores the result. Instances that fail enough consecutive checks get a
//! recovery attempt: dead workers are restarted in place, live-but-wedged
//! Specialists are terminated and their Manager is told to reassign.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::patterns::PatternSet;
use crate::registry::{InstanceHandle, InstanceRegistry};
use crate::transport::Transport;
use crate::types::{InstanceId, InstanceRole};

const CAPTURE_LINES: u32 = 30;

/// Outcome of a single probe
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub responsive: bool,
    pub stuck: bool,
    pub has_errors: bool,
    /// 0-100 composite; starts at 100 and takes penalties
    pub score: i32,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

/// Rolled-up health of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Recovering,
}

struct HealthRecord {
    history: VecDeque<HealthCheck>,
    consecutive_failures: u32,
    state: HealthState,
}

impl HealthRecord {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            consecutive_failures: 0,
            state: HealthState::Healthy,
        }
    }
}

/// Periodic liveness and quality probe over all registered instances
pub struct HealthMonitor {
    registry: Arc<InstanceRegistry>,
    breaker: Arc<CircuitBreaker>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: HealthConfig,
    stuck_patterns: PatternSet,
    error_patterns: PatternSet,
    records: Mutex<HashMap<InstanceId, HealthRecord>>,
    stop_tx: watch::Sender<bool>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        breaker: Arc<CircuitBreaker>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: HealthConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            registry,
            breaker,
            transport,
            clock,
            config,
            stuck_patterns: PatternSet::stuck_defaults(),
            error_patterns: PatternSet::error_defaults(),
            records: Mutex::new(HashMap::new()),
            stop_tx,
        }
    }

    /// Start the periodic check loop
    pub fn start_monitoring(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        self.stop_tx.send_replace(false);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.perform_health_check().await,
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("Health monitor stopped");
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn stop_monitoring(&self) {
        self.stop_tx.send_replace(true);
    }

    /// One full pass over all active instances
    pub async fn perform_health_check(self: &Arc<Self>) {
        // Records for instances that left the registry are stale; drop them
        self.records
            .lock()
            .retain(|id, _| self.registry.get(id).is_some());

        for handle in self.registry.list(None, None) {
            if !self.registry.is_active(handle.id()) {
                continue;
            }
            let check = self.check_instance(&handle).await;
            let needs_recovery = self.apply(handle.id(), check);
            if needs_recovery {
                // Recovery sleeps and talks to the transport; it must not
                // hold up the rest of the sweep
                let monitor = Arc::clone(self);
                let id = handle.id().clone();
                tokio::spawn(async move { monitor.attempt_recovery(&id).await });
            }
        }
    }

    /// Probe one instance with a bounded-time read and score the result
    pub async fn check_instance(&self, handle: &InstanceHandle) -> HealthCheck {
        let id = handle.id().clone();
        let session = handle.session.clone();
        let started = self.clock.now();

        let read = tokio::time::timeout(
            self.config.read_timeout,
            self.breaker.execute(&id, || async {
                self.transport
                    .capture(&session, CAPTURE_LINES)
                    .await
                    .map_err(Into::into)
            }),
        )
        .await;

        let latency_ms = self.clock.now().duration_since(started).as_millis() as u64;
        let pane = match read {
            Ok(Ok(pane)) => Some(pane),
            Ok(Err(_)) => None,
            Err(_) => {
                // The dropped read never reported back; count it against
                // the circuit ourselves
                self.breaker.record_failure(&id);
                None
            }
        };

        self.evaluate(pane.as_deref(), latency_ms)
    }

    /// Scoring: 100 minus penalties for unresponsiveness, stuck output,
    /// error output and elevated latency
    pub fn evaluate(&self, pane: Option<&str>, latency_ms: u64) -> HealthCheck {
        let responsive = pane.is_some();
        let stuck = pane.map(|p| self.stuck_patterns.is_match(p)).unwrap_or(false);
        let has_errors = pane.map(|p| self.error_patterns.is_match(p)).unwrap_or(false);

        let mut score = 100i32;
        if !responsive {
            score -= 50;
        }
        if stuck {
            score -= 30;
        }
        if has_errors {
            score -= 20;
        }
        if latency_ms > self.config.latency_warn_ms {
            score -= 10;
        }
        if latency_ms > self.config.latency_critical_ms {
            score -= 10;
        }

        HealthCheck {
            responsive,
            stuck,
            has_errors,
            score,
            latency_ms,
            at: Utc::now(),
        }
    }

    /// Fold a check into the instance's record. Returns true when the
    /// consecutive-failure threshold was just crossed and recovery should
    /// run.
    pub fn apply(&self, id: &InstanceId, check: HealthCheck) -> bool {
        let mut records = self.records.lock();
        let record = records
            .entry(id.clone())
            .or_insert_with(HealthRecord::new);

        let healthy = check.score >= self.config.healthy_score;
        record.history.push_back(check);
        while record.history.len() > self.config.history_len {
            record.history.pop_front();
        }

        if healthy {
            record.consecutive_failures = 0;
            record.state = HealthState::Healthy;
            return false;
        }

        record.consecutive_failures += 1;
        if record.consecutive_failures >= self.config.unhealthy_threshold
            && record.state != HealthState::Unhealthy
        {
            warn!(
                instance_id = %id,
                failures = record.consecutive_failures,
                "Instance unhealthy"
            );
            record.state = HealthState::Unhealthy;
            return true;
        }
        false
    }

    /// Try to bring an unhealthy instance back: restart it if its worker is
    /// dead, or retire a wedged Specialist and tell its Manager.
    pub async fn attempt_recovery(&self, id: &InstanceId) {
        tokio::time::sleep(self.config.recovery_delay).await;

        let Some(handle) = self.registry.get(id) else {
            self.records.lock().remove(id);
            return;
        };

        let alive = self.transport.is_active(&handle.session).await;
        if !alive {
            info!(instance_id = %id, "Worker dead, restarting");
            if let Err(e) = self.registry.mark_inactive(id).await {
                warn!(instance_id = %id, error = %e, "Could not mark inactive");
                return;
            }
            match self.registry.restart(id).await {
                Ok(()) => {
                    self.breaker.reset(id);
                    let mut records = self.records.lock();
                    if let Some(record) = records.get_mut(id) {
                        record.consecutive_failures = 0;
                        record.state = HealthState::Recovering;
                    }
                    info!(instance_id = %id, "Instance recovering");
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Restart failed"),
            }
            return;
        }

        // Alive but persistently unhealthy: a Specialist is expendable, and
        // its Manager needs to know the task must be reassigned
        if handle.role == InstanceRole::Specialist {
            if let Some(parent_id) = handle.parent_id.clone() {
                warn!(instance_id = %id, "Retiring wedged specialist");
                if let Err(e) = self.registry.terminate(id, false).await {
                    warn!(instance_id = %id, error = %e, "Retire failed");
                    return;
                }
                self.records.lock().remove(id);
                if let Some(parent) = self.registry.get(&parent_id) {
                    let notice = format!(
                        "TASK_FAILED: specialist {id} was terminated after repeated \
                         unhealthy checks; reassign its task"
                    );
                    if let Err(e) = self
                        .transport
                        .send_keys(&parent.session, &notice, true)
                        .await
                    {
                        warn!(manager_id = %parent_id, error = %e, "Manager notification failed");
                    }
                }
            }
        } else {
            debug!(instance_id = %id, "Unhealthy but alive; leaving to next cycle");
        }
    }

    pub fn state(&self, id: &InstanceId) -> Option<HealthState> {
        self.records.lock().get(id).map(|r| r.state)
    }

    pub fn consecutive_failures(&self, id: &InstanceId) -> u32 {
        self.records
            .lock()
            .get(id)
            .map(|r| r.consecutive_failures)
            .unwrap_or(0)
    }

    /// Mean latency of each instance's most recent responsive check; feeds
    /// the auto scaler's slow-response rule
    pub fn average_latency_ms(&self) -> u64 {
        let records = self.records.lock();
        let latencies: Vec<u64> = records
            .values()
            .filter_map(|r| r.history.iter().rev().find(|c| c.responsive))
            .map(|c| c.latency_ms)
            .collect();
        if latencies.is_empty() {
            0
        } else {
            latencies.iter().sum::<u64>() / latencies.len() as u64
        }
    }
}
