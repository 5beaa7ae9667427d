//! Autoscaling control loop
//!
//! Reads aggregate load from the registry, the job queue and the health
//! monitor, and grows or shrinks the Manager population. Decisions are
//! evaluated every tick; actions are gated by a cooldown measured from the
//! last action that actually succeeded.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ScalerConfig;
use crate::error::OrchestratorError;
use crate::health::HealthMonitor;
use crate::queue::JobQueue;
use crate::registry::InstanceRegistry;
use crate::types::{InstanceRole, WorkspaceMode};

/// Load snapshot taken at each tick
#[derive(Debug, Clone)]
pub struct ScalingMetrics {
    pub managers: usize,
    pub specialists: usize,
    pub executive_present: bool,
    /// Pending plus active jobs
    pub queue_depth: usize,
    /// `(active + min(pending, capacity)) / capacity`; 1.0 when there is
    /// no capacity at all
    pub utilization: f64,
    pub avg_response_ms: u64,
}

/// What a tick decided to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingDecision {
    Hold,
    ScaleUp(&'static str),
    ScaleDown,
}

/// Grows and shrinks the Manager/Specialist population from observed load
pub struct AutoScaler {
    registry: Arc<InstanceRegistry>,
    queue: Arc<JobQueue>,
    health: Arc<HealthMonitor>,
    clock: Arc<dyn Clock>,
    config: ScalerConfig,
    last_action_at: Mutex<Option<Instant>>,
    stop_tx: watch::Sender<bool>,
}

impl AutoScaler {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        queue: Arc<JobQueue>,
        health: Arc<HealthMonitor>,
        clock: Arc<dyn Clock>,
        config: ScalerConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            registry,
            queue,
            health,
            clock,
            config,
            last_action_at: Mutex::new(None),
            stop_tx,
        }
    }

    /// Start the periodic scaling loop
    pub fn start_monitoring(self: &Arc<Self>) {
        let scaler = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        self.stop_tx.send_replace(false);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scaler.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scaler.check_and_scale().await,
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            debug!("Auto scaler stopped");
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

    /// Current load as the scaler sees it
    pub fn collect_metrics(&self) -> ScalingMetrics {
        let managers = self.registry.active_count(InstanceRole::Manager);
        let specialists = self.registry.active_count(InstanceRole::Specialist);
        let stats = self.queue.statistics();
        let queue_depth = stats.pending + stats.active;

        let utilization = if specialists == 0 {
            1.0
        } else {
            (stats.active + stats.pending.min(specialists)) as f64 / specialists as f64
        };

        ScalingMetrics {
            managers,
            specialists,
            executive_present: self.registry.executive().is_some(),
            queue_depth,
            utilization,
            avg_response_ms: self.health.average_latency_ms(),
        }
    }

    /// Decision policy, first match wins
    pub fn decide(&self, m: &ScalingMetrics) -> ScalingDecision {
        let c = &self.config;
        if !m.executive_present {
            return ScalingDecision::Hold;
        }
        if m.utilization >= c.scale_up_threshold && m.managers < c.max_managers {
            return ScalingDecision::ScaleUp("high utilization");
        }
        if m.queue_depth > 2 * m.specialists && m.managers < c.max_managers {
            return ScalingDecision::ScaleUp("deep queue");
        }
        if m.avg_response_ms > c.latency_threshold_ms && m.managers < c.max_managers {
            return ScalingDecision::ScaleUp("slow responses");
        }
        if m.utilization <= c.scale_down_threshold && m.managers > c.min_managers {
            return ScalingDecision::ScaleDown;
        }
        ScalingDecision::Hold
    }

    /// One tick: evaluate, honor the cooldown, act. Action errors are
    /// logged and do not advance the cooldown clock, so the next tick can
    /// retry.
    pub async fn check_and_scale(&self) {
        let metrics = self.collect_metrics();
        let decision = self.decide(&metrics);
        if decision == ScalingDecision::Hold {
            return;
        }

        let now = self.clock.now();
        if let Some(last) = *self.last_action_at.lock() {
            let since = now.duration_since(last);
            if since < self.config.cooldown {
                info!(
                    decision = ?decision,
                    since_last_ms = since.as_millis() as u64,
                    "Scaling suppressed by cooldown"
                );
                return;
            }
        }

        let result = match decision {
            ScalingDecision::ScaleUp(reason) => self.scale_up(reason, &metrics).await,
            ScalingDecision::ScaleDown => self.scale_down(&metrics).await,
            ScalingDecision::Hold => unreachable!(),
        };

        match result {
            Ok(()) => *self.last_action_at.lock() = Some(now),
            Err(e) => warn!(error = %e, "Scaling action failed"),
        }
    }

    /// Add one Manager under the Executive with a fresh complement of
    /// Specialists
    async fn scale_up(
        &self,
        reason: &str,
        metrics: &ScalingMetrics,
    ) -> Result<(), OrchestratorError> {
        let exec = self.registry.executive().ok_or_else(|| {
            OrchestratorError::Config("no active executive to scale under".into())
        })?;

        info!(
            reason,
            managers = metrics.managers,
            utilization = metrics.utilization,
            "Scaling up"
        );

        let manager = self
            .registry
            .spawn(
                InstanceRole::Manager,
                Some(exec.id()),
                WorkspaceMode::Isolated,
            )
            .await?;

        for _ in 0..self.config.specialists_per_manager {
            if let Err(e) = self
                .registry
                .spawn(
                    InstanceRole::Specialist,
                    Some(manager.id()),
                    WorkspaceMode::Isolated,
                )
                .await
            {
                // A short-handed Manager still counts as a successful action
                warn!(manager_id = %manager.id(), error = %e, "Specialist spawn failed");
            }
        }

        info!(manager_id = %manager.id(), "Scale-up complete");
        Ok(())
    }

    /// Retire the Manager with the fewest currently-active Specialists.
    ///
    /// Known gap carried from the original system: "fewest active
    /// Specialists" can pick a Manager whose next task is assigned but not
    /// yet visible, terminating in-flight work.
    async fn scale_down(&self, metrics: &ScalingMetrics) -> Result<(), OrchestratorError> {
        let managers = self.registry.list(Some(InstanceRole::Manager), None);
        let victim = managers
            .iter()
            .filter(|m| self.registry.is_active(m.id()))
            .min_by_key(|m| self.registry.active_children(m.id()).len())
            .ok_or_else(|| OrchestratorError::Config("no manager to retire".into()))?;

        info!(
            manager_id = %victim.id(),
            utilization = metrics.utilization,
            "Scaling down"
        );
        self.registry.terminate(victim.id(), true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::clock::FakeClock;
    use crate::config::{CircuitBreakerConfig, HealthConfig, OrchestratorConfig, QueueConfig};
    use crate::job::TaskSpec;
    use crate::scm::fake::FakeScm;
    use crate::store::MemoryStore;
    use crate::transport::fake::FakeTransport;
    use crate::types::Priority;
    use std::time::Duration;

    struct Fixture {
        scaler: AutoScaler,
        registry: Arc<InstanceRegistry>,
        queue: Arc<JobQueue>,
        clock: FakeClock,
        transport: Arc<FakeTransport>,
    }

    async fn fixture() -> Fixture {
        let clock = FakeClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let transport = Arc::new(FakeTransport::new());
        let store = Arc::new(MemoryStore::new(shared.clone()));
        let registry = Arc::new(InstanceRegistry::new(
            transport.clone(),
            Arc::new(FakeScm::new()),
            store.clone(),
            OrchestratorConfig {
                base_dir: std::env::temp_dir().join("conclave-scaler-test"),
                ..OrchestratorConfig::default()
            },
        ));
        let queue = Arc::new(JobQueue::new(
            store,
            shared.clone(),
            QueueConfig::default(),
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            shared.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            breaker,
            transport.clone(),
            shared.clone(),
            HealthConfig::default(),
        ));
        let scaler = AutoScaler::new(
            registry.clone(),
            queue.clone(),
            health,
            shared,
            ScalerConfig::default(),
        );
        Fixture {
            scaler,
            registry,
            queue,
            clock,
            transport,
        }
    }

    fn metrics(managers: usize, specialists: usize) -> ScalingMetrics {
        ScalingMetrics {
            managers,
            specialists,
            executive_present: true,
            queue_depth: 0,
            utilization: 0.5,
            avg_response_ms: 0,
        }
    }

    // === Decision policy ===

    #[tokio::test]
    async fn test_no_executive_means_hold() {
        let fx = fixture().await;
        let m = ScalingMetrics {
            executive_present: false,
            utilization: 1.0,
            ..metrics(1, 0)
        };
        assert_eq!(fx.scaler.decide(&m), ScalingDecision::Hold);
    }

    #[tokio::test]
    async fn test_high_utilization_scales_up() {
        let fx = fixture().await;
        let m = ScalingMetrics {
            utilization: 0.9,
            ..metrics(2, 8)
        };
        assert_eq!(
            fx.scaler.decide(&m),
            ScalingDecision::ScaleUp("high utilization")
        );
    }

    #[tokio::test]
    async fn test_max_managers_blocks_scale_up() {
        let fx = fixture().await;
        let m = ScalingMetrics {
            utilization: 0.9,
            ..metrics(10, 40)
        };
        assert_eq!(fx.scaler.decide(&m), ScalingDecision::Hold);
    }

    #[tokio::test]
    async fn test_deep_queue_scales_up() {
        let fx = fixture().await;
        let m = ScalingMetrics {
            queue_depth: 9,
            ..metrics(2, 4)
        };
        assert_eq!(fx.scaler.decide(&m), ScalingDecision::ScaleUp("deep queue"));
    }

    #[tokio::test]
    async fn test_slow_responses_scale_up() {
        let fx = fixture().await;
        let m = ScalingMetrics {
            avg_response_ms: 6000,
            ..metrics(2, 4)
        };
        assert_eq!(
            fx.scaler.decide(&m),
            ScalingDecision::ScaleUp("slow responses")
        );
    }

    #[tokio::test]
    async fn test_low_utilization_scales_down() {
        let fx = fixture().await;
        let m = ScalingMetrics {
            utilization: 0.1,
            ..metrics(3, 12)
        };
        assert_eq!(fx.scaler.decide(&m), ScalingDecision::ScaleDown);

        // But never below the floor
        let m = ScalingMetrics {
            utilization: 0.1,
            ..metrics(1, 4)
        };
        assert_eq!(fx.scaler.decide(&m), ScalingDecision::Hold);
    }

    // === Metrics ===

    #[tokio::test]
    async fn test_utilization_with_zero_capacity() {
        let fx = fixture().await;
        let exec = fx
            .registry
            .spawn(InstanceRole::Executive, None, WorkspaceMode::Isolated)
            .await
            .unwrap();
        fx.registry
            .spawn(InstanceRole::Manager, Some(exec.id()), WorkspaceMode::Isolated)
            .await
            .unwrap();

        let m = fx.scaler.collect_metrics();
        assert_eq!(m.managers, 1);
        assert_eq!(m.specialists, 0);
        assert_eq!(m.utilization, 1.0);
    }

    // === Actions & cooldown ===

    #[tokio::test]
    async fn test_scale_up_then_cooldown_suppresses() {
        let fx = fixture().await;
        let exec = fx
            .registry
            .spawn(InstanceRole::Executive, None, WorkspaceMode::Isolated)
            .await
            .unwrap();
        for _ in 0..2 {
            fx.registry
                .spawn(InstanceRole::Manager, Some(exec.id()), WorkspaceMode::Isolated)
                .await
                .unwrap();
        }
        // Keep utilization pinned high across both ticks
        for _ in 0..10 {
            fx.queue
                .enqueue(vec![TaskSpec::new("t", "c", "i")], Priority::Medium)
                .await;
        }

        assert_eq!(fx.scaler.collect_metrics().utilization, 1.0);
        fx.scaler.check_and_scale().await;
        assert_eq!(fx.registry.active_count(InstanceRole::Manager), 3);
        assert_eq!(fx.registry.active_count(InstanceRole::Specialist), 4);

        // Second qualifying tick inside the cooldown: no action
        fx.clock.advance(Duration::from_secs(10));
        assert!(fx.scaler.collect_metrics().utilization >= 0.8);
        fx.scaler.check_and_scale().await;
        assert_eq!(fx.registry.active_count(InstanceRole::Manager), 3);
    }

    #[tokio::test]
    async fn test_scale_down_picks_idle_manager() {
        let fx = fixture().await;
        let exec = fx
            .registry
            .spawn(InstanceRole::Executive, None, WorkspaceMode::Isolated)
            .await
            .unwrap();
        let busy = fx
            .registry
            .spawn(InstanceRole::Manager, Some(exec.id()), WorkspaceMode::Isolated)
            .await
            .unwrap();
        let idle = fx
            .registry
            .spawn(InstanceRole::Manager, Some(exec.id()), WorkspaceMode::Isolated)
            .await
            .unwrap();
        for _ in 0..2 {
            fx.registry
                .spawn(InstanceRole::Specialist, Some(busy.id()), WorkspaceMode::Isolated)
                .await
                .unwrap();
        }

        let m = fx.scaler.collect_metrics();
        fx.scaler.scale_down(&m).await.unwrap();

        assert!(fx.registry.get(idle.id()).is_none());
        assert!(fx.registry.get(busy.id()).is_some());
        assert_eq!(fx.registry.active_count(InstanceRole::Specialist), 2);
    }

    #[tokio::test]
    async fn test_failed_action_does_not_consume_cooldown() {
        let fx = fixture().await;
        let exec = fx
            .registry
            .spawn(InstanceRole::Executive, None, WorkspaceMode::Isolated)
            .await
            .unwrap();
        fx.registry
            .spawn(InstanceRole::Manager, Some(exec.id()), WorkspaceMode::Isolated)
            .await
            .unwrap();

        // Utilization is 1.0 (no specialists); make the manager spawn fail
        *fx.transport.fail_creates.lock() = true;
        fx.scaler.check_and_scale().await;
        assert_eq!(fx.registry.active_count(InstanceRole::Manager), 1);
        assert!(fx.scaler.last_action_at.lock().is_none());

        // Next tick may retry immediately, no cooldown was consumed
        *fx.transport.fail_creates.lock() = false;
        fx.scaler.check_and_scale().await;
        assert_eq!(fx.registry.active_count(InstanceRole::Manager), 2);
        assert!(fx.scaler.last_action_at.lock().is_some());
    }
}
