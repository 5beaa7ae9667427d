//! Per-instance circuit breaker
//!
//! Every read or send that reaches a worker instance goes through here.
//! Each instance gets its own three-state circuit: Closed passes calls
//! through, Open rejects them outright, HalfOpen lets probes through until
//! the instance proves itself again. Transitions out of Open happen lazily
//! on access; there is no background timer.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::error::OrchestratorError;
use crate::types::InstanceId;

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Circuit {
    state: CircuitState,
    /// Failure instants inside the monitoring window
    failures: VecDeque<Instant>,
    /// Successes since entering HalfOpen
    successes: u32,
    next_retry_at: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            next_retry_at: None,
        }
    }
}

/// Observable circuit state for diagnostics
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub recent_failures: usize,
    /// Milliseconds until the next half-open probe is allowed, when Open
    pub retry_in_ms: Option<u64>,
}

/// Failure isolation for calls to worker instances
pub struct CircuitBreaker {
    circuits: Mutex<HashMap<InstanceId, Circuit>>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    /// Whether a call to `id` would currently be allowed. An Open circuit
    /// whose retry time has arrived transitions to HalfOpen here and the
    /// call is allowed through.
    pub fn is_available(&self, id: &InstanceId) -> bool {
        self.check(id).is_ok()
    }

    /// Gate a call: `Ok` to proceed, `CircuitOpen` carrying the retry time
    /// otherwise
    pub fn check(&self, id: &InstanceId) -> Result<(), OrchestratorError> {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(id.clone()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let retry_at = circuit.next_retry_at.unwrap_or(now);
                if now >= retry_at {
                    debug!(instance_id = %id, "Circuit half-open");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.successes = 0;
                    Ok(())
                } else {
                    let remaining = retry_at - now;
                    Err(OrchestratorError::CircuitOpen {
                        instance: id.clone(),
                        retry_at_ms: self.clock.epoch_ms() + remaining.as_millis() as u64,
                    })
                }
            }
        }
    }

    pub fn record_success(&self, id: &InstanceId) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(id.clone()).or_insert_with(Circuit::new);

        if circuit.state == CircuitState::HalfOpen {
            circuit.successes += 1;
            if circuit.successes >= self.config.success_threshold {
                debug!(instance_id = %id, "Circuit closed");
                circuit.state = CircuitState::Closed;
                circuit.failures.clear();
                circuit.successes = 0;
                circuit.next_retry_at = None;
            }
        }
    }

    pub fn record_failure(&self, id: &InstanceId) {
        let now = self.clock.now();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(id.clone()).or_insert_with(Circuit::new);

        match circuit.state {
            CircuitState::HalfOpen => {
                // One failed probe reopens immediately; the window restarts
                warn!(instance_id = %id, "Circuit reopened from half-open");
                circuit.state = CircuitState::Open;
                circuit.failures.clear();
                circuit.successes = 0;
                circuit.next_retry_at = Some(now + self.config.open_timeout);
            }
            CircuitState::Closed => {
                circuit.failures.push_back(now);
                circuit
                    .failures
                    .retain(|at| now.duration_since(*at) <= self.config.monitoring_window);
                if circuit.failures.len() >= self.config.failure_threshold as usize {
                    warn!(
                        instance_id = %id,
                        failures = circuit.failures.len(),
                        "Circuit opened"
                    );
                    circuit.state = CircuitState::Open;
                    circuit.next_retry_at = Some(now + self.config.reset_timeout);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` against the instance, routing the outcome into the circuit
    pub async fn execute<T, F, Fut>(
        &self,
        id: &InstanceId,
        f: F,
    ) -> Result<T, OrchestratorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, OrchestratorError>>,
    {
        self.check(id)?;
        match f().await {
            Ok(value) => {
                self.record_success(id);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(id);
                Err(e)
            }
        }
    }

    pub fn state(&self, id: &InstanceId) -> CircuitState {
        self.circuits
            .lock()
            .get(id)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Clear the circuit for `id` back to Closed
    pub fn reset(&self, id: &InstanceId) {
        self.circuits.lock().remove(id);
    }

    pub fn snapshot(&self, id: &InstanceId) -> CircuitSnapshot {
        let now = self.clock.now();
        let circuits = self.circuits.lock();
        match circuits.get(id) {
            Some(circuit) => CircuitSnapshot {
                state: circuit.state,
                recent_failures: circuit.failures.len(),
                retry_in_ms: circuit.next_retry_at.and_then(|at| {
                    (circuit.state == CircuitState::Open && at > now)
                        .then(|| (at - now).as_millis() as u64)
                }),
            },
            None => CircuitSnapshot {
                state: CircuitState::Closed,
                recent_failures: 0,
                retry_in_ms: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::types::InstanceRole;
    use std::time::Duration;

    fn test_breaker() -> (CircuitBreaker, FakeClock, InstanceId) {
        let clock = FakeClock::new();
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::default(),
            Arc::new(clock.clone()),
        );
        let id = InstanceId::generate(InstanceRole::Specialist);
        (breaker, clock, id)
    }

    fn trip(breaker: &CircuitBreaker, id: &InstanceId) {
        for _ in 0..5 {
            breaker.record_failure(id);
        }
    }

    // === Closed -> Open ===

    #[test]
    fn test_five_failures_open_the_circuit() {
        let (breaker, _clock, id) = test_breaker();

        for _ in 0..4 {
            breaker.record_failure(&id);
            assert_eq!(breaker.state(&id), CircuitState::Closed);
        }
        breaker.record_failure(&id);
        assert_eq!(breaker.state(&id), CircuitState::Open);
        assert!(!breaker.is_available(&id));
    }

    #[test]
    fn test_open_rejection_carries_retry_time() {
        let (breaker, clock, id) = test_breaker();
        trip(&breaker, &id);

        let err = breaker.check(&id).unwrap_err();
        match err {
            OrchestratorError::CircuitOpen { retry_at_ms, .. } => {
                assert_eq!(retry_at_ms, clock.epoch_ms() + 120_000);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }

    #[test]
    fn test_failures_outside_window_are_pruned() {
        let (breaker, clock, id) = test_breaker();

        for _ in 0..4 {
            breaker.record_failure(&id);
        }
        // The early failures age out of the 60s window
        clock.advance(Duration::from_secs(61));
        breaker.record_failure(&id);

        assert_eq!(breaker.state(&id), CircuitState::Closed);
        assert_eq!(breaker.snapshot(&id).recent_failures, 1);
    }

    // === Open -> HalfOpen ===

    #[test]
    fn test_open_transitions_half_open_after_timeout() {
        let (breaker, clock, id) = test_breaker();
        trip(&breaker, &id);
        assert!(!breaker.is_available(&id));

        clock.advance(Duration::from_secs(120));
        assert!(breaker.is_available(&id));
        assert_eq!(breaker.state(&id), CircuitState::HalfOpen);
    }

    // === HalfOpen transitions ===

    #[test]
    fn test_two_successes_close_from_half_open() {
        let (breaker, clock, id) = test_breaker();
        trip(&breaker, &id);
        clock.advance(Duration::from_secs(120));
        assert!(breaker.is_available(&id));

        breaker.record_success(&id);
        assert_eq!(breaker.state(&id), CircuitState::HalfOpen);
        breaker.record_success(&id);
        assert_eq!(breaker.state(&id), CircuitState::Closed);
        assert_eq!(breaker.snapshot(&id).recent_failures, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (breaker, clock, id) = test_breaker();
        trip(&breaker, &id);
        clock.advance(Duration::from_secs(120));
        assert!(breaker.is_available(&id));

        breaker.record_failure(&id);
        assert_eq!(breaker.state(&id), CircuitState::Open);
        assert!(!breaker.is_available(&id));
    }

    // === execute ===

    #[tokio::test]
    async fn test_execute_records_outcomes() {
        let (breaker, _clock, id) = test_breaker();

        let ok: Result<u32, OrchestratorError> =
            breaker.execute(&id, || async { Ok(42) }).await;
        assert_eq!(ok.unwrap(), 42);

        for _ in 0..5 {
            let _ = breaker
                .execute::<(), _, _>(&id, || async {
                    Err(OrchestratorError::Timeout(5000))
                })
                .await;
        }
        assert_eq!(breaker.state(&id), CircuitState::Open);

        // Short-circuited without running the closure
        let err = breaker
            .execute::<(), _, _>(&id, || async {
                panic!("must not be called while open")
            })
            .await;
        assert!(matches!(err, Err(OrchestratorError::CircuitOpen { .. })));
    }

    #[test]
    fn test_reset_clears_circuit() {
        let (breaker, _clock, id) = test_breaker();
        trip(&breaker, &id);
        assert_eq!(breaker.state(&id), CircuitState::Open);

        breaker.reset(&id);
        assert_eq!(breaker.state(&id), CircuitState::Closed);
        assert!(breaker.is_available(&id));
    }
}
