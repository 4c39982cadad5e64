use crate::config::CircuitBreakerConfig;
use crate::store::SharedStore;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Result of checking the circuit breaker before a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerCheck {
    /// Breaker is closed — proceed normally.
    Allowed,
    /// Breaker is half-open and a probe slot was granted — proceed, but
    /// release the slot (`release_probe`) if the request never completes.
    Probe,
    /// Breaker is open, or half-open with no probe slots free — reject fast.
    Rejected { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Snapshot of a service's breaker state, as exposed by the admin surface
/// and persisted to the shared store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
}

/// Per-service circuit breaker state. Admission decisions are made from the
/// local atomics so they never block on the shared store; every transition
/// is also written through to the store (best-effort, failures are ignored)
/// so other gateway instances converge within the documented staleness
/// bound and so state survives a restart.
struct ServiceBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    half_open_in_flight: AtomicU32,
    opened_at: std::sync::Mutex<Option<Instant>>,
    config: CircuitBreakerConfig,
    /// Last snapshot this breaker successfully wrote to the shared store,
    /// serialized — the `expected` half of the next `compare_and_set_json`.
    /// `None` means "never written", matching the store's CAS-on-absent
    /// convention.
    last_persisted: std::sync::Mutex<Option<String>>,
}

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<ServiceBreaker>>,
    store: Arc<SharedStore>,
}

impl CircuitBreakerRegistry {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self {
            breakers: DashMap::new(),
            store,
        }
    }

    /// Pre-registers a breaker for `service`, Closed, so it exists from
    /// startup regardless of whether a request has ever hit it. Call
    /// `converge_with_store` afterwards to read back any snapshot a prior
    /// instance (or a prior run of this same process) left behind.
    pub fn register_service(&self, service: &str, config: CircuitBreakerConfig) {
        self.breakers.entry(service.to_string()).or_insert_with(|| {
            Arc::new(ServiceBreaker {
                state: AtomicU8::new(STATE_CLOSED),
                consecutive_failures: AtomicU32::new(0),
                consecutive_successes: AtomicU32::new(0),
                half_open_in_flight: AtomicU32::new(0),
                opened_at: std::sync::Mutex::new(None),
                config,
                last_persisted: std::sync::Mutex::new(None),
            })
        });
    }

    /// Reads back any snapshot already stored for `service` and applies it
    /// to the freshly-registered in-process breaker, so a restarted instance
    /// (or one joining a cluster mid-flight) converges on the shared state
    /// instead of always starting Closed. No-op if nothing is stored yet.
    pub async fn converge_with_store(&self, service: &str) {
        let key = format!("circuit:{service}");
        let Ok(Some(json)) = self.store.get_json(&key).await else {
            return;
        };
        let Ok(snapshot) = serde_json::from_str::<CircuitSnapshot>(&json) else {
            return;
        };
        let Some(breaker) = self.breakers.get(service) else {
            return;
        };
        breaker.apply_snapshot(&snapshot);
        *breaker.last_persisted.lock().unwrap() = Some(json);
    }

    pub fn check(&self, service: &str) -> BreakerCheck {
        let Some(breaker) = self.breakers.get(service) else {
            return BreakerCheck::Allowed;
        };
        let result = breaker.check();
        if !matches!(result, BreakerCheck::Allowed) {
            self.persist(service, &breaker);
        }
        result
    }

    pub fn record_success(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_success();
            self.persist(service, &breaker);
        }
    }

    pub fn record_failure(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.record_failure();
            self.persist(service, &breaker);
        }
    }

    /// Releases a half-open probe slot without counting it as success or
    /// failure — used when a request is cancelled (client disconnect) mid-probe.
    pub fn release_probe(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker
                .half_open_in_flight
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_sub(1))
                })
                .ok();
        }
    }

    pub fn reset(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.state.store(STATE_CLOSED, Ordering::Release);
            breaker.consecutive_failures.store(0, Ordering::Relaxed);
            breaker.consecutive_successes.store(0, Ordering::Relaxed);
            breaker.half_open_in_flight.store(0, Ordering::Relaxed);
            *breaker.opened_at.lock().unwrap() = None;
            self.persist(service, &breaker);
        }
    }

    pub fn snapshot(&self, service: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(service).map(|b| b.snapshot(service))
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        self.breakers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect()
    }

    /// Best-effort write-through; the admission path never waits on this.
    /// CAS'd against the last value this breaker itself wrote, so instances
    /// actually converge instead of every write after the first silently
    /// losing the race against a stale `expected`.
    fn persist(&self, service: &str, breaker: &Arc<ServiceBreaker>) {
        let snapshot = breaker.snapshot(service);
        let store = self.store.clone();
        let key = format!("circuit:{service}");
        let breaker = breaker.clone();
        tokio::spawn(async move {
            let Ok(json) = serde_json::to_string(&snapshot) else {
                return;
            };
            let expected = breaker.last_persisted.lock().unwrap().clone();
            match store
                .compare_and_set_json(&key, expected.as_deref(), &json)
                .await
            {
                Ok(true) => *breaker.last_persisted.lock().unwrap() = Some(json),
                _ => {
                    // Lost the CAS race or the store call failed — drop this
                    // write. The next transition re-persists with a fresh
                    // snapshot anyway.
                }
            }
        });
    }
}

impl ServiceBreaker {
    fn snapshot(&self, service: &str) -> CircuitSnapshot {
        let state = match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        };
        CircuitSnapshot {
            service: service.to_string(),
            state,
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            consecutive_successes: self.consecutive_successes.load(Ordering::Relaxed),
            half_open_in_flight: self.half_open_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Applies a snapshot read back from the shared store to this
    /// freshly-registered breaker. `opened_at` has no on-the-wire
    /// representation (it is a local `Instant`, not a wall-clock time), so
    /// an `Open` snapshot restarts its recovery window from now rather than
    /// resuming a timer that crossed a restart — the breaker stays Open for
    /// up to one more full `open_duration_secs`, which is conservative
    /// (favors rejecting over prematurely probing) rather than unsafe.
    fn apply_snapshot(&self, snapshot: &CircuitSnapshot) {
        let state = match snapshot.state {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_OPEN,
        };
        self.state.store(state, Ordering::Release);
        self.consecutive_failures
            .store(snapshot.consecutive_failures, Ordering::Relaxed);
        self.consecutive_successes
            .store(snapshot.consecutive_successes, Ordering::Relaxed);
        self.half_open_in_flight.store(0, Ordering::Relaxed);
        if state == STATE_OPEN {
            *self.opened_at.lock().unwrap() = Some(Instant::now());
        }
    }

    fn remaining_recovery_secs(&self) -> u64 {
        let opened_at = self.opened_at.lock().unwrap();
        match *opened_at {
            Some(at) => {
                let recovery = Duration::from_secs(self.config.open_duration_secs);
                recovery.saturating_sub(at.elapsed()).as_secs()
            }
            None => 0,
        }
    }

    fn check(&self) -> BreakerCheck {
        let state = self.state.load(Ordering::Acquire);
        match state {
            STATE_CLOSED => BreakerCheck::Allowed,
            STATE_OPEN => {
                let elapsed_enough = {
                    let opened_at = self.opened_at.lock().unwrap();
                    opened_at
                        .map(|at| at.elapsed() >= Duration::from_secs(self.config.open_duration_secs))
                        .unwrap_or(true)
                };
                if elapsed_enough
                    && self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.consecutive_successes.store(0, Ordering::Relaxed);
                    self.half_open_in_flight.store(1, Ordering::Relaxed);
                    return BreakerCheck::Probe;
                }
                BreakerCheck::Rejected {
                    retry_after_secs: self.remaining_recovery_secs(),
                }
            }
            STATE_HALF_OPEN => {
                let granted = self
                    .half_open_in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                        if v < self.config.half_open_probe_budget {
                            Some(v + 1)
                        } else {
                            None
                        }
                    })
                    .is_ok();
                if granted {
                    BreakerCheck::Probe
                } else {
                    BreakerCheck::Rejected {
                        retry_after_secs: 1,
                    }
                }
            }
            _ => BreakerCheck::Allowed,
        }
    }

    fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            STATE_HALF_OPEN => {
                self.half_open_in_flight
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                        Some(v.saturating_sub(1))
                    })
                    .ok();
                let count = self.consecutive_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.success_threshold {
                    self.state.store(STATE_CLOSED, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.consecutive_successes.store(0, Ordering::Relaxed);
                    self.half_open_in_flight.store(0, Ordering::Relaxed);
                    tracing::info!("circuit breaker closed after {count} half-open successes");
                }
            }
            _ => {}
        }
    }

    fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let count = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if count >= self.config.failure_threshold {
                    self.state.store(STATE_OPEN, Ordering::Release);
                    *self.opened_at.lock().unwrap() = Some(Instant::now());
                    tracing::warn!("circuit breaker opened after {count} consecutive failures");
                }
            }
            STATE_HALF_OPEN => {
                self.state.store(STATE_OPEN, Ordering::Release);
                *self.opened_at.lock().unwrap() = Some(Instant::now());
                self.consecutive_successes.store(0, Ordering::Relaxed);
                self.half_open_in_flight.store(0, Ordering::Relaxed);
                tracing::warn!("circuit breaker re-opened: probe failed in half-open");
            }
            _ => {}
        }
    }
}

#[allow(dead_code)]
fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, success_threshold: u32, open_duration_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            open_duration_secs,
            half_open_probe_budget: 1,
        }
    }

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(Arc::new(SharedStore::memory()))
    }

    #[test]
    fn starts_closed() {
        let reg = registry();
        reg.register_service("svc", config(3, 2, 30));
        assert_eq!(reg.check("svc"), BreakerCheck::Allowed);
    }

    #[test]
    fn trips_after_consecutive_failures() {
        let reg = registry();
        reg.register_service("svc", config(3, 2, 30));
        for _ in 0..3 {
            reg.record_failure("svc");
        }
        assert!(matches!(reg.check("svc"), BreakerCheck::Rejected { .. }));
    }

    #[test]
    fn success_resets_failure_count() {
        let reg = registry();
        reg.register_service("svc", config(3, 2, 30));
        reg.record_failure("svc");
        reg.record_failure("svc");
        reg.record_success("svc");
        reg.record_failure("svc");
        reg.record_failure("svc");
        assert_eq!(reg.check("svc"), BreakerCheck::Allowed);
    }

    #[test]
    fn half_open_after_recovery_timeout() {
        let reg = registry();
        reg.register_service("svc", config(1, 1, 0));
        reg.record_failure("svc");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.check("svc"), BreakerCheck::Probe);
    }

    #[test]
    fn half_open_probe_budget_is_enforced() {
        let reg = registry();
        reg.register_service("svc", config(1, 2, 0));
        reg.record_failure("svc");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(reg.check("svc"), BreakerCheck::Probe);
        // Budget of 1 is already consumed by the transition above.
        assert!(matches!(reg.check("svc"), BreakerCheck::Rejected { .. }));
    }

    #[test]
    fn half_open_success_closes_after_threshold() {
        let reg = registry();
        reg.register_service("svc", config(1, 2, 0));
        reg.record_failure("svc");
        std::thread::sleep(Duration::from_millis(5));
        let _ = reg.check("svc");
        reg.record_success("svc");
        // One success is not enough — success_threshold is 2, so the breaker
        // grants another probe slot rather than allowing unconditionally.
        assert_eq!(reg.check("svc"), BreakerCheck::Probe);
        reg.record_success("svc");
        assert_eq!(reg.check("svc"), BreakerCheck::Allowed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = registry();
        reg.register_service("svc", config(1, 2, 0));
        reg.record_failure("svc");
        std::thread::sleep(Duration::from_millis(5));
        let _ = reg.check("svc");
        reg.record_failure("svc"); // probe failed -> back to Open
        std::thread::sleep(Duration::from_millis(5));
        // open_duration_secs=0 means the next check immediately re-admits a probe.
        assert_eq!(reg.check("svc"), BreakerCheck::Probe);
    }

    #[test]
    fn reset_forces_closed_regardless_of_prior_state() {
        let reg = registry();
        reg.register_service("svc", config(1, 1, 3600));
        reg.record_failure("svc");
        assert!(matches!(reg.check("svc"), BreakerCheck::Rejected { .. }));
        reg.reset("svc");
        assert_eq!(reg.check("svc"), BreakerCheck::Allowed);
        let snap = reg.snapshot("svc").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
    }
}
