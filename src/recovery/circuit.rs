//! Shared three-state circuit breaker.
//!
//! State and open time share one atomic word and every transition is a
//! compare-and-swap on it, so concurrent sessions cannot race past the open
//! threshold, open the circuit twice, or observe OPEN without its open time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::RecoveryError;
use crate::modules::clock::SharedClock;
use crate::modules::events::{EventBus, HarvestEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(with = "crate::config::duration_ms")]
    pub cooldown: Duration,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
    pub rejected: u64,
}

const NEVER: i64 = i64::MIN;
const STATE_BITS: u32 = 2;
const STATE_MASK: u64 = 0b11;

/// Circuit state and the time it last opened, packed into one word so the
/// two always change together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gate(u64);

impl Gate {
    fn new(state: CircuitState, opened_at_ms: Option<i64>) -> Self {
        // Zero in the upper bits means never opened.
        let opened = opened_at_ms.map_or(0, |millis| millis.max(0) as u64 + 1);
        Gate((opened << STATE_BITS) | u64::from(state.as_u8()))
    }

    fn state(self) -> CircuitState {
        CircuitState::from_u8((self.0 & STATE_MASK) as u8)
    }

    fn opened_at_ms(self) -> Option<i64> {
        match self.0 >> STATE_BITS {
            0 => None,
            stored => Some((stored - 1) as i64),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: SharedClock,
    events: Option<EventBus>,
    gate: AtomicU64,
    consecutive_failures: AtomicU32,
    last_failure_ms: AtomicI64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    times_opened: AtomicU64,
    rejected: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            events: None,
            gate: AtomicU64::new(Gate::new(CircuitState::Closed, None).0),
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicI64::new(NEVER),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    fn load_gate(&self) -> Gate {
        Gate(self.gate.load(Ordering::Acquire))
    }

    pub fn state(&self) -> CircuitState {
        self.load_gate().state()
    }

    /// Swap `current` for `next`; fails if any other transition got there first.
    fn swap_gate(&self, current: Gate, next: Gate) -> bool {
        let swapped = self
            .gate
            .compare_exchange(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            let (from, to) = (current.state(), next.state());
            match to {
                CircuitState::Open => log::warn!("circuit {from} -> {to}"),
                _ => log::info!("circuit {from} -> {to}"),
            }
            if let Some(events) = &self.events {
                events.publish(HarvestEvent::CircuitTransition { from, to });
            }
        }
        swapped
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let current = self.load_gate();
        if current.state() != from {
            return false;
        }
        let opened_at = match to {
            CircuitState::Open => Some(self.clock.now().timestamp_millis()),
            _ => current.opened_at_ms(),
        };
        self.swap_gate(current, Gate::new(to, opened_at))
    }

    fn open_from(&self, from: CircuitState) {
        if self.transition(from, CircuitState::Open) {
            self.times_opened.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remaining_cooldown(&self, gate: Gate) -> Duration {
        let Some(opened) = gate.opened_at_ms() else {
            return Duration::ZERO;
        };
        let elapsed = (self.clock.now().timestamp_millis() - opened).max(0) as u64;
        self.config
            .cooldown
            .saturating_sub(Duration::from_millis(elapsed))
    }

    /// Gate for new work. Moves OPEN to HALF_OPEN once the cooldown elapsed.
    pub fn try_acquire(&self) -> Result<(), RecoveryError> {
        let gate = self.load_gate();
        match gate.state() {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let retry_after = self.remaining_cooldown(gate);
                if !retry_after.is_zero() {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(RecoveryError::CircuitOpen { retry_after });
                }
                if self.swap_gate(gate, Gate::new(CircuitState::HalfOpen, gate.opened_at_ms())) {
                    return Ok(());
                }
                // Losing the race means another caller already moved it on.
                let current = self.load_gate();
                match current.state() {
                    CircuitState::Open => Err(RecoveryError::CircuitOpen {
                        retry_after: self.remaining_cooldown(current),
                    }),
                    _ => Ok(()),
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.consecutive_failures.store(0, Ordering::Release);
                }
            }
            CircuitState::Open => {
                log::debug!("success recorded while circuit open, ignoring");
            }
        }
    }

    pub fn record_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms
            .store(self.clock.now().timestamp_millis(), Ordering::Release);
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.open_from(CircuitState::Closed);
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
                self.open_from(CircuitState::HalfOpen);
            }
            CircuitState::Open => {
                self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub fn reset(&self) {
        let closed = Gate::new(CircuitState::Closed, None);
        loop {
            let current = self.load_gate();
            let swapped = if current.state() == CircuitState::Closed {
                self.gate
                    .compare_exchange(current.0, closed.0, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            } else {
                self.swap_gate(current, closed)
            };
            if swapped {
                break;
            }
        }
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let last_failure = match self.last_failure_ms.load(Ordering::Acquire) {
            NEVER => None,
            millis => DateTime::<Utc>::from_timestamp_millis(millis),
        };
        CircuitSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            last_failure,
            opened_at: self.load_gate().opened_at_ms().and_then(DateTime::<Utc>::from_timestamp_millis),
            cooldown: self.config.cooldown,
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::clock::{Clock, ManualClock};
    use std::sync::Arc;

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(30),
            },
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let clock = ManualClock::default();
        let circuit = breaker(&clock);
        circuit.record_failure();
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);

        match circuit.try_acquire() {
            Err(RecoveryError::CircuitOpen { retry_after }) => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_the_failure_run() {
        let clock = ManualClock::default();
        let circuit = breaker(&clock);
        circuit.record_failure();
        circuit.record_failure();
        circuit.record_success();
        circuit.record_failure();
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_closes_on_success_and_reopens_on_failure() {
        let clock = ManualClock::default();
        let circuit = breaker(&clock);
        for _ in 0..3 {
            circuit.record_failure();
        }
        clock.advance(Duration::from_secs(29));
        assert!(circuit.try_acquire().is_err());
        assert_eq!(circuit.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(circuit.try_acquire().is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        circuit.record_failure();
        assert_eq!(circuit.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(30));
        circuit.try_acquire().unwrap();
        circuit.record_success();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.snapshot().times_opened, 2);
    }

    #[test]
    fn concurrent_failures_open_once() {
        let clock = ManualClock::default();
        let circuit = Arc::new(breaker(&clock));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let circuit = Arc::clone(&circuit);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        circuit.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.snapshot().times_opened, 1);
        assert_eq!(circuit.snapshot().total_failures, 80);
    }

    #[test]
    fn gate_keeps_state_and_open_time_together() {
        let gate = Gate::new(CircuitState::Open, Some(1_700_000_000_123));
        assert_eq!(gate.state(), CircuitState::Open);
        assert_eq!(gate.opened_at_ms(), Some(1_700_000_000_123));

        let epoch = Gate::new(CircuitState::HalfOpen, Some(0));
        assert_eq!(epoch.state(), CircuitState::HalfOpen);
        assert_eq!(epoch.opened_at_ms(), Some(0));
        assert_eq!(Gate::new(CircuitState::Closed, None).opened_at_ms(), None);
    }

    #[test]
    fn open_circuit_admits_no_trial_before_its_cooldown() {
        let clock = ManualClock::default();
        for _ in 0..50 {
            let circuit = Arc::new(breaker(&clock));
            let handles: Vec<_> = (0..8)
                .map(|worker| {
                    let circuit = Arc::clone(&circuit);
                    std::thread::spawn(move || {
                        for _ in 0..20 {
                            if worker % 2 == 0 {
                                circuit.record_failure();
                            } else {
                                let _ = circuit.try_acquire();
                            }
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let snapshot = circuit.snapshot();
            assert_eq!(snapshot.state, CircuitState::Open);
            assert_eq!(snapshot.times_opened, 1);
            assert_eq!(
                snapshot.opened_at.map(|at| at.timestamp_millis()),
                Some(clock.now().timestamp_millis())
            );
            match circuit.try_acquire() {
                Err(RecoveryError::CircuitOpen { retry_after }) => {
                    assert_eq!(retry_after, Duration::from_secs(30))
                }
                other => panic!("expected open circuit, got {other:?}"),
            }
        }
    }
}
