//! Per-provider circuit breaker.
//!
//! States move only along closed -> open -> half_open -> {closed | open}.
//! The breaker never reads the clock itself; callers pass `now`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use cartograph_shared::{AgentError, BreakerConfig, CircuitState, ProviderState};

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Circuit closed; the call is a normal one.
    Normal,
    /// Circuit half-open; this call is the single probe.
    Probe,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Failure times inside the sliding window (closed state only).
    failures: VecDeque<DateTime<Utc>>,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    next_probe_at: Option<DateTime<Utc>>,
    cooldown_secs: u64,
    open_events: u64,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    provider_id: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(provider_id: impl Into<String>, config: BreakerConfig) -> Self {
        let cooldown_secs = config.cooldown_secs;
        Self {
            provider_id: provider_id.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                consecutive_failures: 0,
                opened_at: None,
                next_probe_at: None,
                cooldown_secs,
                open_events: 0,
                probe_in_flight: false,
            }),
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a job for this provider may be dispatched at `now`.
    /// Read-only: does not claim the probe slot.
    pub fn allows_dispatch(&self, now: DateTime<Utc>) -> bool {
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.next_probe_at.is_none_or(|t| now >= t),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    /// Ask for permission to call the provider.
    ///
    /// Open circuits whose cooldown has elapsed move to half-open and hand
    /// out exactly one probe permit; everything else short-circuits with
    /// `ProviderUnavailable`.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Result<Permit, AgentError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open if inner.next_probe_at.is_none_or(|t| now >= t) => {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                info!(provider = %self.provider_id, "circuit half-open, probing");
                Ok(Permit::Probe)
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                Ok(Permit::Probe)
            }
            _ => Err(AgentError::ProviderUnavailable {
                provider_id: self.provider_id.clone(),
            }),
        }
    }

    /// The provider answered. A probe closes a half-open circuit; counters
    /// reset only while the circuit is closed.
    pub fn record_success(&self, permit: Permit) {
        let mut inner = self.lock();
        if permit == Permit::Normal && inner.state != CircuitState::Closed {
            // Admitted before the circuit opened; only the probe decides.
            return;
        }
        if permit == Permit::Probe {
            info!(provider = %self.provider_id, "circuit closed");
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            inner.next_probe_at = None;
            inner.cooldown_secs = self.config.cooldown_secs;
            inner.probe_in_flight = false;
        }
        inner.failures.clear();
        inner.consecutive_failures = 0;
    }

    /// A recoverable provider failure.
    pub fn record_failure(&self, permit: Permit, now: DateTime<Utc>) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if permit == Permit::Probe {
            let doubled = inner.cooldown_secs.saturating_mul(2);
            inner.cooldown_secs = doubled.min(self.config.max_cooldown_secs);
            self.open(&mut inner, now);
            return;
        }
        if inner.state != CircuitState::Closed {
            // A call admitted before the circuit opened; already counted.
            return;
        }

        let window = Duration::seconds(self.config.failure_window_secs as i64);
        inner.failures.push_back(now);
        while inner.failures.front().is_some_and(|t| now - *t > window) {
            inner.failures.pop_front();
        }
        if inner.failures.len() as u32 >= self.config.failure_threshold {
            inner.cooldown_secs = self.config.cooldown_secs;
            self.open(&mut inner, now);
        }
    }

    /// A permit ended without a verdict on provider health (cancelled).
    pub fn release(&self, permit: Permit) {
        if permit == Permit::Probe {
            self.lock().probe_in_flight = false;
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.next_probe_at = Some(now + Duration::seconds(inner.cooldown_secs as i64));
        inner.open_events += 1;
        inner.failures.clear();
        inner.probe_in_flight = false;
        warn!(
            provider = %self.provider_id,
            consecutive_failures = inner.consecutive_failures,
            cooldown_secs = inner.cooldown_secs,
            "circuit opened"
        );
    }

    pub fn snapshot(&self) -> ProviderState {
        let inner = self.lock();
        ProviderState {
            provider_id: self.provider_id.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            next_probe_at: inner.next_probe_at,
            cooldown_secs: inner.cooldown_secs,
            open_events: inner.open_events,
        }
    }

    /// Restore persisted state. A half-open circuit comes back as open with
    /// its probe due immediately, since the old probe died with the process.
    pub fn restore(&self, state: &ProviderState) {
        let mut inner = self.lock();
        inner.state = match state.state {
            CircuitState::HalfOpen => CircuitState::Open,
            other => other,
        };
        inner.consecutive_failures = state.consecutive_failures;
        inner.opened_at = state.opened_at;
        inner.next_probe_at = match state.state {
            CircuitState::HalfOpen => state.opened_at,
            _ => state.next_probe_at,
        };
        inner.cooldown_secs = state.cooldown_secs.max(self.config.cooldown_secs);
        inner.open_events = state.open_events;
        inner.failures.clear();
        inner.probe_in_flight = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            failure_window_secs: 300,
            cooldown_secs: 60,
            max_cooldown_secs: 200,
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn trip(breaker: &CircuitBreaker, at: DateTime<Utc>) {
        for i in 0..5 {
            let permit = breaker.try_acquire(at).unwrap();
            breaker.record_failure(permit, at + Duration::seconds(i));
        }
    }

    #[test]
    fn opens_at_threshold_within_window() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        for i in 0..4 {
            breaker.record_failure(Permit::Normal, now + Duration::seconds(i));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure(Permit::Normal, now + Duration::seconds(4));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().open_events, 1);

        let err = breaker.try_acquire(now + Duration::seconds(5)).unwrap_err();
        assert_eq!(
            err,
            AgentError::ProviderUnavailable {
                provider_id: "serp".into()
            }
        );
        assert!(!breaker.allows_dispatch(now + Duration::seconds(5)));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        for i in 0..4 {
            breaker.record_failure(Permit::Normal, now + Duration::seconds(i));
        }
        // Fifth failure arrives after the first four have aged out
        breaker.record_failure(Permit::Normal, now + Duration::seconds(400));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn success_resets_count() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        for i in 0..4 {
            breaker.record_failure(Permit::Normal, now + Duration::seconds(i));
        }
        breaker.record_success(Permit::Normal);
        breaker.record_failure(Permit::Normal, now + Duration::seconds(10));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn single_probe_after_cooldown_then_close() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        trip(&breaker, now);

        let after = now + Duration::seconds(70);
        assert!(breaker.allows_dispatch(after));
        let permit = breaker.try_acquire(after).unwrap();
        assert_eq!(permit, Permit::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Only one probe at a time
        assert!(breaker.try_acquire(after).is_err());
        assert!(!breaker.allows_dispatch(after));

        breaker.record_success(permit);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.try_acquire(after).unwrap(), Permit::Normal);
    }

    #[test]
    fn late_normal_results_do_not_move_half_open() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        // Admitted while closed, answers only after the circuit has tripped
        let straggler = breaker.try_acquire(now).unwrap();
        trip(&breaker, now);

        let after = now + Duration::seconds(70);
        let probe = breaker.try_acquire(after).unwrap();
        assert_eq!(probe, Permit::Probe);

        breaker.record_success(straggler);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire(after).is_err());
        breaker.record_failure(straggler, after);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().open_events, 1);

        breaker.record_success(probe);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn failed_probe_doubles_cooldown_up_to_max() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        trip(&breaker, now);

        let mut at = now + Duration::seconds(70);
        let permit = breaker.try_acquire(at).unwrap();
        breaker.record_failure(permit, at);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().cooldown_secs, 120);
        assert!(breaker.try_acquire(at + Duration::seconds(100)).is_err());

        at += Duration::seconds(130);
        let permit = breaker.try_acquire(at).unwrap();
        breaker.record_failure(permit, at);
        assert_eq!(breaker.snapshot().cooldown_secs, 200);
        assert_eq!(breaker.snapshot().open_events, 3);
    }

    #[test]
    fn released_probe_frees_the_slot() {
        let breaker = CircuitBreaker::new("serp", config());
        let now = t0();
        trip(&breaker, now);

        let after = now + Duration::seconds(70);
        let permit = breaker.try_acquire(after).unwrap();
        breaker.release(permit);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.try_acquire(after).unwrap(), Permit::Probe);
    }

    #[test]
    fn restore_roundtrip() {
        let breaker = CircuitBreaker::new("serp", config());
        trip(&breaker, t0());
        let snapshot = breaker.snapshot();

        let restored = CircuitBreaker::new("serp", config());
        restored.restore(&snapshot);
        assert_eq!(restored.snapshot(), snapshot);
        assert!(restored.try_acquire(t0() + Duration::seconds(10)).is_err());
    }
}
