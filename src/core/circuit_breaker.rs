//! Consecutive-failure circuit breaker with a single half-open trial.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an await;
//! callers obtain a [`CallPermit`] before contacting the upstream and settle it
//! with the outcome afterwards. A trial permit that is dropped unsettled (the
//! request future was abandoned) counts as a failure so the breaker cannot
//! stay half-open forever.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    config::models::CircuitBreakerConfig,
    metrics::{record_breaker_transition, set_breaker_state},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerStatus {
    fn as_str(self) -> &'static str {
        match self {
            BreakerStatus::Closed => "closed",
            BreakerStatus::Open => "open",
            BreakerStatus::HalfOpen => "half_open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            BreakerStatus::Closed => 0.0,
            BreakerStatus::HalfOpen => 1.0,
            BreakerStatus::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub open_duration: Duration,
}

impl BreakerSettings {
    pub fn from_config(config: &CircuitBreakerConfig) -> Result<Self, String> {
        if config.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }
        let open_duration = humantime::parse_duration(&config.open_duration)
            .map_err(|e| format!("Invalid open_duration '{}': {e}", config.open_duration))?;
        Ok(Self {
            failure_threshold: config.failure_threshold,
            open_duration,
        })
    }
}

#[derive(Debug)]
struct BreakerState {
    settings: BreakerSettings,
    status: BreakerStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Point-in-time view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerStatus,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub open_duration_ms: u128,
}

pub struct CircuitBreaker {
    name: String,
    state: Mutex<BreakerState>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        set_breaker_state(&name, BreakerStatus::Closed.gauge_value());
        Self {
            name,
            state: Mutex::new(BreakerState {
                settings,
                status: BreakerStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        // The state stays consistent across a panic in another holder.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> BreakerStatus {
        self.lock().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == BreakerStatus::Open
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: state.status,
            consecutive_failures: state.consecutive_failures,
            failure_threshold: state.settings.failure_threshold,
            open_duration_ms: state.settings.open_duration.as_millis(),
        }
    }

    /// Apply new thresholds without touching the current state.
    pub fn reconfigure(&self, settings: BreakerSettings) {
        let mut state = self.lock();
        if state.settings != settings {
            tracing::info!(
                "Reconfiguring circuit breaker '{}': threshold={}, open_duration={:?}",
                self.name,
                settings.failure_threshold,
                settings.open_duration
            );
            state.settings = settings;
        }
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<CallPermit> {
        self.try_acquire_at(Instant::now())
    }

    /// Ask to make one upstream call. `None` means short-circuit.
    pub fn try_acquire_at(self: &Arc<Self>, now: Instant) -> Option<CallPermit> {
        let mut state = self.lock();
        let trial = match state.status {
            BreakerStatus::Closed => false,
            BreakerStatus::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened_at) < state.settings.open_duration {
                    return None;
                }
                self.transition(&mut state, BreakerStatus::HalfOpen);
                state.trial_in_flight = true;
                true
            }
            BreakerStatus::HalfOpen => {
                if state.trial_in_flight {
                    return None;
                }
                state.trial_in_flight = true;
                true
            }
        };
        drop(state);

        Some(CallPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut state = self.lock();
        match state.status {
            BreakerStatus::Closed => state.consecutive_failures = 0,
            BreakerStatus::HalfOpen if trial => {
                state.trial_in_flight = false;
                state.consecutive_failures = 0;
                state.opened_at = None;
                self.transition(&mut state, BreakerStatus::Closed);
            }
            // Stale permits issued before the breaker opened.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool, now: Instant) {
        let mut state = self.lock();
        match state.status {
            BreakerStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= state.settings.failure_threshold {
                    state.opened_at = Some(now);
                    self.transition(&mut state, BreakerStatus::Open);
                }
            }
            BreakerStatus::HalfOpen if trial => {
                state.trial_in_flight = false;
                state.consecutive_failures += 1;
                state.opened_at = Some(now);
                self.transition(&mut state, BreakerStatus::Open);
            }
            _ => {}
        }
    }

    fn on_release(&self, trial: bool) {
        if trial {
            let mut state = self.lock();
            if state.status == BreakerStatus::HalfOpen {
                state.trial_in_flight = false;
            }
        }
    }

    fn transition(&self, state: &mut BreakerState, to: BreakerStatus) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;

        match to {
            BreakerStatus::Open => tracing::warn!(
                "Circuit breaker '{}' {} -> {} after {} consecutive failures",
                self.name,
                from,
                to,
                state.consecutive_failures
            ),
            _ => tracing::info!("Circuit breaker '{}' {} -> {}", self.name, from, to),
        }
        record_breaker_transition(&self.name, from.as_str(), to.as_str());
        set_breaker_state(&self.name, to.gauge_value());
    }
}

/// Permission to make one upstream call through a breaker.
#[must_use = "a permit must be settled with the call outcome"]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl fmt::Debug for CallPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPermit")
            .field("breaker", &self.breaker.name)
            .field("trial", &self.trial)
            .finish()
    }
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    pub fn record_failure(self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.trial, now);
    }

    /// Settle with an outcome that says nothing about upstream health.
    pub fn release(mut self) {
        self.settled = true;
        self.breaker.on_release(self.trial);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.trial {
            tracing::debug!(
                "Trial call through breaker '{}' was abandoned; counting it as a failure",
                self.breaker.name
            );
            self.breaker.on_failure(true, Instant::now());
        }
    }
}

/// Breakers by name. Survives route table reloads so a reload never resets
/// breaker state.
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: scc::HashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the breaker called `name`, creating it on first use. An existing
    /// breaker keeps its state and adopts `settings`.
    pub async fn get_or_create(&self, name: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        match self.breakers.entry_async(name.to_string()).await {
            scc::hash_map::Entry::Occupied(entry) => {
                let breaker = entry.get().clone();
                breaker.reconfigure(settings);
                breaker
            }
            scc::hash_map::Entry::Vacant(entry) => {
                tracing::info!(
                    "Creating circuit breaker '{}' (threshold={}, open_duration={:?})",
                    name,
                    settings.failure_threshold,
                    settings.open_duration
                );
                let breaker = Arc::new(CircuitBreaker::new(name, settings));
                entry.insert_entry(breaker.clone());
                breaker
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read_async(name, |_, breaker| breaker.clone())
            .await
    }

    /// Snapshots of every breaker, sorted by name.
    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots = Vec::new();
        self.breakers
            .retain_async(|_, breaker| {
                snapshots.push(breaker.snapshot());
                true
            })
            .await;
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
