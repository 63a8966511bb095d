//! Per-host circuit breaker state machines.
//!
//! The registry keeps one [`HostBreaker`] per key behind its own mutex, in a
//! sharded map. Lookups for different keys never wait on each other; all
//! reads and writes of one key's state go through that key's mutex.

use crate::config::BreakerConfig;
use crate::error::HttpError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Breaker state of one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Requests pass through; failures are counted
    Closed,
    /// Requests fail fast with [`HttpError::CircuitOpen`]
    Open,
    /// A limited number of trials are let through
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of the current state generation.
///
/// Reset on every state change and, in the Closed state, at the end of
/// each rolling interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl BreakerCounts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

type Transition = (CircuitState, CircuitState);

#[derive(Debug)]
struct HostBreaker {
    state: CircuitState,
    /// Bumped on every state change and interval rollover
    generation: u64,
    counts: BreakerCounts,
    /// Open: when trial requests may start. Closed: end of the rolling interval.
    expiry: Option<Instant>,
    half_open_in_flight: u32,
    last_transition: Instant,
}

impl HostBreaker {
    fn new(config: &BreakerConfig, now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            counts: BreakerCounts::default(),
            expiry: config.interval.map(|i| now + i),
            half_open_in_flight: 0,
            last_transition: now,
        }
    }

    /// Apply time-driven changes: Open -> HalfOpen once the open timeout
    /// has passed, and the Closed-state interval rollover.
    fn refresh(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        match (self.state, self.expiry) {
            (CircuitState::Open, Some(expiry)) if now >= expiry => {
                Some(self.set_state(CircuitState::HalfOpen, config, now))
            }
            (CircuitState::Closed, Some(expiry)) if now >= expiry => {
                self.new_generation(config, now);
                None
            }
            _ => None,
        }
    }

    fn set_state(&mut self, to: CircuitState, config: &BreakerConfig, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.last_transition = now;
        self.new_generation(config, now);
        (from, to)
    }

    fn new_generation(&mut self, config: &BreakerConfig, now: Instant) {
        self.generation = self.generation.wrapping_add(1);
        self.counts = BreakerCounts::default();
        self.half_open_in_flight = 0;
        self.expiry = match self.state {
            CircuitState::Closed => config.interval.map(|i| now + i),
            CircuitState::Open => Some(now + config.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }

    fn on_success(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        self.counts.on_success();
        match self.state {
            CircuitState::HalfOpen => Some(self.set_state(CircuitState::Closed, config, now)),
            _ => None,
        }
    }

    fn on_failure(&mut self, config: &BreakerConfig, now: Instant) -> Option<Transition> {
        self.counts.on_failure();
        match self.state {
            CircuitState::Closed if (config.trip)(&self.counts) => {
                Some(self.set_state(CircuitState::Open, config, now))
            }
            CircuitState::HalfOpen => Some(self.set_state(CircuitState::Open, config, now)),
            _ => None,
        }
    }
}

/// Lazily populated map of breaker state machines, one per key.
///
/// Shared by every operation going through the breaker layer; cloned
/// handles are obtained through `Arc`.
pub struct BreakerRegistry {
    config: BreakerConfig,
    hosts: DashMap<String, Arc<Mutex<HostBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            hosts: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state of `key`; unknown keys are Closed.
    #[must_use]
    pub fn state(&self, key: &str) -> CircuitState {
        let Some(host) = self.lookup(key) else {
            return CircuitState::Closed;
        };
        let (state, transition) = {
            let mut host = host.lock();
            let transition = host.refresh(&self.config, Instant::now());
            (host.state, transition)
        };
        self.notify(key, transition);
        state
    }

    /// Counters of the current generation of `key`.
    #[must_use]
    pub fn counts(&self, key: &str) -> BreakerCounts {
        self.lookup(key)
            .map(|host| host.lock().counts)
            .unwrap_or_default()
    }

    /// When `key` last changed state, or was created if it never has.
    /// `None` for unknown keys.
    #[must_use]
    pub fn last_transition(&self, key: &str) -> Option<Instant> {
        let host = self.lookup(key)?;
        let (at, transition) = {
            let mut host = host.lock();
            let transition = host.refresh(&self.config, Instant::now());
            (host.last_transition, transition)
        };
        self.notify(key, transition);
        Some(at)
    }

    /// Keys that have a state machine.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.hosts.iter().map(|e| e.key().clone()).collect()
    }

    /// Ask to send one request to `key`.
    ///
    /// # Errors
    /// Returns [`HttpError::CircuitOpen`] while the breaker is Open, or when
    /// all half-open trial slots are taken.
    pub fn try_acquire(&self, key: &str) -> Result<Permit<'_>, HttpError> {
        let host = self.get_or_create(key);
        let now = Instant::now();

        let (admitted, transition) = {
            let mut guard = host.lock();
            let transition = guard.refresh(&self.config, now);
            let admitted = match guard.state {
                CircuitState::Open => None,
                CircuitState::HalfOpen
                    if guard.half_open_in_flight >= self.config.half_open_max_requests =>
                {
                    None
                }
                state => {
                    guard.counts.on_request();
                    let trial = state == CircuitState::HalfOpen;
                    if trial {
                        guard.half_open_in_flight += 1;
                    }
                    Some((guard.generation, trial))
                }
            };
            (admitted, transition)
        };
        self.notify(key, transition);

        match admitted {
            Some((generation, trial)) => Ok(Permit {
                registry: self,
                host,
                key: key.to_owned(),
                generation,
                trial,
                finished: false,
            }),
            None => {
                tracing::debug!(key, "Circuit open, rejecting request");
                Err(HttpError::CircuitOpen {
                    key: key.to_owned(),
                })
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<Arc<Mutex<HostBreaker>>> {
        self.hosts.get(key).map(|e| Arc::clone(e.value()))
    }

    fn get_or_create(&self, key: &str) -> Arc<Mutex<HostBreaker>> {
        if let Some(host) = self.lookup(key) {
            return host;
        }
        let entry = self.hosts.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(HostBreaker::new(&self.config, Instant::now())))
        });
        Arc::clone(entry.value())
    }

    /// Runs outside of any lock.
    fn notify(&self, key: &str, transition: Option<Transition>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => {
                tracing::warn!(key, from = from.as_str(), "Circuit breaker opened");
            }
            CircuitState::Closed => {
                tracing::info!(key, from = from.as_str(), "Circuit breaker closed");
            }
            CircuitState::HalfOpen => {
                tracing::debug!(key, from = from.as_str(), "Circuit breaker half-open");
            }
        }
        if let Some(hook) = &self.config.on_state_change {
            hook(key, from, to);
        }
    }
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .field("hosts", &self.hosts.len())
            .finish()
    }
}

/// Admission for one inward call.
///
/// Report the result with [`Permit::record`]. A permit dropped without a
/// result (caller canceled, or the result was not the host's fault) only
/// gives back its half-open trial slot.
#[must_use = "a permit must be resolved with `record` or `abandon`"]
pub struct Permit<'a> {
    registry: &'a BreakerRegistry,
    host: Arc<Mutex<HostBreaker>>,
    key: String,
    generation: u64,
    trial: bool,
    finished: bool,
}

impl Permit<'_> {
    /// Record the outcome of the admitted call.
    pub fn record(mut self, success: bool) {
        self.finish(Some(success));
    }

    /// Release the permit without counting a result.
    pub fn abandon(mut self) {
        self.finish(None);
    }

    fn finish(&mut self, success: Option<bool>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let config = &self.registry.config;
        let transition = {
            let mut host = self.host.lock();
            // Results from an older generation must not touch the new state
            if host.generation != self.generation {
                return;
            }
            if self.trial {
                host.half_open_in_flight = host.half_open_in_flight.saturating_sub(1);
            }
            let now = Instant::now();
            match success {
                Some(true) => host.on_success(config, now),
                Some(false) => host.on_failure(config, now),
                None => None,
            }
        };
        self.registry.notify(&self.key, transition);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.finish(None);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn registry(trip_after: u32) -> BreakerRegistry {
        BreakerRegistry::new(
            BreakerConfig::default()
                .trip_after_consecutive_failures(trip_after)
                .with_open_timeout(Duration::from_secs(30)),
        )
    }

    fn fail(reg: &BreakerRegistry, key: &str) {
        reg.try_acquire(key).unwrap().record(false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_after_consecutive_failures() {
        let reg = registry(2);
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Closed);
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Open);

        let err = reg.try_acquire("a").err().unwrap();
        assert!(err.is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let reg = registry(2);
        fail(&reg, "a");
        reg.try_acquire("a").unwrap().record(true);
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Closed);
        assert_eq!(reg.counts("a").total_failures, 2);
        assert_eq!(reg.counts("a").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_transition_follows_state_changes() {
        let reg = registry(1);
        assert_eq!(reg.last_transition("a"), None);

        reg.try_acquire("a").unwrap().record(true);
        let created = reg.last_transition("a").unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Open);
        let opened = reg.last_transition("a").unwrap();
        assert_eq!(opened - created, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(31)).await;
        let half_open = reg.last_transition("a").unwrap();
        assert_eq!(reg.state("a"), CircuitState::HalfOpen);
        assert_eq!(half_open - opened, Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hosts_are_isolated() {
        let reg = registry(1);
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Open);
        assert_eq!(reg.state("b"), CircuitState::Closed);
        reg.try_acquire("b").unwrap().record(true);
        assert_eq!(reg.counts("b").total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_success_closes() {
        let reg = registry(1);
        fail(&reg, "a");

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(reg.state("a"), CircuitState::HalfOpen);

        let trial = reg.try_acquire("a").unwrap();
        assert!(
            reg.try_acquire("a").is_err(),
            "second trial must be rejected while the first is in flight"
        );
        trial.record(true);
        assert_eq!(reg.state("a"), CircuitState::Closed);
        assert_eq!(reg.counts("a"), BreakerCounts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_failure_reopens_with_fresh_timer() {
        let reg = registry(1);
        fail(&reg, "a");
        tokio::time::advance(Duration::from_secs(31)).await;

        reg.try_acquire("a").unwrap().record(false);
        assert_eq!(reg.state("a"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(reg.state("a"), CircuitState::Open);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(reg.state("a"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_slot() {
        let reg = registry(1);
        fail(&reg, "a");
        tokio::time::advance(Duration::from_secs(31)).await;

        let trial = reg.try_acquire("a").unwrap();
        drop(trial);
        assert_eq!(reg.state("a"), CircuitState::HalfOpen);
        assert!(reg.try_acquire("a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_result_ignored() {
        let reg = registry(1);
        let slow = reg.try_acquire("a").unwrap();
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(reg.state("a"), CircuitState::HalfOpen);

        // Admitted while Closed; must not close the half-open breaker
        slow.record(true);
        assert_eq!(reg.state("a"), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_clears_closed_counts() {
        let reg = BreakerRegistry::new(
            BreakerConfig::default()
                .trip_after_consecutive_failures(3)
                .with_interval(Duration::from_secs(10)),
        );
        fail(&reg, "a");
        fail(&reg, "a");
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&reg, "a");
        assert_eq!(reg.state("a"), CircuitState::Closed);
        assert_eq!(reg.counts("a").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_hook_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reg = BreakerRegistry::new(
            BreakerConfig::default()
                .trip_after_consecutive_failures(1)
                .with_open_timeout(Duration::from_secs(5))
                .with_state_change_hook(move |key, from, to| {
                    sink.lock().push((key.to_owned(), from, to));
                }),
        );

        fail(&reg, "a");
        tokio::time::advance(Duration::from_secs(6)).await;
        reg.try_acquire("a").unwrap().record(true);

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("a".to_owned(), CircuitState::Closed, CircuitState::Open),
                ("a".to_owned(), CircuitState::Open, CircuitState::HalfOpen),
                ("a".to_owned(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_creates_one_state_machine() {
        let reg = Arc::new(registry(1_000));
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let reg = reg.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                reg.try_acquire("shared").unwrap().record(true);
                admitted.fetch_add(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(reg.keys(), vec!["shared".to_owned()]);
        assert_eq!(reg.counts("shared").total_successes, 32);
        assert_eq!(admitted.load(Ordering::SeqCst), 32);
    }
}
