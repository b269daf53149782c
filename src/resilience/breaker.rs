//! Circuit Breaker
//!
//! Classic three-state breaker kept per external dependency:
//!
//! - `Closed`: calls pass through; `failure_threshold` consecutive failures open it.
//! - `Open`: calls are short-circuited to the fallback until `timeout_ms` has
//!   elapsed; the next call after that becomes a half-open trial.
//! - `HalfOpen`: one trial call at a time; `success_threshold` consecutive
//!   successes close the breaker, any failure re-opens it.
//!
//! State lives behind a mutex that is never held across an `.await`, so
//! counters cannot be lost under concurrent failure bursts.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::StepError;

/// Per-dependency breaker configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Time an open breaker waits before allowing a trial, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_ms: 60_000,
        }
    }
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Current state of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// Testing recovery with a trial call.
    HalfOpen,
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

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Clone, PartialEq)]
pub enum BreakerError<E> {
    /// The breaker rejected the call without running it.
    Open(String),
    /// The operation ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open(name) => write!(f, "circuit for dependency '{}' is open", name),
            BreakerError::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl From<BreakerError<StepError>> for StepError {
    fn from(e: BreakerError<StepError>) -> Self {
        match e {
            BreakerError::Open(name) => StepError::CircuitOpen(name),
            BreakerError::Inner(inner) => inner,
        }
    }
}

/// Point-in-time view of a breaker, suitable for metrics endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            trial_in_flight: false,
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.trial_in_flight = false;
    }
}

/// Outcome of asking the breaker for permission to call.
enum Admission {
    Allowed { trial: bool },
    Rejected,
}

/// Breaker guarding a single dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Dependency name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Stored state. An open breaker whose timeout elapsed still reports
    /// `Open` until the next call turns it into a trial.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
        }
    }

    /// Force-closes the breaker and clears its counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        info!("Circuit '{}': {} -> closed (manual reset)", self.name, inner.state);
        inner.close();
    }

    /// Runs `operation` unless the breaker is open; rejections surface as
    /// [`BreakerError::Open`].
    pub async fn call<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.guarded(operation).await {
            Some(result) => result.map_err(BreakerError::Inner),
            None => Err(BreakerError::Open(self.name.clone())),
        }
    }

    /// Runs `operation` unless the breaker is open, in which case `fallback`
    /// runs instead.
    pub async fn call_with_fallback<T, E, F, Fut, B, BFut>(
        &self,
        operation: F,
        fallback: B,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T, E>>,
    {
        match self.guarded(operation).await {
            Some(result) => result,
            None => {
                debug!("Circuit '{}' open, using fallback", self.name);
                fallback().await
            }
        }
    }

    /// Returns `None` when the call was rejected.
    async fn guarded<T, E, F, Fut>(&self, operation: F) -> Option<Result<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = match self.admit() {
            Admission::Allowed { trial } => trial,
            Admission::Rejected => return None,
        };

        let mut permit = Permit {
            breaker: self,
            trial,
            settled: false,
        };

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        permit.settled = true;

        Some(result)
    }

    fn admit(&self) -> Admission {
        let mut inner = self.lock();

        let admission = match inner.state {
            CircuitState::Closed => Admission::Allowed { trial: false },
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.config.timeout() {
                    info!("Circuit '{}': open -> half-open (timeout elapsed)", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Admission::Rejected
                } else {
                    inner.trial_in_flight = true;
                    Admission::Allowed { trial: true }
                }
            }
        };

        match admission {
            Admission::Allowed { .. } => inner.total_calls += 1,
            Admission::Rejected => inner.total_rejections += 1,
        }

        admission
    }

    fn on_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.consecutive_successes += 1;

                if inner.consecutive_successes >= self.config.success_threshold {
                    info!(
                        "Circuit '{}': half-open -> closed after {} successful trials",
                        self.name, inner.consecutive_successes
                    );
                    inner.close();
                }
            }
            CircuitState::Open => {
                // Closed-state call that finished after a concurrent failure opened the breaker.
                debug!("Circuit '{}': success recorded while open", self.name);
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.total_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        "Circuit '{}': closed -> open after {} consecutive failures",
                        self.name, inner.consecutive_failures
                    );
                    inner.open();
                }
            }
            CircuitState::HalfOpen => {
                warn!("Circuit '{}': half-open -> open (trial failed)", self.name);
                inner.open();
            }
            CircuitState::Open => {}
        }
    }

    /// Releases a half-open trial whose future was dropped before finishing.
    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

/// Breakers keyed by dependency name, created lazily on first use.
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    default_config: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
}

impl BreakerRegistry {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_config,
            overrides: HashMap::new(),
        }
    }

    /// Registers configuration for a specific dependency.
    pub fn with_config(mut self, dependency: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    /// Configuration that applies to `dependency`.
    pub fn config_for(&self, dependency: &str) -> &BreakerConfig {
        self.overrides.get(dependency).unwrap_or(&self.default_config)
    }

    /// Returns the breaker for `dependency`, creating it with its configured settings.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        let config = self.config_for(dependency).clone();
        self.breaker_with(dependency, config)
    }

    /// Returns the breaker for `dependency`, creating it with `config` if absent.
    /// An existing breaker keeps the configuration it was created with.
    pub fn breaker_with(&self, dependency: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.read().get(dependency) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(dependency.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(dependency, config))),
        )
    }

    /// Runs `operation` through the named breaker; `fallback` replaces it while
    /// the breaker is open, otherwise the call fails with `CircuitOpen`.
    pub async fn execute<T, F, Fut, B, BFut>(
        &self,
        dependency: &str,
        operation: F,
        fallback: Option<B>,
        config: &BreakerConfig,
    ) -> Result<T, StepError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
        B: FnOnce() -> BFut,
        BFut: Future<Output = Result<T, StepError>>,
    {
        let breaker = self.breaker_with(dependency, config.clone());
        match fallback {
            Some(fallback) => breaker.call_with_fallback(operation, fallback).await,
            None => breaker.call(operation).await.map_err(StepError::from),
        }
    }

    /// Current state of every known breaker, sorted by name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> =
            self.read().values().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Force-closes a breaker. Returns false if it does not exist.
    pub fn reset(&self, dependency: &str) -> bool {
        match self.read().get(dependency) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}
