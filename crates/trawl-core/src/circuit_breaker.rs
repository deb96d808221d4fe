//! Circuit breaker pattern for external dependency calls.
//!
//! Protects against cascading failures when LLM providers, webhooks or
//! local services misbehave. One breaker per dependency name; breakers
//! never share state.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED (healthy) --[N failures]--> OPEN (rejecting) --[cooldown]--> HALF_OPEN (probing)
//!                                                                         |
//!                                       <--[failure]--                    |
//!                                                                         |
//! CLOSED <-----------------------[M successes]----------------------------+
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - requests flow normally.
    Closed,
    /// Circuit is open - requests are rejected immediately.
    Open,
    /// Circuit is half-open - limited requests allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Which errors count as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TripPolicy {
    /// Every error returned by the wrapped call is a failure.
    #[default]
    AllErrors,
    /// Only errors where [`AppError::should_trip_circuit`] holds.
    TransientOnly,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Number of successful requests in half-open state to close the circuit.
    pub success_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub cooldown: Duration,

    /// Maximum number of concurrent trial calls while half-open.
    pub half_open_max_calls: u32,

    pub trip_policy: TripPolicy,

    /// When rate limit (429) is detected, multiply the cooldown by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Maximum cooldown after rate limit backoffs.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(30),
            half_open_max_calls: 1,
            trip_policy: TripPolicy::AllErrors,
            rate_limit_backoff_multiplier: 2.0,
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            cooldown,
            ..Default::default()
        }
    }
}

/// Internal state tracking for the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    last_error_message: Option<String>,
    current_cooldown: Duration,
    trials_in_flight: u32,
    /// Bumped on every entry into half-open so stale trial guards are ignored.
    half_open_epoch: u64,
}

impl CircuitBreakerInner {
    fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            last_error_message: None,
            current_cooldown: config.cooldown,
            trials_in_flight: 0,
            half_open_epoch: 0,
        }
    }

    fn time_until_attempt(&self) -> Duration {
        self.next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open_ms: Option<u64>,
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// Circuit is open - request was rejected without calling the service.
    Open { name: String, retry_after: Duration },
    /// The inner operation failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => {
                write!(
                    f,
                    "Circuit breaker '{}' is open. Retry after {} ms.",
                    name,
                    retry_after.as_millis()
                )
            }
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

impl From<CircuitBreakerError> for AppError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open { name, retry_after } => {
                AppError::CircuitOpen { name, retry_after }
            }
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

/// Thread-safe circuit breaker for protecting external calls.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitBreakerInner>>,
}

/// Releases a half-open trial slot when the trial ends or is cancelled.
struct TrialSlot<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
}

impl Drop for TrialSlot<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.lock_inner();
        if inner.half_open_epoch == self.epoch {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = CircuitBreakerInner::new(&config);
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, CircuitBreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        let time_until_half_open_ms = (inner.state == CircuitState::Open)
            .then(|| inner.time_until_attempt().as_millis() as u64);

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_error: inner.last_error_message.clone(),
            time_until_half_open_ms,
        }
    }

    /// Executes the given operation through the circuit breaker.
    ///
    /// - Closed: executes operation, tracks success/failure
    /// - Open: returns `CircuitBreakerError::Open` immediately
    /// - HalfOpen: admits up to `half_open_max_calls` trials, transitions on their result
    pub async fn execute<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let _trial = self.admit()?;

        let result = operation().await;

        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                let counts = match self.config.trip_policy {
                    TripPolicy::AllErrors => true,
                    TripPolicy::TransientOnly => e.should_trip_circuit(),
                };
                if counts {
                    self.record_failure(e);
                }
            }
        }

        result.map_err(CircuitBreakerError::Inner)
    }

    /// Decide whether a call may proceed; half-open calls take a trial slot.
    fn admit(&self) -> Result<Option<TrialSlot<'_>>, CircuitBreakerError> {
        let mut inner = self.lock_inner();
        self.maybe_transition_to_half_open(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => Err(CircuitBreakerError::Open {
                name: self.name.clone(),
                retry_after: inner.time_until_attempt(),
            }),
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.half_open_max_calls.max(1) {
                    return Err(CircuitBreakerError::Open {
                        name: self.name.clone(),
                        retry_after: Duration::ZERO,
                    });
                }
                inner.trials_in_flight += 1;
                Ok(Some(TrialSlot {
                    breaker: self,
                    epoch: inner.half_open_epoch,
                }))
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_at = None;
                    inner.last_error_message = None;
                    inner.current_cooldown = self.config.cooldown;
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        let is_rate_limit = error.is_rate_limited();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_error_message = Some(error.to_string());

                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening after {} consecutive failures",
                        inner.failure_count
                    );
                    if is_rate_limit {
                        self.extend_cooldown(&mut inner);
                    }
                    self.open(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, returning to open state"
                );
                inner.last_error_message = Some(error.to_string());
                inner.success_count = 0;
                if is_rate_limit {
                    self.extend_cooldown(&mut inner);
                }
                self.open(&mut inner);
            }
            CircuitState::Open => {
                inner.last_error_message = Some(error.to_string());
            }
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        tracing::info!(circuit = %self.name, "Circuit breaker manually reset");
        *inner = CircuitBreakerInner {
            half_open_epoch: inner.half_open_epoch + 1,
            ..CircuitBreakerInner::new(&self.config)
        };
    }

    fn open(&self, inner: &mut CircuitBreakerInner) {
        inner.state = CircuitState::Open;
        inner.next_attempt_at = Some(Instant::now() + inner.current_cooldown);
    }

    fn extend_cooldown(&self, inner: &mut CircuitBreakerInner) {
        inner.current_cooldown = std::cmp::min(
            Duration::from_secs_f32(
                inner.current_cooldown.as_secs_f32() * self.config.rate_limit_backoff_multiplier,
            ),
            self.config.max_cooldown,
        );
        tracing::info!(
            circuit = %self.name,
            cooldown_ms = inner.current_cooldown.as_millis() as u64,
            "Extended cooldown due to rate limit"
        );
    }

    fn maybe_transition_to_half_open(&self, inner: &mut CircuitBreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(next_attempt) = inner.next_attempt_at
            && Instant::now() >= next_attempt
        {
            tracing::info!(
                circuit = %self.name,
                "Circuit breaker transitioning to half-open state"
            );
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.trials_in_flight = 0;
            inner.half_open_epoch += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Hands out one breaker per dependency name.
///
/// Names without an explicit override get the default configuration.
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: Arc<HashMap<String, CircuitBreakerConfig>>,
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        default_config: CircuitBreakerConfig,
        overrides: HashMap<String, CircuitBreakerConfig>,
    ) -> Self {
        Self {
            default_config,
            overrides: Arc::new(overrides),
            breakers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the breaker for `name`, creating it on first use.
    pub fn get(&self, name: &str) -> CircuitBreaker {
        {
            let breakers = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().unwrap_or_else(|p| p.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.default_config.clone());
                tracing::debug!(circuit = %name, "Created circuit breaker");
                CircuitBreaker::new(name, config)
            })
            .clone()
    }

    /// Run `operation` through the breaker named `name`.
    pub async fn execute<F, T, Fut>(&self, name: &str, operation: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        self.get(name).execute(operation).await.map_err(Into::into)
    }

    /// Stats of every breaker created so far, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let breakers: Vec<CircuitBreaker> = {
            let map = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            map.values().cloned().collect()
        };
        let mut stats: Vec<_> = breakers.iter().map(CircuitBreaker::stats).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset the named breaker. Returns false if it was never created.
    pub fn reset(&self, name: &str) -> bool {
        let breaker = {
            let map = self.breakers.read().unwrap_or_else(|p| p.into_inner());
            map.get(name).cloned()
        };
        match breaker {
            Some(b) => {
                b.reset();
                true
            }
            None => false,
        }
    }
}
