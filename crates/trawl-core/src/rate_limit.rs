//! Admission control for API keys and target domains.
//!
//! Each bucket key owns a window of recent admissions. A call is admitted
//! iff fewer than `max_requests` admissions fall inside the window; the
//! check and the record happen in one critical section per store, so
//! concurrent callers on the same key can never over-admit.
//!
//! # Example
//!
//! ```rust,no_run
//! use trawl_core::rate_limit::{InMemoryRateLimitStore, RateLimitConfig, RateLimiter};
//!
//! # async fn run() {
//! let limiter = RateLimiter::new(InMemoryRateLimitStore::new());
//! let decision = limiter
//!     .check_limit("key:abc", &RateLimitConfig::new(5, 60))
//!     .await;
//! assert!(decision.allowed);
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::AppError;

/// How admissions are counted inside a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Rolling window ending at "now".
    #[default]
    Sliding,
    /// Aligned windows of fixed length; the counter resets at each boundary.
    Fixed,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::Sliding => "sliding",
            RateLimitStrategy::Fixed => "fixed",
        }
    }
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RateLimitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sliding" => Ok(RateLimitStrategy::Sliding),
            "fixed" => Ok(RateLimitStrategy::Fixed),
            _ => Err(format!("Unknown rate limit strategy: {s}")),
        }
    }
}

/// Longest window a limit may use. Longer windows are clamped to this.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub strategy: RateLimitStrategy,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
            strategy: RateLimitStrategy::Sliding,
        }
    }

    pub fn with_strategy(mut self, strategy: RateLimitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Window as a chrono delta, clamped to [`MAX_WINDOW`].
    pub fn window_delta(&self) -> TimeDelta {
        let millis = i64::try_from(self.window.min(MAX_WINDOW).as_millis()).unwrap_or(i64::MAX);
        TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX)
    }
}

/// Service tier of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl FromStr for RateLimitTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(RateLimitTier::Free),
            "pro" => Ok(RateLimitTier::Pro),
            "enterprise" => Ok(RateLimitTier::Enterprise),
            _ => Err(format!("Unknown tier: {s}")),
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// When the oldest counted admission leaves the window.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// How long a rejected caller should wait before retrying.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        if self.allowed {
            return Duration::ZERO;
        }
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// `retry_after` rounded up to whole seconds, never below 1 for rejections.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        if self.allowed {
            return 0;
        }
        let wait = self.retry_after(now);
        let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// `now - window`, saturating at the earliest representable instant.
pub fn window_cutoff(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `start + window`, saturating at the latest representable instant.
pub fn window_end(start: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    start.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Bucket key for an API key id.
pub fn api_key_bucket(key_id: &str) -> String {
    format!("key:{key_id}")
}

/// Bucket key for the domain of a URL (`domain:host:port`).
pub fn domain_bucket(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let host = url.host_str()?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Some(format!("domain:{}{}", host.to_lowercase(), port))
}

/// Backing storage for admission windows.
///
/// Implementations must make check-and-record atomic per key.
pub trait RateLimitStore: Send + Sync + Clone {
    fn check_and_record(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<RateLimitDecision, AppError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum WindowState {
    Log(VecDeque<DateTime<Utc>>),
    Counter { start: DateTime<Utc>, count: u32 },
}

#[derive(Debug)]
struct Bucket {
    window: TimeDelta,
    state: WindowState,
}

/// Process-local store. Admission state is not shared between processes.
#[derive(Clone, Default)]
pub struct InMemoryRateLimitStore {
    buckets: Arc<Mutex<HashMap<String, Bucket>>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned rate limit mutex");
            poisoned.into_inner()
        })
    }

    /// Drop buckets with nothing left in their window.
    pub fn prune_idle(&self, now: DateTime<Utc>) -> usize {
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| match &mut bucket.state {
            WindowState::Log(log) => {
                prune_log(log, now, bucket.window);
                !log.is_empty()
            }
            WindowState::Counter { start, .. } => window_end(*start, bucket.window) > now,
        });
        before - buckets.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    async fn check_and_record(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, AppError> {
        let window = config.window_delta();
        let mut buckets = self.lock();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            window,
            state: empty_state(config.strategy),
        });

        // Strategy or window changed for this key: start over.
        let strategy_matches = matches!(
            (&bucket.state, config.strategy),
            (WindowState::Log(_), RateLimitStrategy::Sliding)
                | (WindowState::Counter { .. }, RateLimitStrategy::Fixed)
        );
        if !strategy_matches || bucket.window != window {
            bucket.window = window;
            bucket.state = empty_state(config.strategy);
        }

        let decision = match &mut bucket.state {
            WindowState::Log(log) => sliding_check(log, config.max_requests, window, now),
            WindowState::Counter { start, count } => {
                fixed_check(start, count, config.max_requests, window, now)
            }
        };
        Ok(decision)
    }
}

fn empty_state(strategy: RateLimitStrategy) -> WindowState {
    match strategy {
        RateLimitStrategy::Sliding => WindowState::Log(VecDeque::new()),
        RateLimitStrategy::Fixed => WindowState::Counter {
            start: DateTime::<Utc>::MIN_UTC,
            count: 0,
        },
    }
}

/// Entries at or before `now - window` have left the window.
fn prune_log(log: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>, window: TimeDelta) {
    let cutoff = window_cutoff(now, window);
    while log.front().is_some_and(|&ts| ts <= cutoff) {
        log.pop_front();
    }
}

fn sliding_check(
    log: &mut VecDeque<DateTime<Utc>>,
    max_requests: u32,
    window: TimeDelta,
    now: DateTime<Utc>,
) -> RateLimitDecision {
    prune_log(log, now, window);

    let allowed = (log.len() as u64) < u64::from(max_requests);
    if allowed {
        log.push_back(now);
    }

    let used = log.len() as u32;
    let reset_at = window_end(log.front().copied().unwrap_or(now), window);

    RateLimitDecision {
        allowed,
        limit: max_requests,
        remaining: max_requests.saturating_sub(used),
        reset_at,
    }
}

/// Start of the aligned window containing `now`.
pub fn window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    let window_ms = window.num_milliseconds().max(1);
    let now_ms = now.timestamp_millis();
    let start_ms = now_ms - now_ms.rem_euclid(window_ms);
    DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or(now)
}

fn fixed_check(
    start: &mut DateTime<Utc>,
    count: &mut u32,
    max_requests: u32,
    window: TimeDelta,
    now: DateTime<Utc>,
) -> RateLimitDecision {
    let current = window_start(now, window);
    if *start != current {
        *start = current;
        *count = 0;
    }

    let allowed = *count < max_requests;
    if allowed {
        *count += 1;
    }

    RateLimitDecision {
        allowed,
        limit: max_requests,
        remaining: max_requests.saturating_sub(*count),
        reset_at: window_end(current, window),
    }
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

/// Admission gate over any [`RateLimitStore`].
///
/// Store failures never block callers: they are logged and the call is
/// admitted (fail-open).
#[derive(Clone)]
pub struct RateLimiter<S> {
    store: S,
}

impl<S: RateLimitStore> RateLimiter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn check_limit(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.check_limit_at(key, config, Utc::now()).await
    }

    pub async fn check_limit_at(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if config.max_requests == 0 {
            return RateLimitDecision {
                allowed: false,
                limit: 0,
                remaining: 0,
                reset_at: window_end(now, config.window_delta()),
            };
        }

        match self.store.check_and_record(key, config, now).await {
            Ok(decision) => {
                if !decision.allowed {
                    tracing::debug!(%key, reset_at = %decision.reset_at, "Rate limit reached");
                }
                decision
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "Rate limit store failed, admitting request");
                RateLimitDecision {
                    allowed: true,
                    limit: config.max_requests,
                    remaining: config.max_requests.saturating_sub(1),
                    reset_at: window_end(now, config.window_delta()),
                }
            }
        }
    }

    /// Like [`check_limit`](Self::check_limit) but turns a rejection into
    /// [`AppError::RateLimitExceeded`].
    pub async fn admit(
        &self,
        key: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, AppError> {
        let now = Utc::now();
        let decision = self.check_limit_at(key, config, now).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(AppError::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs(now),
            })
        }
    }
}
