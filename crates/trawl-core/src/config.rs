use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::pool::PoolConfig;
use crate::rate_limit::{MAX_WINDOW, RateLimitConfig, RateLimitStrategy, RateLimitTier};
use crate::retry::RetryPolicy;
use crate::worker::OrchestratorConfig;

/// Admission budgets per API key tier plus the per-domain budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub free: RateLimitConfig,
    pub pro: RateLimitConfig,
    pub enterprise: RateLimitConfig,
    pub domain: RateLimitConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            free: RateLimitConfig::new(10, 60),
            pro: RateLimitConfig::new(100, 60),
            enterprise: RateLimitConfig::new(1000, 60),
            domain: RateLimitConfig::new(30, 60),
        }
    }
}

impl RateLimitSettings {
    pub fn for_tier(&self, tier: RateLimitTier) -> &RateLimitConfig {
        match tier {
            RateLimitTier::Free => &self.free,
            RateLimitTier::Pro => &self.pro,
            RateLimitTier::Enterprise => &self.enterprise,
        }
    }
}

/// Process configuration, read from `TRAWL_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct TrawlConfig {
    pub pool: PoolConfig,
    /// Instances launched at startup on the default engine.
    pub warm_instances: usize,
    pub orchestrator: OrchestratorConfig,
    pub rate_limits: RateLimitSettings,
    pub breaker_default: CircuitBreakerConfig,
    /// Per-dependency overrides keyed by breaker name.
    pub breakers: HashMap<String, CircuitBreakerConfig>,
}

impl TrawlConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Lookup(&lookup);

        let pool = PoolConfig {
            max_instances: env.positive("TRAWL_POOL_MAX_INSTANCES", defaults.pool.max_instances)?,
            max_pages_per_instance: env.positive(
                "TRAWL_POOL_MAX_PAGES_PER_INSTANCE",
                defaults.pool.max_pages_per_instance,
            )?,
            instance_idle_ttl: Duration::from_secs(env.number(
                "TRAWL_POOL_INSTANCE_IDLE_TTL_SECS",
                defaults.pool.instance_idle_ttl.as_secs(),
            )?),
            acquire_timeout: Duration::from_millis(env.number(
                "TRAWL_POOL_ACQUIRE_TIMEOUT_MS",
                defaults.pool.acquire_timeout.as_millis() as u64,
            )?),
        };
        let warm_instances = env.number("TRAWL_POOL_WARM_INSTANCES", defaults.warm_instances)?;

        let default_timeout = Duration::from_millis(env.positive(
            "TRAWL_JOB_DEFAULT_TIMEOUT_MS",
            defaults.orchestrator.default_timeout.as_millis() as u64,
        )?);
        let max_timeout = Duration::from_millis(env.positive(
            "TRAWL_JOB_MAX_TIMEOUT_MS",
            defaults.orchestrator.max_timeout.as_millis() as u64,
        )?);
        if default_timeout > max_timeout {
            return Err(AppError::ConfigError(format!(
                "TRAWL_JOB_DEFAULT_TIMEOUT_MS ({}) exceeds TRAWL_JOB_MAX_TIMEOUT_MS ({})",
                default_timeout.as_millis(),
                max_timeout.as_millis()
            )));
        }
        let webhook_retry = RetryPolicy {
            max_attempts: env.positive(
                "TRAWL_WEBHOOK_MAX_ATTEMPTS",
                defaults.orchestrator.webhook_retry.max_attempts,
            )?,
            base_delay: Duration::from_millis(env.number(
                "TRAWL_WEBHOOK_BASE_DELAY_MS",
                defaults.orchestrator.webhook_retry.base_delay.as_millis() as u64,
            )?),
            max_delay: defaults.orchestrator.webhook_retry.max_delay,
        };
        let orchestrator = OrchestratorConfig {
            default_timeout,
            max_timeout,
            webhook_retry,
            ..defaults.orchestrator
        };

        let rate_limits = RateLimitSettings {
            free: env.rate_limit("TRAWL_RATE_LIMIT_FREE", defaults.rate_limits.free)?,
            pro: env.rate_limit("TRAWL_RATE_LIMIT_PRO", defaults.rate_limits.pro)?,
            enterprise: env.rate_limit(
                "TRAWL_RATE_LIMIT_ENTERPRISE",
                defaults.rate_limits.enterprise,
            )?,
            domain: env.rate_limit("TRAWL_RATE_LIMIT_DOMAIN", defaults.rate_limits.domain)?,
        };

        let breaker_default = match lookup("TRAWL_BREAKER_DEFAULT") {
            Some(raw) => parse_breaker("TRAWL_BREAKER_DEFAULT", &raw, &defaults.breaker_default)?,
            None => defaults.breaker_default,
        };
        let breakers = match lookup("TRAWL_BREAKERS") {
            Some(raw) => parse_breaker_overrides(&raw, &breaker_default)?,
            None => HashMap::new(),
        };

        Ok(Self {
            pool,
            warm_instances,
            orchestrator,
            rate_limits,
            breaker_default,
            breakers,
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn number<T: FromStr>(&self, key: &str, default: T) -> Result<T, AppError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                AppError::ConfigError(format!("Invalid {key} '{raw}': must be a non-negative integer"))
            }),
        }
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, AppError>
    where
        T: FromStr + PartialEq + Default,
    {
        let value = self.number(key, default)?;
        if value == T::default() {
            return Err(AppError::ConfigError(format!("{key} must be at least 1")));
        }
        Ok(value)
    }

    fn rate_limit(&self, key: &str, default: RateLimitConfig) -> Result<RateLimitConfig, AppError> {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => parse_rate_limit(key, &raw),
        }
    }
}

/// Parse `max_requests/window_seconds[/sliding|fixed]`.
fn parse_rate_limit(key: &str, raw: &str) -> Result<RateLimitConfig, AppError> {
    let invalid = |reason: &str| {
        AppError::ConfigError(format!(
            "Invalid {key} '{raw}': {reason} (expected max_requests/window_seconds[/strategy])"
        ))
    };

    let parts: Vec<&str> = raw.trim().split('/').map(str::trim).collect();
    if !(2..=3).contains(&parts.len()) {
        return Err(invalid("wrong number of fields"));
    }
    let max_requests: u32 = parts[0].parse().map_err(|_| invalid("bad max_requests"))?;
    let window_secs: u64 = parts[1].parse().map_err(|_| invalid("bad window_seconds"))?;
    if window_secs == 0 {
        return Err(invalid("window must be at least 1 second"));
    }
    if window_secs > MAX_WINDOW.as_secs() {
        return Err(invalid(&format!(
            "window must be at most {} seconds",
            MAX_WINDOW.as_secs()
        )));
    }
    let strategy = match parts.get(2) {
        Some(s) => RateLimitStrategy::from_str(s).map_err(|e| invalid(&e))?,
        None => RateLimitStrategy::Sliding,
    };

    Ok(RateLimitConfig::new(max_requests, window_secs).with_strategy(strategy))
}

/// Parse `failures:successes:cooldown_ms`.
fn parse_breaker(
    key: &str,
    raw: &str,
    base: &CircuitBreakerConfig,
) -> Result<CircuitBreakerConfig, AppError> {
    let invalid = || {
        AppError::ConfigError(format!(
            "Invalid {key} '{raw}': expected failures:successes:cooldown_ms"
        ))
    };

    let parts: Vec<&str> = raw.trim().split(':').map(str::trim).collect();
    let [failures, successes, cooldown_ms] = parts.as_slice() else {
        return Err(invalid());
    };
    let failure_threshold: u32 = failures.parse().map_err(|_| invalid())?;
    let success_threshold: u32 = successes.parse().map_err(|_| invalid())?;
    let cooldown_ms: u64 = cooldown_ms.parse().map_err(|_| invalid())?;
    if failure_threshold == 0 || success_threshold == 0 {
        return Err(invalid());
    }

    Ok(CircuitBreakerConfig {
        failure_threshold,
        success_threshold,
        cooldown: Duration::from_millis(cooldown_ms),
        ..base.clone()
    })
}

/// Parse `name=failures:successes:cooldown_ms,...`.
fn parse_breaker_overrides(
    raw: &str,
    base: &CircuitBreakerConfig,
) -> Result<HashMap<String, CircuitBreakerConfig>, AppError> {
    let mut overrides = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, spec) = entry.split_once('=').ok_or_else(|| {
            AppError::ConfigError(format!(
                "Invalid TRAWL_BREAKERS entry '{entry}': expected name=failures:successes:cooldown_ms"
            ))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::ConfigError(format!(
                "Invalid TRAWL_BREAKERS entry '{entry}': empty breaker name"
            )));
        }
        let config = parse_breaker(&format!("TRAWL_BREAKERS[{name}]"), spec, base)?;
        overrides.insert(name.to_string(), config);
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<TrawlConfig, AppError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TrawlConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_when_nothing_set() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.rate_limits, RateLimitSettings::default());
        assert_eq!(config.orchestrator.default_timeout, Duration::from_secs(60));
        assert!(config.breakers.is_empty());
    }

    #[test]
    fn test_reads_pool_and_job_settings() {
        let config = from_pairs(&[
            ("TRAWL_POOL_MAX_INSTANCES", "2"),
            ("TRAWL_POOL_MAX_PAGES_PER_INSTANCE", "1"),
            ("TRAWL_POOL_INSTANCE_IDLE_TTL_SECS", "30"),
            ("TRAWL_POOL_ACQUIRE_TIMEOUT_MS", "1500"),
            ("TRAWL_JOB_DEFAULT_TIMEOUT_MS", "10000"),
            ("TRAWL_WEBHOOK_MAX_ATTEMPTS", "2"),
        ])
        .unwrap();

        assert_eq!(config.pool.max_instances, 2);
        assert_eq!(config.pool.max_pages_per_instance, 1);
        assert_eq!(config.pool.instance_idle_ttl, Duration::from_secs(30));
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(1500));
        assert_eq!(config.orchestrator.default_timeout, Duration::from_secs(10));
        assert_eq!(config.orchestrator.webhook_retry.max_attempts, 2);
    }

    #[test]
    fn test_rate_limit_format() {
        let config = from_pairs(&[
            ("TRAWL_RATE_LIMIT_FREE", "5/60"),
            ("TRAWL_RATE_LIMIT_DOMAIN", "20 / 10 / fixed"),
        ])
        .unwrap();

        assert_eq!(config.rate_limits.for_tier(RateLimitTier::Free), &RateLimitConfig::new(5, 60));
        assert_eq!(config.rate_limits.domain.strategy, RateLimitStrategy::Fixed);
        assert_eq!(config.rate_limits.domain.window, Duration::from_secs(10));

        let err = from_pairs(&[("TRAWL_RATE_LIMIT_PRO", "100")]).unwrap_err();
        assert!(err.to_string().contains("TRAWL_RATE_LIMIT_PRO"));
    }

    #[test]
    fn test_oversized_window_is_rejected() {
        let err = from_pairs(&[("TRAWL_RATE_LIMIT_FREE", "10/10000000000000")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("at most"));

        let max = MAX_WINDOW.as_secs().to_string();
        let config = from_pairs(&[("TRAWL_RATE_LIMIT_FREE", &format!("10/{max}"))]).unwrap();
        assert_eq!(config.rate_limits.free.window, MAX_WINDOW);
    }

    #[test]
    fn test_zero_request_budget_is_allowed() {
        let config = from_pairs(&[("TRAWL_RATE_LIMIT_FREE", "0/60")]).unwrap();
        assert_eq!(config.rate_limits.free.max_requests, 0);
    }

    #[test]
    fn test_breaker_default_and_overrides() {
        let config = from_pairs(&[
            ("TRAWL_BREAKER_DEFAULT", "3:1:1000"),
            ("TRAWL_BREAKERS", "llm=5:2:60000, webhook=2:1:5000"),
        ])
        .unwrap();

        assert_eq!(config.breaker_default.failure_threshold, 3);
        assert_eq!(config.breaker_default.cooldown, Duration::from_secs(1));
        assert_eq!(config.breakers["llm"].cooldown, Duration::from_secs(60));
        assert_eq!(config.breakers["webhook"].failure_threshold, 2);
    }

    #[test]
    fn test_invalid_values_name_the_key() {
        let err = from_pairs(&[("TRAWL_POOL_MAX_INSTANCES", "many")]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(ref m) if m.contains("TRAWL_POOL_MAX_INSTANCES")));

        let err = from_pairs(&[("TRAWL_POOL_MAX_INSTANCES", "0")]).unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let err = from_pairs(&[("TRAWL_BREAKERS", "llm")]).unwrap_err();
        assert!(err.to_string().contains("TRAWL_BREAKERS"));

        let err = from_pairs(&[
            ("TRAWL_JOB_DEFAULT_TIMEOUT_MS", "600000"),
            ("TRAWL_JOB_MAX_TIMEOUT_MS", "1000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }
}
