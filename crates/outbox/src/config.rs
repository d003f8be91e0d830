//! Dispatcher configuration.
//!
//! Every knob has a default; `from_env` overrides them from `OUTBOX_*`
//! variables. Durations are given in whole seconds except the poll interval,
//! which is in milliseconds.

use std::time::Duration;

use thiserror::Error;

use crate::backoff::RetryPolicy;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid {expected}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Worker tasks per process (W).
    pub worker_count: usize,
    /// Rows claimed per poll (B).
    pub claim_batch: usize,
    /// Lease on claimed rows (L). Renewed every L/2 while a batch runs.
    pub lease: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Global bound on concurrent webhook requests (C_http).
    pub http_concurrency: usize,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_deadline: Duration,
    /// IN_FLIGHT deliveries untouched for this long are considered abandoned.
    pub inflight_expiry: Duration,
    pub registry_refresh: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            claim_batch: 50,
            lease: Duration::from_secs(60),
            poll_min: Duration::from_millis(200),
            poll_max: Duration::from_secs(2),
            max_attempts: 10,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(3600),
            http_concurrency: 32,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            shutdown_deadline: Duration::from_secs(30),
            inflight_expiry: Duration::from_secs(600),
            registry_refresh: Duration::from_secs(60),
        }
    }
}

impl DispatcherConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`; missing keys keep their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let env = Lookup(&lookup);

        env.usize("OUTBOX_WORKER_COUNT", &mut cfg.worker_count)?;
        env.usize("OUTBOX_CLAIM_BATCH", &mut cfg.claim_batch)?;
        env.secs("OUTBOX_LEASE_SECS", &mut cfg.lease)?;
        env.millis("OUTBOX_POLL_MIN_MS", &mut cfg.poll_min)?;
        env.millis("OUTBOX_POLL_MAX_MS", &mut cfg.poll_max)?;
        env.u32("OUTBOX_MAX_ATTEMPTS", &mut cfg.max_attempts)?;
        env.secs("OUTBOX_BACKOFF_BASE_SECS", &mut cfg.backoff_base)?;
        env.secs("OUTBOX_BACKOFF_CAP_SECS", &mut cfg.backoff_cap)?;
        env.usize("OUTBOX_HTTP_CONCURRENCY", &mut cfg.http_concurrency)?;
        env.secs("OUTBOX_CONNECT_TIMEOUT_SECS", &mut cfg.connect_timeout)?;
        env.secs("OUTBOX_REQUEST_TIMEOUT_SECS", &mut cfg.request_timeout)?;
        env.secs("OUTBOX_SHUTDOWN_DEADLINE_SECS", &mut cfg.shutdown_deadline)?;
        env.secs("OUTBOX_INFLIGHT_EXPIRY_SECS", &mut cfg.inflight_expiry)?;
        env.secs("OUTBOX_REGISTRY_REFRESH_SECS", &mut cfg.registry_refresh)?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |what: &str| Err(ConfigError::Inconsistent(format!("{what} must be greater than zero")));

        if self.worker_count == 0 {
            return zero("worker_count");
        }
        if self.claim_batch == 0 {
            return zero("claim_batch");
        }
        if self.http_concurrency == 0 {
            return zero("http_concurrency");
        }
        if self.max_attempts == 0 {
            return zero("max_attempts");
        }
        if self.lease.is_zero() {
            return zero("lease");
        }
        if self.registry_refresh.is_zero() {
            return zero("registry_refresh");
        }
        if self.poll_min > self.poll_max {
            return Err(ConfigError::Inconsistent(format!(
                "poll interval min {:?} exceeds max {:?}",
                self.poll_min, self.poll_max
            )));
        }
        if self.backoff_base > self.backoff_cap {
            return Err(ConfigError::Inconsistent(format!(
                "backoff base {:?} exceeds cap {:?}",
                self.backoff_base, self.backoff_cap
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_base, self.backoff_cap)
    }

    /// Connection pool size for the dispatcher process: every worker may
    /// hold a claim transaction plus its advisory-lock session.
    pub fn pool_size(&self) -> u32 {
        let wanted = self.worker_count.saturating_mul(2).saturating_add(2).max(4);
        u32::try_from(wanted).unwrap_or(u32::MAX)
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(&self, key: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError> {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                key,
                value: raw,
                expected,
            }),
        }
    }

    fn usize(&self, key: &'static str, slot: &mut usize) -> Result<(), ConfigError> {
        if let Some(v) = self.parse(key, "non-negative integer")? {
            *slot = v;
        }
        Ok(())
    }

    fn u32(&self, key: &'static str, slot: &mut u32) -> Result<(), ConfigError> {
        if let Some(v) = self.parse(key, "non-negative integer")? {
            *slot = v;
        }
        Ok(())
    }

    fn secs(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(v) = self.parse::<u64>(key, "number of seconds")? {
            *slot = Duration::from_secs(v);
        }
        Ok(())
    }

    fn millis(&self, key: &'static str, slot: &mut Duration) -> Result<(), ConfigError> {
        if let Some(v) = self.parse::<u64>(key, "number of milliseconds")? {
            *slot = Duration::from_millis(v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = DispatcherConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, DispatcherConfig::default());
        assert_eq!(cfg.pool_size(), 10);
        assert_eq!(cfg.max_attempts, 10);
        assert_eq!(cfg.backoff_cap, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = DispatcherConfig::from_lookup(lookup(&[
            ("OUTBOX_WORKER_COUNT", "1"),
            ("OUTBOX_POLL_MIN_MS", "10"),
            ("OUTBOX_POLL_MAX_MS", "50"),
            ("OUTBOX_LEASE_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.poll_min, Duration::from_millis(10));
        assert_eq!(cfg.lease, Duration::from_secs(5));
        assert_eq!(cfg.pool_size(), 4);
    }

    #[test]
    fn garbage_values_name_the_key() {
        let err = DispatcherConfig::from_lookup(lookup(&[("OUTBOX_CLAIM_BATCH", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_CLAIM_BATCH", .. }));
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let err = DispatcherConfig::from_lookup(lookup(&[("OUTBOX_POLL_MIN_MS", "5000")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = DispatcherConfig::from_lookup(lookup(&[("OUTBOX_BACKOFF_BASE_SECS", "7200")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));

        let err = DispatcherConfig::from_lookup(lookup(&[("OUTBOX_WORKER_COUNT", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
