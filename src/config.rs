//! Limiter configuration with validation and environment overrides.
//!
//! One [`LimiterConfig`] is shared by the coordinator and every client
//! limiter in the cluster. All values are validated up front; a limiter or
//! coordinator is never constructed from an invalid configuration.
//!
//! Environment overrides use the `ALDER_*` prefix and always win over
//! defaults, following the layered precedence used across our services.

use std::time::Duration;

use snafu::Snafu;

/// Tuning parameters for the cluster-wide permit pool.
///
/// Immutable after construction. The same values must be used by the
/// coordinator and all client limiters; the coordinator enforces the global
/// budget, the clients enforce the queue bound and cache target.
#[derive(Debug, Clone)]
pub struct LimiterConfig {
    /// Cluster-wide permit budget (the sum of all concurrent work units).
    pub global_permits: u32,
    /// Desired size of each client's local permit cache.
    pub target_permits_per_client: u32,
    /// Maximum sum of permits requested by queued waiters, per client.
    pub queue_limit: u32,
    /// Coordinator-side threshold after which a silent client is purged and
    /// its permits reclaimed.
    pub idle_client_timeout: Duration,
    /// Client heartbeat period. Must stay below the idle timeout so a live
    /// but quiet client is never purged.
    pub lease_refresh_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            global_permits: 64,
            target_permits_per_client: 8,
            queue_limit: 256,
            idle_client_timeout: Duration::from_secs(60),
            lease_refresh_interval: Duration::from_secs(15),
        }
    }
}

/// Errors from configuration validation or environment loading.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is out of range or unparseable.
    #[snafu(display("invalid value for {key}: {value} ({reason})"))]
    InvalidValue {
        /// The configuration key that failed validation.
        key: String,
        /// The offending value, rendered for the log line.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
}

fn invalid(key: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl LimiterConfig {
    /// Validate all constraints between the fields.
    ///
    /// Called by every constructor that accepts a config; callers building a
    /// config by hand should validate before sharing it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global_permits == 0 {
            return Err(invalid("global_permits", self.global_permits, "must be at least 1"));
        }
        if self.target_permits_per_client == 0 {
            return Err(invalid(
                "target_permits_per_client",
                self.target_permits_per_client,
                "must be at least 1",
            ));
        }
        if self.target_permits_per_client > self.global_permits {
            return Err(invalid(
                "target_permits_per_client",
                self.target_permits_per_client,
                "must not exceed global_permits",
            ));
        }
        if self.idle_client_timeout.is_zero() {
            return Err(invalid(
                "idle_client_timeout",
                format!("{:?}", self.idle_client_timeout),
                "must be positive",
            ));
        }
        if self.lease_refresh_interval.is_zero() {
            return Err(invalid(
                "lease_refresh_interval",
                format!("{:?}", self.lease_refresh_interval),
                "must be positive",
            ));
        }
        if self.lease_refresh_interval >= self.idle_client_timeout {
            return Err(invalid(
                "lease_refresh_interval",
                format!("{:?}", self.lease_refresh_interval),
                "must be shorter than idle_client_timeout",
            ));
        }
        Ok(())
    }

    /// Load configuration from environment variables on top of defaults.
    ///
    /// Recognized variables: `ALDER_GLOBAL_PERMITS`,
    /// `ALDER_TARGET_PERMITS_PER_CLIENT`, `ALDER_QUEUE_LIMIT`,
    /// `ALDER_IDLE_CLIENT_TIMEOUT_MS`, `ALDER_LEASE_REFRESH_INTERVAL_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to an existing configuration.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_u32("ALDER_GLOBAL_PERMITS")? {
            self.global_permits = v;
        }
        if let Some(v) = env_u32("ALDER_TARGET_PERMITS_PER_CLIENT")? {
            self.target_permits_per_client = v;
        }
        if let Some(v) = env_u32("ALDER_QUEUE_LIMIT")? {
            self.queue_limit = v;
        }
        if let Some(v) = env_u64("ALDER_IDLE_CLIENT_TIMEOUT_MS")? {
            self.idle_client_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_u64("ALDER_LEASE_REFRESH_INTERVAL_MS")? {
            self.lease_refresh_interval = Duration::from_millis(v);
        }
        Ok(())
    }
}

fn env_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &format!("not a valid u32: {e}"))),
        Err(_) => Ok(None),
    }
}

fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| invalid(key, &raw, &format!("not a valid u64: {e}"))),
        Err(_) => Ok(None),
    }
}
