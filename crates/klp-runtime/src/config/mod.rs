//! Live patching configuration
//!
//! Compile-time defaults in [`defaults`] with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use klp_runtime::config::LivepatchConfig;
//!
//! let config = LivepatchConfig::from_env()
//!     .signals_interval(5)
//!     .require_reliable_stack(true);
//! ```

pub mod defaults;

use std::time::Duration;

use klp_core::env::{env_get, env_get_bool};

/// Engine configuration with builder pattern
#[derive(Debug, Clone)]
pub struct LivepatchConfig {
    /// Notify blocking tasks every N failed completion attempts (0 = never)
    pub signals_interval: u32,
    /// log2 of shadow variable hash buckets
    pub shadow_hash_bits: u32,
    /// Request companion modules of loaded targets after enabling a patch
    pub request_companions: bool,
    /// Refuse patches without reliable stack traces instead of warning
    pub require_reliable_stack: bool,
    /// Sleep between completion attempts in [`wait_for_transition`]
    ///
    /// [`wait_for_transition`]: crate::Livepatch::wait_for_transition
    pub poll_interval: Duration,
}

impl Default for LivepatchConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LivepatchConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `KLP_SIGNALS_INTERVAL`
    /// - `KLP_SHADOW_HASH_BITS`
    /// - `KLP_REQUEST_COMPANIONS` (boolean)
    /// - `KLP_REQUIRE_RELIABLE_STACK` (boolean)
    /// - `KLP_POLL_INTERVAL_MS`
    pub fn from_env() -> Self {
        Self {
            signals_interval: env_get("KLP_SIGNALS_INTERVAL", defaults::SIGNALS_INTERVAL),
            shadow_hash_bits: env_get("KLP_SHADOW_HASH_BITS", defaults::SHADOW_HASH_BITS),
            request_companions: env_get_bool(
                "KLP_REQUEST_COMPANIONS",
                defaults::REQUEST_COMPANIONS,
            ),
            require_reliable_stack: env_get_bool(
                "KLP_REQUIRE_RELIABLE_STACK",
                defaults::REQUIRE_RELIABLE_STACK,
            ),
            poll_interval: Duration::from_millis(env_get(
                "KLP_POLL_INTERVAL_MS",
                defaults::POLL_INTERVAL_MS,
            )),
        }
    }

    /// Defaults only, no environment lookups
    pub fn new() -> Self {
        Self {
            signals_interval: defaults::SIGNALS_INTERVAL,
            shadow_hash_bits: defaults::SHADOW_HASH_BITS,
            request_companions: defaults::REQUEST_COMPANIONS,
            require_reliable_stack: defaults::REQUIRE_RELIABLE_STACK,
            poll_interval: Duration::from_millis(defaults::POLL_INTERVAL_MS),
        }
    }

    // Builder methods

    pub fn signals_interval(mut self, n: u32) -> Self {
        self.signals_interval = n;
        self
    }

    pub fn shadow_hash_bits(mut self, bits: u32) -> Self {
        self.shadow_hash_bits = bits;
        self
    }

    pub fn request_companions(mut self, enable: bool) -> Self {
        self.request_companions = enable;
        self
    }

    pub fn require_reliable_stack(mut self, enable: bool) -> Self {
        self.require_reliable_stack = enable;
        self
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shadow_hash_bits == 0 || self.shadow_hash_bits > 20 {
            return Err(ConfigError::InvalidValue("shadow_hash_bits must be in 1..=20"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LivepatchConfig::new();
        assert_eq!(config.signals_interval, 15);
        assert_eq!(config.shadow_hash_bits, 12);
        assert!(config.request_companions);
        assert!(!config.require_reliable_stack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("KLP_SIGNALS_INTERVAL", "3");
        let config = LivepatchConfig::from_env();
        std::env::remove_var("KLP_SIGNALS_INTERVAL");
        assert_eq!(config.signals_interval, 3);
    }

    #[test]
    fn test_builder_and_validation() {
        let config = LivepatchConfig::new()
            .signals_interval(1)
            .request_companions(false)
            .poll_interval(Duration::from_millis(1));
        assert_eq!(config.signals_interval, 1);
        assert!(!config.request_companions);
        assert_eq!(config.poll_interval, Duration::from_millis(1));

        assert!(LivepatchConfig::new().shadow_hash_bits(0).validate().is_err());
        assert!(LivepatchConfig::new().shadow_hash_bits(32).validate().is_err());
    }
}
