//! Engine configuration.

use crate::error::{Result, VmError};

/// Environment variable enabling verbose route logging.
pub const ENV_DEBUG_MODE: &str = "RINGVM_DEBUG_MODE";
/// Environment variable overriding [`EngineConfig::max_chains_per_package`].
pub const ENV_MAX_CHAINS_PER_PACKAGE: &str = "RINGVM_MAX_CHAINS_PER_PACKAGE";
/// Environment variable overriding [`EngineConfig::max_in_flight_packages`].
pub const ENV_MAX_IN_FLIGHT_PACKAGES: &str = "RINGVM_MAX_IN_FLIGHT_PACKAGES";

/// Default number of cluster instruction pushes between key flushes.
pub const DEFAULT_KEY_FLUSH_INTERVAL: u64 = 65536;

/// Configuration for the engine, its scheduler and its message bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Most ready chains batched into one package.
    pub max_chains_per_package: usize,
    /// Most packages launched but not yet completed, per stream.
    pub max_in_flight_packages: usize,
    /// Capacity of each actor's incoming register queue.
    pub actor_queue_capacity: usize,
    /// Capacity of each bus endpoint.
    pub bus_max_pending: usize,
    /// Cluster instruction pushes between obsolete key flushes.
    pub key_flush_interval: u64,
    /// Log scheduler and actor routing at debug level.
    pub debug_mode: bool,
    /// Reject cross-stream access without a preceding soft sync.
    pub strict_soft_sync: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chains_per_package: 16,
            max_in_flight_packages: 4,
            actor_queue_capacity: 8,
            bus_max_pending: 1024,
            key_flush_interval: DEFAULT_KEY_FLUSH_INTERVAL,
            debug_mode: false,
            strict_soft_sync: true,
        }
    }
}

impl EngineConfig {
    /// One chain per package, one package in flight.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            max_chains_per_package: 1,
            max_in_flight_packages: 1,
            actor_queue_capacity: 2,
            bus_max_pending: 64,
            ..Self::default()
        }
    }

    /// Large batches and deep pipelines.
    #[must_use]
    pub fn performance() -> Self {
        Self {
            max_chains_per_package: 64,
            max_in_flight_packages: 16,
            actor_queue_capacity: 32,
            bus_max_pending: 8192,
            ..Self::default()
        }
    }

    /// Defaults with `RINGVM_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_DEBUG_MODE) {
            self.debug_mode = parse_flag(&value);
        }
        if let Some(value) = lookup(ENV_MAX_CHAINS_PER_PACKAGE) {
            self.max_chains_per_package = parse_count(ENV_MAX_CHAINS_PER_PACKAGE, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_IN_FLIGHT_PACKAGES) {
            self.max_in_flight_packages = parse_count(ENV_MAX_IN_FLIGHT_PACKAGES, &value)?;
        }
        self.validate()
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> Result<()> {
        let limits = [
            ("max_chains_per_package", self.max_chains_per_package as u64),
            ("max_in_flight_packages", self.max_in_flight_packages as u64),
            ("actor_queue_capacity", self.actor_queue_capacity as u64),
            ("bus_max_pending", self.bus_max_pending as u64),
            ("key_flush_interval", self.key_flush_interval),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(VmError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_count(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| VmError::InvalidConfig(format!("{}={:?} is not a count", name, value)))
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Builder starting from the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder starting from [`EngineConfig::minimal`].
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            config: EngineConfig::minimal(),
        }
    }

    /// Builder starting from [`EngineConfig::performance`].
    #[must_use]
    pub fn performance() -> Self {
        Self {
            config: EngineConfig::performance(),
        }
    }

    /// Sets the package batch size.
    #[must_use]
    pub fn with_max_chains_per_package(mut self, count: usize) -> Self {
        self.config.max_chains_per_package = count;
        self
    }

    /// Sets the per-stream in-flight package limit.
    #[must_use]
    pub fn with_max_in_flight_packages(mut self, count: usize) -> Self {
        self.config.max_in_flight_packages = count;
        self
    }

    /// Sets the actor incoming queue capacity.
    #[must_use]
    pub fn with_actor_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.actor_queue_capacity = capacity;
        self
    }

    /// Sets the bus endpoint capacity.
    #[must_use]
    pub fn with_bus_max_pending(mut self, capacity: usize) -> Self {
        self.config.bus_max_pending = capacity;
        self
    }

    /// Sets the obsolete key flush interval.
    #[must_use]
    pub fn with_key_flush_interval(mut self, interval: u64) -> Self {
        self.config.key_flush_interval = interval;
        self
    }

    /// Enables debug route logging.
    #[must_use]
    pub fn with_debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    /// Enables or disables soft sync enforcement.
    #[must_use]
    pub fn with_strict_soft_sync(mut self, enabled: bool) -> Self {
        self.config.strict_soft_sync = enabled;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.key_flush_interval, 65536);
        assert!(config.strict_soft_sync);
        assert!(!config.debug_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets() {
        let minimal = EngineConfig::minimal();
        assert_eq!(minimal.max_chains_per_package, 1);
        assert_eq!(minimal.max_in_flight_packages, 1);

        let perf = EngineConfig::performance();
        assert!(perf.max_chains_per_package > EngineConfig::default().max_chains_per_package);
    }

    #[test]
    fn test_builder_rejects_zero() {
        let err = EngineConfigBuilder::new()
            .with_actor_queue_capacity(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(msg) if msg.contains("actor_queue_capacity")));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfigBuilder::minimal()
            .with_max_chains_per_package(4)
            .with_debug_mode(true)
            .with_strict_soft_sync(false)
            .build()
            .unwrap();
        assert_eq!(config.max_chains_per_package, 4);
        assert_eq!(config.max_in_flight_packages, 1);
        assert!(config.debug_mode);
        assert!(!config.strict_soft_sync);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DEBUG_MODE, "true"),
            (ENV_MAX_CHAINS_PER_PACKAGE, "3"),
        ]
        .into_iter()
        .collect();
        let mut config = EngineConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert!(config.debug_mode);
        assert_eq!(config.max_chains_per_package, 3);

        let mut bad = EngineConfig::default();
        let err = bad
            .apply_env(|key| (key == ENV_MAX_IN_FLIGHT_PACKAGES).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, VmError::InvalidConfig(_)));
    }
}
