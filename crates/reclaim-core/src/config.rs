//! Configuration surface: TOML file, environment overrides, validation.
//!
//! Load order: defaults → `reclaim.toml` → `RECLAIM_*` environment variables → validate.
//! Credentials are never read from the file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::app::lease_reporter::HeartbeatSettings;
use crate::app::orchestrator::OrchestratorSettings;
use crate::app::reaper::ReaperSettings;
use crate::app::registry::KeySpace;
use crate::domain::{MachineConfig, StopConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Registry connection settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct RegistryConfig {
    /// Connection string, e.g. `redis://localhost:6379`. `None` selects the in-memory store.
    pub url: Option<String>,
}

/// Provisioner identity.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ProvisionerConfig {
    pub app_name: Option<String>,
    pub image: Option<String>,
    /// Loaded from the environment only.
    #[serde(skip)]
    pub api_token: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "snake_case")]
pub struct ReclaimConfig {
    pub heartbeat_ttl_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub status_ttl_seconds: u64,
    pub reaper_interval_seconds: u64,
    pub stop_config_timeout_seconds: u64,
    pub max_turn_timeout_seconds: u64,
    pub mapping_grace_seconds: u64,
    pub idle_stop_timeout_seconds: u64,
    /// Issue `destroy` after `stop` instead of relying on auto-destroy.
    pub explicit_destroy: bool,
    pub key_prefix: String,
    pub registry: RegistryConfig,
    pub provisioner: ProvisionerConfig,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_seconds: 30,
            heartbeat_interval_seconds: 10,
            status_ttl_seconds: 3600,
            reaper_interval_seconds: 30,
            stop_config_timeout_seconds: 10,
            max_turn_timeout_seconds: 600,
            mapping_grace_seconds: 60,
            idle_stop_timeout_seconds: 300,
            explicit_destroy: false,
            key_prefix: KeySpace::DEFAULT_PREFIX.to_string(),
            registry: RegistryConfig::default(),
            provisioner: ProvisionerConfig::default(),
        }
    }
}

impl ReclaimConfig {
    /// Parse TOML and validate. Environment is not consulted.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Full load: optional file, then process environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RECLAIM_*` overrides using `lookup` to read variables.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let seconds = [
            ("RECLAIM_HEARTBEAT_TTL_SECONDS", &mut self.heartbeat_ttl_seconds),
            ("RECLAIM_HEARTBEAT_INTERVAL_SECONDS", &mut self.heartbeat_interval_seconds),
            ("RECLAIM_STATUS_TTL_SECONDS", &mut self.status_ttl_seconds),
            ("RECLAIM_REAPER_INTERVAL_SECONDS", &mut self.reaper_interval_seconds),
            ("RECLAIM_STOP_CONFIG_TIMEOUT_SECONDS", &mut self.stop_config_timeout_seconds),
            ("RECLAIM_MAX_TURN_TIMEOUT_SECONDS", &mut self.max_turn_timeout_seconds),
            ("RECLAIM_MAPPING_GRACE_SECONDS", &mut self.mapping_grace_seconds),
            ("RECLAIM_IDLE_STOP_TIMEOUT_SECONDS", &mut self.idle_stop_timeout_seconds),
        ];
        for (var, slot) in seconds {
            if let Some(value) = lookup(var) {
                *slot = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: var.to_string(),
                    value,
                })?;
            }
        }

        if let Some(value) = lookup("RECLAIM_EXPLICIT_DESTROY") {
            self.explicit_destroy = match value.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "RECLAIM_EXPLICIT_DESTROY".to_string(),
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("RECLAIM_KEY_PREFIX") {
            self.key_prefix = value;
        }
        if let Some(value) = lookup("RECLAIM_REGISTRY_URL") {
            self.registry.url = Some(value);
        }
        if let Some(value) = lookup("RECLAIM_PROVISIONER_APP") {
            self.provisioner.app_name = Some(value);
        }
        self.provisioner.api_token =
            lookup("RECLAIM_PROVISIONER_API_TOKEN").or_else(|| lookup("FLY_API_TOKEN"));
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("heartbeat_ttl_seconds", self.heartbeat_ttl_seconds),
            ("heartbeat_interval_seconds", self.heartbeat_interval_seconds),
            ("status_ttl_seconds", self.status_ttl_seconds),
            ("reaper_interval_seconds", self.reaper_interval_seconds),
            ("max_turn_timeout_seconds", self.max_turn_timeout_seconds),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        // A single missed tick must not expire the lease.
        if self.heartbeat_ttl_seconds <= self.heartbeat_interval_seconds {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_ttl_seconds ({}) must be greater than heartbeat_interval_seconds ({})",
                self.heartbeat_ttl_seconds, self.heartbeat_interval_seconds
            )));
        }
        if self.status_ttl_seconds < self.reaper_interval_seconds {
            return Err(ConfigError::Invalid(format!(
                "status_ttl_seconds ({}) must cover at least one reaper_interval_seconds ({})",
                self.status_ttl_seconds, self.reaper_interval_seconds
            )));
        }
        if self.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("key_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    pub fn max_turn_timeout(&self) -> Duration {
        Duration::from_secs(self.max_turn_timeout_seconds)
    }

    /// TTL of the session→resource mapping.
    pub fn mapping_ttl(&self) -> Duration {
        Duration::from_secs(self.max_turn_timeout_seconds + self.mapping_grace_seconds)
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(self.key_prefix.clone())
    }

    pub fn heartbeat_settings(&self) -> HeartbeatSettings {
        HeartbeatSettings {
            interval: self.heartbeat_interval(),
            ttl: self.heartbeat_ttl(),
            status_ttl: self.status_ttl(),
        }
    }

    pub fn reaper_settings(&self) -> ReaperSettings {
        ReaperSettings {
            interval: self.reaper_interval(),
            heartbeat_ttl: self.heartbeat_ttl(),
            max_turn_timeout: self.max_turn_timeout(),
            explicit_destroy: self.explicit_destroy,
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        let mut config = MachineConfig {
            image: self.provisioner.image.clone(),
            auto_destroy: !self.explicit_destroy,
            idle_stop_timeout: Duration::from_secs(self.idle_stop_timeout_seconds),
            stop: StopConfig {
                timeout: Duration::from_secs(self.stop_config_timeout_seconds),
                ..StopConfig::default()
            },
            ..MachineConfig::default()
        };
        config.env.insert(
            "RECLAIM_HEARTBEAT_INTERVAL_SECONDS".to_string(),
            self.heartbeat_interval_seconds.to_string(),
        );
        config.env.insert(
            "RECLAIM_HEARTBEAT_TTL_SECONDS".to_string(),
            self.heartbeat_ttl_seconds.to_string(),
        );
        config
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            mapping_ttl: self.mapping_ttl(),
            machine: self.machine_config(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ReclaimConfig::default();
        config.validate().unwrap();
        assert_eq!(config.heartbeat_ttl(), Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.mapping_ttl(), Duration::from_secs(660));
        assert_eq!(config.key_space().prefix(), "agent:");
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = ReclaimConfig::from_toml_str(
            r#"
            max_turn_timeout_seconds = 120
            explicit_destroy = true

            [registry]
            url = "redis://cache:6379"

            [provisioner]
            app_name = "agents"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_turn_timeout(), Duration::from_secs(120));
        assert_eq!(config.heartbeat_ttl_seconds, 30);
        assert_eq!(config.registry.url.as_deref(), Some("redis://cache:6379"));
        assert!(!config.machine_config().auto_destroy);
        assert!(config.reaper_settings().explicit_destroy);
        assert_eq!(
            config.reaper_settings().heartbeat_ttl,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn ttl_must_exceed_interval() {
        let err = ReclaimConfig::from_toml_str(
            "heartbeat_ttl_seconds = 10\nheartbeat_interval_seconds = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("heartbeat_ttl_seconds"));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ReclaimConfig::from_toml_str("reaper_interval_seconds = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("reaper_interval_seconds")));
    }

    #[test]
    fn env_overrides_file_and_loads_token() {
        let mut config = ReclaimConfig::default();
        config
            .apply_env(env(&[
                ("RECLAIM_REAPER_INTERVAL_SECONDS", "5"),
                ("RECLAIM_EXPLICIT_DESTROY", "true"),
                ("FLY_API_TOKEN", "secret"),
            ]))
            .unwrap();
        assert_eq!(config.reaper_interval(), Duration::from_secs(5));
        assert!(config.explicit_destroy);
        assert_eq!(config.provisioner.api_token.as_deref(), Some("secret"));
    }

    #[test]
    fn malformed_env_value_is_reported() {
        let mut config = ReclaimConfig::default();
        let err = config
            .apply_env(env(&[("RECLAIM_HEARTBEAT_TTL_SECONDS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { var, .. } if var == "RECLAIM_HEARTBEAT_TTL_SECONDS"));
    }

    #[test]
    fn machine_config_carries_stop_timeout() {
        let config = ReclaimConfig {
            stop_config_timeout_seconds: 45,
            ..ReclaimConfig::default()
        };
        let machine = config.machine_config();
        assert_eq!(machine.stop.timeout, Duration::from_secs(45));
        assert!(machine.auto_destroy);
        assert_eq!(
            machine.env.get("RECLAIM_HEARTBEAT_TTL_SECONDS").map(String::as_str),
            Some("30")
        );
    }
}
