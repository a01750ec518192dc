// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service engine configuration.
//!
//! Supports programmatic, file-based (TOML) and environment configuration:
//!
//! ```toml
//! identity_slots = "both"
//! slow_handler_warn_ms = 250
//!
//! [request_qos]
//! reliability = "reliable"
//! history = "keep_all"
//!
//! [reply_qos]
//! reliability = "reliable"
//! history = { keep_last = 100 }
//! ```
//!
//! ## Environment overrides
//! - `ROS2_SERVICES_IDENTITY_SLOTS`: `legacy`, `standard` or `both`
//! - `ROS2_SERVICES_SLOW_HANDLER_MS`: handler warning threshold (0 disables)

use crate::error::ServiceError;
use crate::identity::IdentitySlots;
use crate::qos::{History, QosProfile};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const ENV_IDENTITY_SLOTS: &str = "ROS2_SERVICES_IDENTITY_SLOTS";
pub const ENV_SLOW_HANDLER_MS: &str = "ROS2_SERVICES_SLOW_HANDLER_MS";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for ServiceError {
    fn from(e: ConfigError) -> Self {
        ServiceError::Config(e.to_string())
    }
}

/// Settings shared by client and server engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Metadata slot(s) a client writes its request identity into.
    #[serde(default)]
    pub identity_slots: IdentitySlots,

    /// QoS of the request channel.
    #[serde(default = "QosProfile::rpc")]
    pub request_qos: QosProfile,

    /// QoS of the reply channel.
    #[serde(default = "QosProfile::rpc")]
    pub reply_qos: QosProfile,

    /// Handler executions slower than this are logged as warnings (0 disables).
    #[serde(default = "default_slow_handler_warn_ms")]
    pub slow_handler_warn_ms: u64,
}

fn default_slow_handler_warn_ms() -> u64 {
    1_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            identity_slots: IdentitySlots::default(),
            request_qos: QosProfile::rpc(),
            reply_qos: QosProfile::rpc(),
            slow_handler_warn_ms: default_slow_handler_warn_ms(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    #[must_use]
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn apply_env_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_IDENTITY_SLOTS).filter(|s| !s.is_empty()) {
            match value.parse::<IdentitySlots>() {
                Ok(slots) => self.identity_slots = slots,
                Err(e) => log::warn!("ignoring {}: {}", ENV_IDENTITY_SLOTS, e),
            }
        }

        if let Some(value) = lookup(ENV_SLOW_HANDLER_MS).filter(|s| !s.is_empty()) {
            match value.trim().parse::<u64>() {
                Ok(ms) => self.slow_handler_warn_ms = ms,
                Err(e) => log::warn!("ignoring {}='{}': {}", ENV_SLOW_HANDLER_MS, value, e),
            }
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, qos) in [("request_qos", &self.request_qos), ("reply_qos", &self.reply_qos)] {
            if qos.history == History::KeepLast(0) {
                return Err(ConfigError::Invalid(format!(
                    "{} history depth must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Slow handler threshold, `None` when disabled.
    pub fn slow_handler_threshold(&self) -> Option<Duration> {
        (self.slow_handler_warn_ms > 0).then(|| Duration::from_millis(self.slow_handler_warn_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::Reliability;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.identity_slots, IdentitySlots::Legacy);
        assert_eq!(config.request_qos, QosProfile::rpc());
        assert_eq!(
            config.slow_handler_threshold(),
            Some(Duration::from_secs(1))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_toml() {
        let config = ServiceConfig::from_toml_str(
            r#"
identity_slots = "both"
slow_handler_warn_ms = 0

[reply_qos]
reliability = "best_effort"
history = { keep_last = 8 }
"#,
        )
        .unwrap();

        assert_eq!(config.identity_slots, IdentitySlots::Both);
        assert_eq!(config.slow_handler_threshold(), None);
        assert_eq!(config.reply_qos.reliability, Reliability::BestEffort);
        assert_eq!(config.reply_qos.history, History::KeepLast(8));
        assert_eq!(config.request_qos, QosProfile::rpc());
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(
            ServiceConfig::from_toml_str("").unwrap(),
            ServiceConfig::default()
        );
    }

    #[test]
    fn reject_zero_depth() {
        let err = ServiceConfig::from_toml_str(
            r#"
[request_qos]
history = { keep_last = 0 }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn reject_unknown_slots() {
        let err = ServiceConfig::from_toml_str(r#"identity_slots = "sideband""#).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "identity_slots = \"standard\"").unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.identity_slots, IdentitySlots::Standard);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ServiceConfig::from_file("/nonexistent/ros2-services.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_IDENTITY_SLOTS, "both"),
            (ENV_SLOW_HANDLER_MS, "50"),
        ]
        .into_iter()
        .collect();

        let config = ServiceConfig::default()
            .apply_env_from(|key| env.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.identity_slots, IdentitySlots::Both);
        assert_eq!(config.slow_handler_warn_ms, 50);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let config = ServiceConfig::default().apply_env_from(|key| match key {
            ENV_IDENTITY_SLOTS => Some("nope".to_string()),
            ENV_SLOW_HANDLER_MS => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config, ServiceConfig::default());
    }
}
