//! Engine configuration.
//!
//! The host is responsible for semantic validation (is `team_identifier` actually a real
//! Apple team, does `base_url` point at the intended gateway); the engine performs only the
//! shape checks below at construction time, so a malformed config fails fast with a
//! [`EngineError::Configuration`] instead of surfacing later as a confusing wire error.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Log verbosity as consumed by the host's `tracing` subscriber setup. The engine itself
/// only emits `tracing` events; it never installs a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The `tracing::Level` this log level corresponds to.
    #[must_use]
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Configuration consumed by [`crate::AuthSession`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the auth gateway, e.g. `https://auth.example.com`.
    pub base_url: String,
    /// The host app's bundle identifier.
    pub bundle_identifier: String,
    /// The Apple team identifier: exactly 10 alphanumeric characters.
    pub team_identifier: String,
    /// Development token, used only when `AttestationProvider::is_supported()` is `false`.
    #[serde(default)]
    pub development_token: Option<String>,
    /// Suggested verbosity for the host's logging setup.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl EngineConfig {
    /// Validate the shape of this configuration, per §6 of the design: non-empty
    /// `base_url`/`bundle_identifier`, and a 10-character alphanumeric `team_identifier`.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.base_url.trim().is_empty() {
            return Err(EngineError::Configuration("base_url must not be empty".into()));
        }
        if self.bundle_identifier.trim().is_empty() {
            return Err(EngineError::Configuration("bundle_identifier must not be empty".into()));
        }
        if self.team_identifier.len() != 10 || !self.team_identifier.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(EngineError::Configuration(
                "team_identifier must be exactly 10 alphanumeric characters".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> EngineConfig {
        EngineConfig {
            base_url: "https://auth.example.com".into(),
            bundle_identifier: "com.example.app".into(),
            team_identifier: "ABCDE12345".into(),
            development_token: None,
            log_level: LogLevel::Info,
        }
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn rejects_empty_base_url() {
        let mut cfg = base_config();
        cfg.base_url = String::new();
        assert!(matches!(cfg.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn rejects_wrong_length_team_identifier() {
        let mut cfg = base_config();
        cfg.team_identifier = "ABCDE123".into();
        assert!(matches!(cfg.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn rejects_non_alphanumeric_team_identifier() {
        let mut cfg = base_config();
        cfg.team_identifier = "ABCDE-1234".into();
        assert!(matches!(cfg.validate(), Err(EngineError::Configuration(_))));
    }
}
