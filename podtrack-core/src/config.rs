use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub spotify: SpotifyConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Polling interval in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How many episodes to report in the recently-played listing
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

const fn default_poll_interval() -> u64 {
    10_000
}

const fn default_history_limit() -> usize {
    20
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            history_limit: default_history_limit(),
        }
    }
}

/// Template written on first run
pub const CONFIG_TEMPLATE: &str = r#"[spotify]
# Get these from https://developer.spotify.com/dashboard
client_id = ""
client_secret = ""

[tracking]
# How often to poll the currently-playing endpoint, in milliseconds.
# Keep this short relative to episode lengths: the worst-case attribution
# error around a playback transition is one interval.
poll_interval_ms = 10000
# How many episodes to report in the recently-played listing
history_limit = 20
"#;

impl Config {
    /// Get the configuration directory path (~/.config/podtrack/)
    #[must_use]
    pub fn config_dir() -> PathBuf {
        crate::paths::config_dir()
    }

    /// Get the config file path (~/.config/podtrack/config.toml)
    #[must_use]
    pub fn config_path() -> PathBuf {
        crate::paths::config_path()
    }

    /// Load config from file or create template on first run
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read, parsed, or if required fields are missing.
    pub fn load_or_create() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            // Create config directory if it doesn't exist
            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)?;
            }

            // Write template config
            fs::write(&config_path, CONFIG_TEMPLATE)?;

            return Err(CoreError::ConfigNotFound { path: config_path });
        }

        let content = fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate required fields
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or empty.
    pub fn validate(&self) -> Result<()> {
        if self.spotify.client_id.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "spotify.client_id".to_string(),
            });
        }
        if self.spotify.client_secret.is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "spotify.client_secret".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parses_but_fails_validation() {
        let config: Config = match toml::from_str(CONFIG_TEMPLATE) {
            Ok(c) => c,
            Err(e) => unreachable!("template must parse: {e}"),
        };
        assert!(matches!(
            config.validate(),
            Err(CoreError::ConfigMissingField { .. })
        ));
    }

    #[test]
    fn test_tracking_defaults() {
        let config: Config = match toml::from_str(
            r#"
            [spotify]
            client_id = "id"
            client_secret = "secret"
            "#,
        ) {
            Ok(c) => c,
            Err(e) => unreachable!("config must parse: {e}"),
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.tracking.poll_interval_ms, 10_000);
        assert_eq!(config.tracking.history_limit, 20);
    }
}
