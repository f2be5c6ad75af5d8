//! Configuration layering: defaults, then an optional TOML file, then the
//! environment. Command-line flags are applied last by the caller.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use buildscope_api::{ApiConfig, DEFAULT_API_URL, PollOptions};
use buildscope_logs::{MAX_DISPLAYED_LOGS, SessionOptions};

/// Environment variable holding the API token
pub const TOKEN_ENV: &str = "VERCEL_TOKEN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub api_url: String,
    pub token: Option<String>,
    /// Seconds between deployment status checks
    pub poll_interval_secs: u64,
    /// Give up waiting for the deployment after this many seconds
    pub wait_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
    pub max_displayed_logs: usize,
    /// Keep the level reported by the server instead of classifying lines
    pub trust_server_levels: bool,
}

impl Default for Config {
    fn default() -> Self {
        let poll = PollOptions::default();
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            token: None,
            poll_interval_secs: poll.interval.as_secs(),
            wait_timeout_secs: poll.timeout.as_secs(),
            reconnect_delay_ms: 1_000,
            max_displayed_logs: MAX_DISPLAYED_LOGS,
            trust_server_levels: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Defaults, overlaid with `path` if given, overlaid with the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::from_toml_file(path)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply environment overrides using `lookup` to read variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_url.clone(),
            token: self.token.clone(),
            ..ApiConfig::default()
        }
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            timeout: Duration::from_secs(self.wait_timeout_secs),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_displayed_logs: self.max_displayed_logs,
            trust_record_level: self.trust_server_levels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_url, "https://api.vercel.com");
        assert_eq!(config.poll_options().interval, Duration::from_secs(3));
        assert_eq!(config.poll_options().timeout, Duration::from_secs(240));
        assert_eq!(config.session_options().max_displayed_logs, 10_000);
        assert_eq!(
            config.session_options().reconnect_delay,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            api_url = "http://localhost:3000"
            max_displayed_logs = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.api_url, "http://localhost:3000");
        assert_eq!(config.max_displayed_logs, 500);
        assert_eq!(config.poll_interval_secs, 3);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("poll_interval = 3").is_err());
    }

    #[test]
    fn test_env_token_overrides_file() {
        let mut config: Config = toml::from_str(r#"token = "from-file""#).unwrap();
        config.apply_env_overrides(|key| (key == TOKEN_ENV).then(|| "from-env".to_string()));
        assert_eq!(config.token.as_deref(), Some("from-env"));

        // an empty variable does not clear the file value
        let mut config: Config = toml::from_str(r#"token = "from-file""#).unwrap();
        config.apply_env_overrides(|_| Some(String::new()));
        assert_eq!(config.token.as_deref(), Some("from-file"));
    }

    #[test]
    fn test_zero_poll_interval_clamped() {
        let config = Config {
            poll_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.poll_options().interval, Duration::from_secs(1));
    }
}
