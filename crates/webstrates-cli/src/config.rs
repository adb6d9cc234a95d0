//! CLI configuration.

use anyhow::{Context, Result};
use std::time::Duration;
use webstrates_client::{parse_ws_url, ConnectionOptions};

/// CLI configuration.
#[derive(Debug, Clone)]
pub struct CliConfig {
    /// WebSocket endpoint of the Webstrates server
    pub url: String,

    /// Keep-alive interval
    pub keep_alive: Duration,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:7007/ws/".to_string(),
            keep_alive: Duration::from_secs(10),
        }
    }
}

impl CliConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WEBSTRATES_URL`: WebSocket URL of the server
    /// - `WEBSTRATES_KEEP_ALIVE_MS`: Keep-alive interval in milliseconds
    ///
    /// # Errors
    ///
    /// Returns error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("WEBSTRATES_URL") {
            parse_ws_url(&url).context("Invalid WEBSTRATES_URL")?;
            config.url = url;
        }

        if let Some(millis) = lookup("WEBSTRATES_KEEP_ALIVE_MS") {
            let millis: u64 = millis
                .parse()
                .context("Invalid WEBSTRATES_KEEP_ALIVE_MS")?;
            config.keep_alive = Duration::from_millis(millis);
        }

        Ok(config)
    }

    /// Connection options; documents are opened without auto-connect so
    /// handlers can be registered first.
    #[must_use]
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            keep_alive_timeout: self.keep_alive,
            auto_connect: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<CliConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        CliConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert_eq!(config.url, "ws://localhost:7007/ws/");
        assert_eq!(config.keep_alive, Duration::from_secs(10));
        assert!(!config.connection_options().auto_connect);
    }

    #[test]
    fn overrides_from_environment() {
        let config = load(&[
            ("WEBSTRATES_URL", "wss://webstrates.example.org/ws/"),
            ("WEBSTRATES_KEEP_ALIVE_MS", "250"),
        ])
        .unwrap();
        assert_eq!(config.url, "wss://webstrates.example.org/ws/");
        assert_eq!(
            config.connection_options().keep_alive_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load(&[("WEBSTRATES_URL", "http://localhost:7007")]).unwrap_err();
        assert!(err.to_string().contains("WEBSTRATES_URL"));

        let err = load(&[("WEBSTRATES_KEEP_ALIVE_MS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("WEBSTRATES_KEEP_ALIVE_MS"));
    }
}
