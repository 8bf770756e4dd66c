//! Configuration from built-in defaults, environment variables and an optional
//! YAML file.
//!
//! Later sources win: defaults, then the environment, then `anonchat.yml`, then
//! whatever the binary's command-line flags set.
//!
//! **Environment variables:**
//! - `PORT`: listen port (default: 3040)
//! - `ANONCHAT_PROXY`: SOCKS proxy URL for upstream traffic (default: none)
//! - `ANONCHAT_BASE_URL`: upstream origin (default: https://chat.openai.com)
//! - `ANONCHAT_UPSTREAM_MODEL`: model slug sent upstream (default: text-davinci-002-render-sha)
//! - `ANONCHAT_RESPONSE_MODEL`: model reported to clients (default: gpt-3.5-turbo)
//! - `ANONCHAT_USER_AGENT`: browser user agent sent upstream
//! - `ANONCHAT_REFRESH_INTERVAL_SECS`: wait after a successful refresh (default: 60)
//! - `ANONCHAT_ERROR_WAIT_SECS`: base wait after a failed refresh (default: 15)
//! - `ANONCHAT_MAX_BACKOFF_FACTOR`: cap on the failure multiplier (default: 8)
//! - `ANONCHAT_RENEW_AFTER_FAILURES`: failures before a new device id (default: 1)
//! - `ANONCHAT_PROOF_OF_WORK`: solve proof-of-work challenges (default: true)
//! - `ANONCHAT_BACKGROUND_REFRESH`: run the refresh timer (default: true)
//! - `ANONCHAT_REFRESH_BEFORE_REQUEST`: refresh inline before each request (default: false)
//! - `ANONCHAT_REFRESH_AFTER_REQUEST`: refresh after each request (default: true)
//! - `ANONCHAT_REQUEST_TIMEOUT_SECS`: upstream request timeout (default: none)
//! - `ANONCHAT_ACCEPT_INVALID_CERTS`: skip TLS certificate checks (default: false)
//!
//! Example `anonchat.yml`:
//!
//! ```yaml
//! port: 8080
//! proxy: "socks5://127.0.0.1:1080"
//! refresh_interval_secs: 1200
//! refresh_after_request: false
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3040;
pub const DEFAULT_BASE_URL: &str = "https://chat.openai.com";
pub const DEFAULT_UPSTREAM_MODEL: &str = "text-davinci-002-render-sha";
pub const DEFAULT_RESPONSE_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub port: u16,
    /// SOCKS proxy for every upstream call.
    pub proxy: Option<String>,
    pub base_url: String,
    /// Model slug sent upstream.
    pub upstream_model: String,
    /// Model name reported back to clients.
    pub response_model: String,
    pub user_agent: String,

    pub refresh_interval_secs: u64,
    pub error_wait_secs: u64,
    /// Cap on the multiplier applied to `error_wait_secs` as failures pile up.
    pub max_backoff_factor: u32,
    /// Consecutive failures without any token before the device id is renewed.
    pub renew_after_failures: u32,

    /// Whether proof-of-work challenges are solved. Upstream may stop asking.
    pub proof_of_work: bool,
    /// Run the timer-driven refresh loop.
    pub background_refresh: bool,
    /// Refresh inline before each conversation call.
    pub refresh_before_request: bool,
    /// Refresh after each request in anticipation of the next one.
    pub refresh_after_request: bool,

    pub request_timeout_secs: Option<u64>,
    pub accept_invalid_certs: bool,
}

impl ProxyConfig {
    /// Built-in defaults, ignoring the environment.
    pub fn builtin() -> Self {
        Self {
            port: DEFAULT_PORT,
            proxy: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            upstream_model: DEFAULT_UPSTREAM_MODEL.to_string(),
            response_model: DEFAULT_RESPONSE_MODEL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            refresh_interval_secs: 60,
            error_wait_secs: 15,
            max_backoff_factor: 8,
            renew_after_failures: 1,
            proof_of_work: true,
            background_refresh: true,
            refresh_before_request: false,
            refresh_after_request: true,
            request_timeout_secs: None,
            accept_invalid_certs: false,
        }
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    /// Apply overrides read through `lookup`, keyed by environment variable
    /// name. Unset or unparseable values are skipped.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(port) = parse(parsed("PORT")) {
            self.port = port;
        }
        if let Some(proxy) = parsed("ANONCHAT_PROXY").filter(|p| !p.is_empty()) {
            self.proxy = Some(proxy);
        }
        if let Some(base_url) = parsed("ANONCHAT_BASE_URL") {
            self.base_url = base_url;
        }
        if let Some(model) = parsed("ANONCHAT_UPSTREAM_MODEL").filter(|m| !m.is_empty()) {
            self.upstream_model = model;
        }
        if let Some(model) = parsed("ANONCHAT_RESPONSE_MODEL").filter(|m| !m.is_empty()) {
            self.response_model = model;
        }
        if let Some(user_agent) = parsed("ANONCHAT_USER_AGENT").filter(|ua| !ua.is_empty()) {
            self.user_agent = user_agent;
        }
        if let Some(secs) = parse(parsed("ANONCHAT_REFRESH_INTERVAL_SECS")) {
            self.refresh_interval_secs = secs;
        }
        if let Some(secs) = parse(parsed("ANONCHAT_ERROR_WAIT_SECS")) {
            self.error_wait_secs = secs;
        }
        if let Some(factor) = parse(parsed("ANONCHAT_MAX_BACKOFF_FACTOR")) {
            self.max_backoff_factor = factor;
        }
        if let Some(failures) = parse(parsed("ANONCHAT_RENEW_AFTER_FAILURES")) {
            self.renew_after_failures = failures;
        }
        if let Some(enabled) = parse(parsed("ANONCHAT_PROOF_OF_WORK")) {
            self.proof_of_work = enabled;
        }
        if let Some(enabled) = parse(parsed("ANONCHAT_BACKGROUND_REFRESH")) {
            self.background_refresh = enabled;
        }
        if let Some(enabled) = parse(parsed("ANONCHAT_REFRESH_BEFORE_REQUEST")) {
            self.refresh_before_request = enabled;
        }
        if let Some(enabled) = parse(parsed("ANONCHAT_REFRESH_AFTER_REQUEST")) {
            self.refresh_after_request = enabled;
        }
        if let Some(secs) = parse(parsed("ANONCHAT_REQUEST_TIMEOUT_SECS")) {
            self.request_timeout_secs = Some(secs);
        }
        if let Some(enabled) = parse(parsed("ANONCHAT_ACCEPT_INVALID_CERTS")) {
            self.accept_invalid_certs = enabled;
        }
        self
    }

    /// Load `path` on top of the defaults and environment. Keys missing from
    /// the file keep their current values.
    pub fn from_yaml_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;

        let config: ProxyConfig = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            anyhow::bail!("base_url must not be empty");
        }
        if self.renew_after_failures == 0 {
            anyhow::bail!("renew_after_failures must be at least 1");
        }
        if let Some(proxy) = &self.proxy {
            reqwest::Proxy::all(proxy.as_str())
                .with_context(|| format!("invalid proxy url {:?}", proxy))?;
        }
        Ok(())
    }

    pub fn base_url_trimmed(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn requirements_url(&self) -> String {
        format!(
            "{}/backend-anon/sentinel/chat-requirements",
            self.base_url_trimmed()
        )
    }

    pub fn conversation_url(&self) -> String {
        format!("{}/backend-anon/conversation", self.base_url_trimmed())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn error_wait(&self) -> Duration {
        Duration::from_secs(self.error_wait_secs)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::builtin().with_env_overrides()
    }
}

fn parse<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_defaults() {
        let config = ProxyConfig::builtin();
        assert_eq!(config.port, 3040);
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.error_wait(), Duration::from_secs(15));
        assert!(config.proof_of_work);
        assert!(config.background_refresh);
        assert!(!config.refresh_before_request);
        assert!(config.proxy.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_upstream_urls_ignore_trailing_slash() {
        let config = ProxyConfig {
            base_url: "http://127.0.0.1:9999/".to_string(),
            ..ProxyConfig::builtin()
        };
        assert_eq!(
            config.requirements_url(),
            "http://127.0.0.1:9999/backend-anon/sentinel/chat-requirements"
        );
        assert_eq!(
            config.conversation_url(),
            "http://127.0.0.1:9999/backend-anon/conversation"
        );
    }

    #[test]
    fn test_overrides_cover_every_setting() {
        let vars: std::collections::HashMap<&str, &str> = [
            ("PORT", "8080"),
            ("ANONCHAT_PROXY", "socks5://127.0.0.1:1080"),
            ("ANONCHAT_BASE_URL", "http://127.0.0.1:9999"),
            ("ANONCHAT_UPSTREAM_MODEL", "auto"),
            ("ANONCHAT_RESPONSE_MODEL", "gpt-4o-mini"),
            ("ANONCHAT_USER_AGENT", "TestAgent/1.0"),
            ("ANONCHAT_REFRESH_INTERVAL_SECS", "120"),
            ("ANONCHAT_ERROR_WAIT_SECS", " 5 "),
            ("ANONCHAT_MAX_BACKOFF_FACTOR", "3"),
            ("ANONCHAT_RENEW_AFTER_FAILURES", "4"),
            ("ANONCHAT_PROOF_OF_WORK", "false"),
            ("ANONCHAT_BACKGROUND_REFRESH", "false"),
            ("ANONCHAT_REFRESH_BEFORE_REQUEST", "true"),
            ("ANONCHAT_REFRESH_AFTER_REQUEST", "false"),
            ("ANONCHAT_REQUEST_TIMEOUT_SECS", "30"),
            ("ANONCHAT_ACCEPT_INVALID_CERTS", "true"),
        ]
        .into_iter()
        .collect();

        let config =
            ProxyConfig::builtin().with_overrides_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.port, 8080);
        assert_eq!(config.proxy.as_deref(), Some("socks5://127.0.0.1:1080"));
        assert_eq!(config.base_url, "http://127.0.0.1:9999");
        assert_eq!(config.upstream_model, "auto");
        assert_eq!(config.response_model, "gpt-4o-mini");
        assert_eq!(config.user_agent, "TestAgent/1.0");
        assert_eq!(config.refresh_interval_secs, 120);
        assert_eq!(config.error_wait_secs, 5);
        assert_eq!(config.max_backoff_factor, 3);
        assert_eq!(config.renew_after_failures, 4);
        assert!(!config.proof_of_work);
        assert!(!config.background_refresh);
        assert!(config.refresh_before_request);
        assert!(!config.refresh_after_request);
        assert_eq!(config.request_timeout_secs, Some(30));
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn test_unparseable_overrides_are_skipped() {
        let config = ProxyConfig::builtin().with_overrides_from(|key| match key {
            "PORT" => Some("not-a-port".to_string()),
            "ANONCHAT_PROOF_OF_WORK" => Some("maybe".to_string()),
            "ANONCHAT_PROXY" | "ANONCHAT_USER_AGENT" => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.proof_of_work);
        assert!(config.proxy.is_none());
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = ProxyConfig {
            renew_after_failures: 0,
            ..ProxyConfig::builtin()
        };
        assert!(config.validate().is_err());
    }
}
