//! Configuration loading
//!
//! Settings come from an optional TOML file, then environment variables
//! (the names the add-on runtime exports), then validation. Every field has a
//! default so an empty file is a valid configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub batching: BatchingConfig,
    pub analysis: AnalysisConfig,
    pub storage: StorageConfig,
}

/// Upstream WebSocket session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub url: String,
    pub token: String,
    /// Stop after this many accepted trigger events; 0 only checks connectivity
    pub max_events: Option<u64>,
    pub reconnect_initial_seconds: f64,
    pub reconnect_max_seconds: f64,
    /// A session lasting this long resets the reconnect backoff
    pub healthy_session_seconds: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ws://supervisor/core/websocket".to_string(),
            token: String::new(),
            max_events: None,
            reconnect_initial_seconds: 1.0,
            reconnect_max_seconds: 30.0,
            healthy_session_seconds: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Quiet window in seconds; 0 disables coalescing
    pub window_seconds: f64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            window_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Minimum interval between backend calls
    pub rate_seconds: f64,
    /// Context lines embedded in a prompt; 0 embeds everything
    pub max_lines: usize,
    pub timeout_seconds: f64,
    pub backend: BackendConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            rate_seconds: 60.0,
            max_lines: 50,
            timeout_seconds: 300.0,
            backend: BackendConfig::Mock,
        }
    }
}

/// Which RCA backend to use
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    #[default]
    Mock,
    #[serde(rename = "openai")]
    OpenAI {
        #[serde(default)]
        api_key: String,
        #[serde(default = "default_openai_model")]
        model: String,
        #[serde(default = "default_openai_base_url")]
        base_url: String,
    },
    Ollama {
        #[serde(default = "default_ollama_endpoint")]
        endpoint: String,
        #[serde(default = "default_ollama_model")]
        model: String,
    },
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "llama3".to_string()
}

impl BackendConfig {
    fn openai() -> Self {
        BackendConfig::OpenAI {
            api_key: String::new(),
            model: default_openai_model(),
            base_url: default_openai_base_url(),
        }
    }

    fn ollama() -> Self {
        BackendConfig::Ollama {
            endpoint: default_ollama_endpoint(),
            model: default_ollama_model(),
        }
    }

    /// Backend name as used in logs and `LLM_BACKEND`
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Mock => "mock",
            BackendConfig::OpenAI { .. } => "openai",
            BackendConfig::Ollama { .. } => "ollama",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub problem_dir: PathBuf,
    /// Segment size that triggers rotation
    pub max_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            problem_dir: PathBuf::from("/data/problems"),
            max_bytes: 1_000_000,
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("{} = {:?}: {}", name, raw, e)))
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    /// Load and validate a TOML file
    ///
    /// # Errors
    ///
    /// `ReadError` when the file cannot be read, `TomlError` when it does not
    /// parse, `ValidationError` when a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text; missing sections take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Empty values count as unset.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("HA_WS_URL") {
            self.connection.url = url;
        }
        if let Some(token) = var("SUPERVISOR_TOKEN") {
            self.connection.token = token;
        }
        if let Some(raw) = var("BATCH_SECONDS") {
            self.batching.window_seconds = parse_env("BATCH_SECONDS", &raw)?;
        }
        if let Some(raw) = var("ANALYSIS_RATE_SECONDS") {
            self.analysis.rate_seconds = parse_env("ANALYSIS_RATE_SECONDS", &raw)?;
        }
        if let Some(raw) = var("ANALYSIS_MAX_LINES") {
            self.analysis.max_lines = parse_env("ANALYSIS_MAX_LINES", &raw)?;
        }
        if let Some(raw) = var("ANALYSIS_TIMEOUT_SECONDS") {
            self.analysis.timeout_seconds = parse_env("ANALYSIS_TIMEOUT_SECONDS", &raw)?;
        }
        if let Some(dir) = var("PROBLEM_DIR") {
            self.storage.problem_dir = PathBuf::from(dir);
        }
        if let Some(raw) = var("PROBLEM_MAX_BYTES") {
            self.storage.max_bytes = parse_env("PROBLEM_MAX_BYTES", &raw)?;
        }

        let requested = var("LLM_BACKEND")
            .map(|kind| kind.trim().to_ascii_lowercase())
            .or_else(|| var("OPENAI_API_KEY").map(|_| "openai".to_string()));

        if let Some(kind) = requested {
            if kind != self.analysis.backend.kind() {
                self.analysis.backend = match kind.as_str() {
                    "mock" => BackendConfig::Mock,
                    "openai" => BackendConfig::openai(),
                    "ollama" => BackendConfig::ollama(),
                    other => {
                        return Err(ConfigError::ValidationError(format!(
                            "LLM_BACKEND must be mock, openai or ollama, got {:?}",
                            other
                        )))
                    }
                };
            }
        }

        match &mut self.analysis.backend {
            BackendConfig::OpenAI { api_key, model, .. } => {
                if let Some(key) = var("OPENAI_API_KEY") {
                    *api_key = key;
                }
                if let Some(name) = var("OPENAI_MODEL") {
                    *model = name;
                }
            }
            BackendConfig::Ollama { endpoint, model } => {
                if let Some(url) = var("OLLAMA_ENDPOINT") {
                    *endpoint = url;
                }
                if let Some(name) = var("OLLAMA_MODEL") {
                    *model = name;
                }
            }
            BackendConfig::Mock => {}
        }

        Ok(())
    }

    /// Check value ranges and cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.connection.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(ConfigError::ValidationError(format!(
                "connection.url must use ws:// or wss://, got {:?}",
                url
            )));
        }

        let durations = [
            ("connection.reconnect_initial_seconds", self.connection.reconnect_initial_seconds),
            ("connection.reconnect_max_seconds", self.connection.reconnect_max_seconds),
            ("connection.healthy_session_seconds", self.connection.healthy_session_seconds),
            ("batching.window_seconds", self.batching.window_seconds),
            ("analysis.rate_seconds", self.analysis.rate_seconds),
            ("analysis.timeout_seconds", self.analysis.timeout_seconds),
        ];
        for (name, value) in durations {
            // also rejects values too large for a Duration
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be a non-negative, representable number of seconds, got {}",
                    name, value
                )));
            }
        }

        if self.connection.reconnect_initial_seconds > self.connection.reconnect_max_seconds {
            return Err(ConfigError::ValidationError(
                "connection.reconnect_initial_seconds exceeds reconnect_max_seconds".to_string(),
            ));
        }

        if self.storage.max_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.max_bytes must be greater than 0".to_string(),
            ));
        }

        if let BackendConfig::OpenAI { api_key, .. } = &self.analysis.backend {
            if api_key.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "the openai backend requires an API key (OPENAI_API_KEY)".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Quiet window that closes a batch
    pub fn batch_window(&self) -> Duration {
        seconds(self.batching.window_seconds)
    }

    /// Minimum spacing between backend calls
    pub fn rate_interval(&self) -> Duration {
        seconds(self.analysis.rate_seconds)
    }

    /// Upper bound on one backend call
    pub fn analysis_timeout(&self) -> Duration {
        seconds(self.analysis.timeout_seconds)
    }

    /// Prompt line limit, `None` when truncation is disabled
    pub fn max_lines(&self) -> Option<usize> {
        (self.analysis.max_lines > 0).then_some(self.analysis.max_lines)
    }

    /// First reconnect delay
    pub fn reconnect_initial(&self) -> Duration {
        seconds(self.connection.reconnect_initial_seconds)
    }

    /// Reconnect delay ceiling
    pub fn reconnect_max(&self) -> Duration {
        seconds(self.connection.reconnect_max_seconds)
    }

    /// Session length after which the reconnect delay resets
    pub fn healthy_session(&self) -> Duration {
        seconds(self.connection.healthy_session_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.connection.url, "ws://supervisor/core/websocket");
        assert_eq!(config.batch_window(), Duration::from_secs(1));
        assert_eq!(config.rate_interval(), Duration::from_secs(60));
        assert_eq!(config.analysis_timeout(), Duration::from_secs(300));
        assert_eq!(config.max_lines(), Some(50));
        assert_eq!(config.reconnect_initial(), Duration::from_secs(1));
        assert_eq!(config.reconnect_max(), Duration::from_secs(30));
        assert_eq!(config.storage.max_bytes, 1_000_000);
        assert_eq!(config.analysis.backend, BackendConfig::Mock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_toml_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [connection]
            url = "wss://ha.local/api/websocket"
            token = "abc"
            max_events = 10

            [batching]
            window_seconds = 0

            [analysis]
            rate_seconds = 5
            max_lines = 0
            timeout_seconds = 30.5

            [analysis.backend]
            type = "ollama"
            model = "mistral"

            [storage]
            problem_dir = "/tmp/problems"
            max_bytes = 2048
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.connection.max_events, Some(10));
        assert_eq!(config.batch_window(), Duration::ZERO);
        assert_eq!(config.max_lines(), None);
        assert_eq!(config.analysis_timeout(), Duration::from_millis(30_500));
        assert_eq!(
            config.analysis.backend,
            BackendConfig::Ollama {
                endpoint: "http://localhost:11434".to_string(),
                model: "mistral".to_string()
            }
        );
        assert_eq!(config.storage.problem_dir, PathBuf::from("/tmp/problems"));
    }

    #[test]
    fn test_validation_failures() {
        let bad = [
            "[connection]\nurl = \"http://ha.local\"",
            "[batching]\nwindow_seconds = -1",
            "[analysis]\nrate_seconds = nan",
            "[connection]\nreconnect_initial_seconds = 60\nreconnect_max_seconds = 30",
            "[storage]\nmax_bytes = 0",
            "[analysis.backend]\ntype = \"openai\"",
        ];
        for toml in bad {
            assert!(
                matches!(Config::from_toml_str(toml), Err(ConfigError::ValidationError(_))),
                "accepted: {}",
                toml
            );
        }
        assert!(matches!(
            Config::from_toml_str("[analysis.backend]\ntype = \"gpt\""),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_unrepresentable_duration_rejected() {
        let result = Config::from_toml_str("[analysis]\ntimeout_seconds = 1e20");
        assert!(
            matches!(&result, Err(ConfigError::ValidationError(msg)) if msg.contains("analysis.timeout_seconds")),
            "accepted: {:?}",
            result
        );

        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[("BATCH_SECONDS", "1e300")]))
            .unwrap();
        assert!(config.validate().is_err());

        config.batching.window_seconds = 1e9;
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_window(), Duration::from_secs(1_000_000_000));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("HA_WS_URL", "ws://localhost:8123/api/websocket"),
                ("SUPERVISOR_TOKEN", "secret"),
                ("BATCH_SECONDS", "0.5"),
                ("ANALYSIS_RATE_SECONDS", "2"),
                ("ANALYSIS_MAX_LINES", "10"),
                ("PROBLEM_DIR", "/tmp/p"),
                ("PROBLEM_MAX_BYTES", "4096"),
            ]))
            .unwrap();

        assert_eq!(config.connection.url, "ws://localhost:8123/api/websocket");
        assert_eq!(config.connection.token, "secret");
        assert_eq!(config.batch_window(), Duration::from_millis(500));
        assert_eq!(config.rate_interval(), Duration::from_secs(2));
        assert_eq!(config.max_lines(), Some(10));
        assert_eq!(config.storage.problem_dir, PathBuf::from("/tmp/p"));
        assert_eq!(config.storage.max_bytes, 4096);
    }

    #[test]
    fn test_openai_key_selects_openai_backend() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[("OPENAI_API_KEY", "sk-1"), ("OPENAI_MODEL", "gpt-4o")]))
            .unwrap();
        assert_eq!(
            config.analysis.backend,
            BackendConfig::OpenAI {
                api_key: "sk-1".to_string(),
                model: "gpt-4o".to_string(),
                base_url: "https://api.openai.com/v1".to_string()
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_backend_wins_over_key() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("LLM_BACKEND", "Ollama"),
                ("OPENAI_API_KEY", "sk-1"),
                ("OLLAMA_ENDPOINT", "http://gpu:11434"),
            ]))
            .unwrap();
        assert_eq!(
            config.analysis.backend,
            BackendConfig::Ollama {
                endpoint: "http://gpu:11434".to_string(),
                model: "llama3".to_string()
            }
        );
    }

    #[test]
    fn test_env_keeps_file_backend_settings() {
        let mut config = Config::from_toml_str(
            "[analysis.backend]\ntype = \"openai\"\napi_key = \"sk-file\"\nmodel = \"custom\"",
        )
        .unwrap();
        config
            .apply_overrides(lookup(&[("OPENAI_API_KEY", "sk-env")]))
            .unwrap();
        match config.analysis.backend {
            BackendConfig::OpenAI { api_key, model, .. } => {
                assert_eq!(api_key, "sk-env");
                assert_eq!(model, "custom");
            }
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_invalid_env_values() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(lookup(&[("BATCH_SECONDS", "soon")]))
            .is_err());
        assert!(config
            .apply_overrides(lookup(&[("LLM_BACKEND", "claude")]))
            .is_err());
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[("OPENAI_API_KEY", ""), ("HA_WS_URL", " ")]))
            .unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/hawk.toml")),
            Err(ConfigError::ReadError(_))
        ));
    }
}
