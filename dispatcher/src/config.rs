//! Dispatcher configuration.
//!
//! Resolution order: built-in defaults, then the TOML file named by
//! `DISPATCHER_CONFIG` (if set), then `DISPATCHER_*` environment variables.
//! A `.env` file is loaded first when present.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared_types::{BodyMode, InsertionMode, RateLimits, TextRange};

use crate::actors::document::SessionOptions;
use crate::actors::scheduler::SchedulerArguments;
use crate::backoff::RetryPolicy;
use crate::provider::{BodySettings, ProviderConfig};

pub const CONFIG_PATH_ENV: &str = "DISPATCHER_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Provider base URL, e.g. `https://api.openai.com`
    pub base_url: String,
    /// Generation endpoint path (or absolute URL)
    pub request_path: String,
    pub models_path: String,
    pub body_mode: BodyMode,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Requests allowed in flight at once
    pub max_concurrency: usize,
    /// Requests allowed to start per minute
    pub max_per_minute: u32,
    /// Adopt per-minute limits advertised by the server
    pub dynamic_limits: bool,
    pub refill_interval_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Deadline for one HTTP attempt, including reading the body
    pub request_timeout_ms: u64,
    pub insertion_mode: InsertionMode,
    pub pre_separator: Option<String>,
    pub post_separator: Option<String>,
    pub stream: bool,
    pub auth_scheme: String,
    /// Name of the environment variable holding the API credential
    pub api_key_env: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let limits = RateLimits::default();
        Self {
            base_url: "https://api.openai.com".to_string(),
            request_path: "/v1/chat/completions".to_string(),
            models_path: "/v1/models".to_string(),
            body_mode: BodyMode::Auto,
            model: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            max_concurrency: limits.max_concurrency,
            max_per_minute: limits.max_per_minute,
            dynamic_limits: true,
            refill_interval_ms: 200,
            max_retries: retry.max_retries,
            base_backoff_ms: retry.base_backoff_ms,
            max_backoff_ms: retry.max_backoff_ms,
            request_timeout_ms: 120_000,
            insertion_mode: InsertionMode::Append,
            pre_separator: Some("\n".to_string()),
            post_separator: None,
            stream: true,
            auth_scheme: "Bearer".to_string(),
            api_key_env: "DISPATCHER_API_KEY".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_toml_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `DISPATCHER_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvLookup(lookup);
        env.string("DISPATCHER_BASE_URL", &mut self.base_url);
        env.string("DISPATCHER_REQUEST_PATH", &mut self.request_path);
        env.string("DISPATCHER_MODELS_PATH", &mut self.models_path);
        env.parse("DISPATCHER_BODY_MODE", &mut self.body_mode)?;
        env.optional_string("DISPATCHER_MODEL", &mut self.model);
        env.optional_string("DISPATCHER_SYSTEM_PROMPT", &mut self.system_prompt);
        env.optional_parse("DISPATCHER_TEMPERATURE", &mut self.temperature)?;
        env.optional_parse("DISPATCHER_MAX_TOKENS", &mut self.max_tokens)?;
        env.parse("DISPATCHER_MAX_CONCURRENCY", &mut self.max_concurrency)?;
        env.parse("DISPATCHER_MAX_PER_MINUTE", &mut self.max_per_minute)?;
        env.flag("DISPATCHER_DYNAMIC_LIMITS", &mut self.dynamic_limits)?;
        env.parse("DISPATCHER_REFILL_INTERVAL_MS", &mut self.refill_interval_ms)?;
        env.parse("DISPATCHER_MAX_RETRIES", &mut self.max_retries)?;
        env.parse("DISPATCHER_BASE_BACKOFF_MS", &mut self.base_backoff_ms)?;
        env.parse("DISPATCHER_MAX_BACKOFF_MS", &mut self.max_backoff_ms)?;
        env.parse("DISPATCHER_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms)?;
        env.parse("DISPATCHER_INSERTION_MODE", &mut self.insertion_mode)?;
        env.separator("DISPATCHER_PRE_SEPARATOR", &mut self.pre_separator);
        env.separator("DISPATCHER_POST_SEPARATOR", &mut self.post_separator);
        env.flag("DISPATCHER_STREAM", &mut self.stream)?;
        env.string("DISPATCHER_AUTH_SCHEME", &mut self.auth_scheme);
        env.string("DISPATCHER_API_KEY_ENV", &mut self.api_key_env);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(temperature) = self.temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err(invalid(
                    "temperature",
                    temperature,
                    "must be a non-negative number",
                ));
            }
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(invalid(
                "max_backoff_ms",
                self.max_backoff_ms,
                "must be at least base_backoff_ms",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(invalid("request_timeout_ms", 0, "must be positive"));
        }
        if self.base_url.trim().is_empty() && !self.request_path.starts_with("http") {
            return Err(invalid("base_url", "", "required unless request_path is absolute"));
        }
        Ok(())
    }

    /// Reads the credential from the variable named by `api_key_env`.
    pub fn credential(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn rate_limits(&self) -> RateLimits {
        RateLimits::new(self.max_concurrency, self.max_per_minute)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff_ms: self.base_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn scheduler_args(&self) -> SchedulerArguments {
        SchedulerArguments {
            limits: self.rate_limits(),
            dynamic_limits: self.dynamic_limits,
            refill_interval: Duration::from_millis(self.refill_interval_ms),
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig {
            base_url: self.base_url.clone(),
            request_path: self.request_path.clone(),
            models_path: self.models_path.clone(),
            body_mode: self.body_mode,
            body: BodySettings {
                model: self.model.clone(),
                system_prompt: self.system_prompt.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            },
            stream: self.stream,
            retry: self.retry_policy(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            auth_scheme: self.auth_scheme.clone(),
        }
    }

    pub fn session_options(&self, range: TextRange) -> SessionOptions {
        SessionOptions {
            mode: self.insertion_mode,
            range,
            pre_separator: self.pre_separator.clone(),
            post_separator: self.post_separator.clone(),
        }
    }
}

fn invalid(key: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

struct EnvLookup<F>(F);

impl<F> EnvLookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, slot: &mut String) {
        if let Some(value) = self.get(key).filter(|v| !v.trim().is_empty()) {
            *slot = value.trim().to_string();
        }
    }

    /// An empty value clears the setting.
    fn optional_string(&self, key: &str, slot: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            let value = value.trim();
            *slot = (!value.is_empty()).then(|| value.to_string());
        }
    }

    /// Like `optional_string` but untrimmed, with `\n` and `\t` escapes.
    fn separator(&self, key: &str, slot: &mut Option<String>) {
        if let Some(value) = self.get(key) {
            let value = value.replace("\\n", "\n").replace("\\t", "\t");
            *slot = (!value.is_empty()).then_some(value);
        }
    }

    fn parse<T>(&self, key: &str, slot: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.get(key) {
            *slot = value
                .trim()
                .parse::<T>()
                .map_err(|e| invalid(key, &value, &e.to_string()))?;
        }
        Ok(())
    }

    fn optional_parse<T>(&self, key: &str, slot: &mut Option<T>) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(value) if value.trim().is_empty() => *slot = None,
            Some(value) => {
                let parsed = value
                    .trim()
                    .parse::<T>()
                    .map_err(|e| invalid(key, &value, &e.to_string()))?;
                *slot = Some(parsed);
            }
            None => {}
        }
        Ok(())
    }

    fn flag(&self, key: &str, slot: &mut bool) -> Result<(), ConfigError> {
        if let Some(value) = self.get(key) {
            *slot = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(key, &value, "expected a boolean")),
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatcherConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rate_limits(), RateLimits::new(4, 60));
        assert_eq!(config.insertion_mode, InsertionMode::Append);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DispatcherConfig::default();
        config
            .apply_overrides(lookup(&[
                ("DISPATCHER_BASE_URL", " http://localhost:9000 "),
                ("DISPATCHER_MAX_CONCURRENCY", "8"),
                ("DISPATCHER_MAX_PER_MINUTE", "600"),
                ("DISPATCHER_DYNAMIC_LIMITS", "off"),
                ("DISPATCHER_INSERTION_MODE", "replace"),
                ("DISPATCHER_BODY_MODE", "completions"),
                ("DISPATCHER_TEMPERATURE", "0.2"),
                ("DISPATCHER_PRE_SEPARATOR", ""),
                ("DISPATCHER_POST_SEPARATOR", "\\n\\n"),
                ("DISPATCHER_MODEL", "gpt-test"),
            ]))
            .unwrap();

        assert_eq!(config.base_url, "http://localhost:9000");
        assert_eq!(config.rate_limits(), RateLimits::new(8, 600));
        assert!(!config.dynamic_limits);
        assert_eq!(config.insertion_mode, InsertionMode::Replace);
        assert_eq!(config.body_mode, BodyMode::Completion);
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.pre_separator, None);
        assert_eq!(config.post_separator.as_deref(), Some("\n\n"));
        assert_eq!(config.model.as_deref(), Some("gpt-test"));
    }

    #[test]
    fn test_invalid_env_value_names_the_key() {
        let mut config = DispatcherConfig::default();
        let err = config
            .apply_overrides(lookup(&[("DISPATCHER_MAX_RETRIES", "many")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "DISPATCHER_MAX_RETRIES");
                assert_eq!(value, "many");
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = config
            .apply_overrides(lookup(&[("DISPATCHER_STREAM", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("DISPATCHER_STREAM"));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let config = DispatcherConfig {
            base_backoff_ms: 5_000,
            max_backoff_ms: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_toml_file_fills_missing_fields_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "base_url = \"http://llm.internal\"\nmax_concurrency = 2\ninsertion_mode = \"replace\"\nbody_mode = \"chat\""
        )
        .unwrap();

        let config = DispatcherConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.base_url, "http://llm.internal");
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.insertion_mode, InsertionMode::Replace);
        assert_eq!(config.body_mode, BodyMode::Chat);
        assert_eq!(config.max_per_minute, 60);
    }

    #[test]
    fn test_toml_parse_error_carries_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrency = \"two\"").unwrap();
        let err = DispatcherConfig::from_toml_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_derived_settings() {
        let config = DispatcherConfig {
            max_retries: 5,
            request_timeout_ms: 1_500,
            ..Default::default()
        };
        assert_eq!(config.retry_policy().max_retries, 5);
        assert_eq!(
            config.provider_config().request_timeout,
            Duration::from_millis(1_500)
        );
        assert_eq!(
            config.scheduler_args().refill_interval,
            Duration::from_millis(200)
        );
    }
}
