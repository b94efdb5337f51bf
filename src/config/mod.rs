//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Queue and agent tuning lives in an optional TOML file, see [`settings`].

pub mod secrets;
pub mod settings;

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::llm::Provider;
use secrecy::SecretString;

pub use settings::{AgentSettings, QueueSettings, Settings};

#[derive(Debug)]
pub struct Config {
    /// Postgres URL. Absent means in-memory queues and stores.
    pub database_url: Option<SecretString>,
    pub model_provider: Provider,
    pub model_api_key: SecretString,
    pub model_name: Option<String>,
    pub model_base_url: Option<String>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub listen_addr: SocketAddr,
    pub build_concurrency: usize,
    pub deploy_concurrency: usize,
    /// Path of the TOML queue/agent settings file.
    pub queue_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| {
                Error::Config(format!("required environment variable {name} is not set"))
            })
        };

        Ok(Self {
            database_url: var("DATABASE_URL").map(SecretString::from),
            model_provider: var("MODEL_PROVIDER")
                .map(|p| p.parse::<Provider>())
                .transpose()?
                .unwrap_or(Provider::Anthropic),
            model_api_key: SecretString::from(required("MODEL_API_KEY")?),
            model_name: var("MODEL_NAME"),
            model_base_url: var("MODEL_BASE_URL"),
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            listen_addr: parse_var(
                "LISTEN_ADDR",
                var("LISTEN_ADDR"),
                SocketAddr::from(([0, 0, 0, 0], 8080)),
            )?,
            build_concurrency: parse_var("BUILD_CONCURRENCY", var("BUILD_CONCURRENCY"), 2)?,
            deploy_concurrency: parse_var("DEPLOY_CONCURRENCY", var("DEPLOY_CONCURRENCY"), 2)?,
            queue_config: var("QUEUE_CONFIG").map(PathBuf::from),
        })
    }

    /// Queue and agent settings: the TOML file when configured, else defaults.
    pub fn settings(&self) -> Result<Settings> {
        match &self.queue_config {
            Some(path) => Settings::load(path),
            None => Ok(Settings::default()),
        }
    }

    /// Model name to use when a build does not override it.
    pub fn default_model(&self) -> &str {
        self.model_name
            .as_deref()
            .unwrap_or(match self.model_provider {
                Provider::Anthropic => "claude-sonnet-4-5",
                Provider::OpenAi => "gpt-4o",
            })
    }
}

fn parse_var<T>(name: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_key_is_set() {
        let config = Config::from_lookup(lookup(&[("MODEL_API_KEY", "sk-test")])).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.model_provider, Provider::Anthropic);
        assert_eq!(config.build_concurrency, 2);
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn bad_number_is_a_config_error() {
        let err = Config::from_lookup(lookup(&[
            ("MODEL_API_KEY", "sk-test"),
            ("BUILD_CONCURRENCY", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("BUILD_CONCURRENCY")));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let err = Config::from_lookup(lookup(&[("MODEL_API_KEY", "  ")])).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
