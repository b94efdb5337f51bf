//! Queue and agent tuning from an optional TOML file.
//!
//! Every field is optional; anything absent keeps the built-in default.
//!
//! ```toml
//! [build]
//! max_attempts = 5
//! backoff_base_ms = 1000
//!
//! [deploy]
//! job_timeout_secs = 120
//!
//! [agent]
//! max_turns = 8
//! exhaustion = "best_effort"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::{AgentConfig, ExhaustionPolicy};
use crate::error::{Error, Result};
use crate::model::QueueName;
use crate::queue::{BackoffPolicy, QueueOptions};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub build: QueueSettings,
    pub deploy: QueueSettings,
    pub agent: AgentSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read settings {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("bad settings {}: {e}", path.display())))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn queue_options(&self, queue: QueueName) -> QueueOptions {
        let overrides = match queue {
            QueueName::Build => &self.build,
            QueueName::Deploy => &self.deploy,
        };
        overrides.apply(QueueOptions::for_queue(queue))
    }

    pub fn agent_config(&self) -> AgentConfig {
        self.agent.apply(AgentConfig::default())
    }
}

/// Per-queue overrides of [`QueueOptions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_multiplier: Option<u32>,
    pub backoff_cap_ms: Option<u64>,
    pub job_timeout_secs: Option<u64>,
    pub visibility_timeout_secs: Option<u64>,
    pub stall_limit: Option<u32>,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}

impl QueueSettings {
    pub fn apply(&self, mut options: QueueOptions) -> QueueOptions {
        let b = options.backoff;
        options.backoff = BackoffPolicy::new(
            self.backoff_base_ms.map_or(b.base, Duration::from_millis),
            self.backoff_multiplier.unwrap_or(b.multiplier),
            self.backoff_cap_ms.map_or(b.cap, Duration::from_millis),
            self.max_attempts.unwrap_or(b.max_attempts),
        );
        if let Some(secs) = self.job_timeout_secs {
            options.job_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.visibility_timeout_secs {
            options.visibility_timeout = Duration::from_secs(secs);
        }
        options.stall_limit = self.stall_limit.unwrap_or(options.stall_limit);
        options.remove_on_complete = self.remove_on_complete.unwrap_or(options.remove_on_complete);
        options.remove_on_fail = self.remove_on_fail.unwrap_or(options.remove_on_fail);
        options
    }
}

/// Overrides of [`AgentConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    pub max_turns: Option<u32>,
    pub max_nudges: Option<u32>,
    pub max_read_files: Option<usize>,
    pub turn_timeout_secs: Option<u64>,
    pub max_tokens: Option<u32>,
    pub exhaustion: Option<ExhaustionPolicy>,
    pub progress_start: Option<u8>,
    pub progress_end: Option<u8>,
}

impl AgentSettings {
    pub fn apply(&self, mut config: AgentConfig) -> AgentConfig {
        config.max_turns = self.max_turns.unwrap_or(config.max_turns).max(1);
        config.max_nudges = self.max_nudges.unwrap_or(config.max_nudges);
        config.max_read_files = self.max_read_files.unwrap_or(config.max_read_files);
        if let Some(secs) = self.turn_timeout_secs {
            config.turn_timeout = Duration::from_secs(secs);
        }
        config.max_tokens = self.max_tokens.unwrap_or(config.max_tokens);
        config.exhaustion = self.exhaustion.unwrap_or(config.exhaustion);
        let start = self.progress_start.unwrap_or(config.progress_range.start);
        let end = self.progress_end.unwrap_or(config.progress_range.end).min(100);
        if start < end {
            config.progress_range = start..end;
        }
        config
    }
}
