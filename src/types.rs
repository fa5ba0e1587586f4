use std::fs;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_classifier_base_url")]
    pub base_url: String,
    /// Left empty in the file to pick up `XAI_API_KEY` from the environment.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    /// Total attempts per message, including the first call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: default_classifier_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: 0.0,
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClassifierConfig {
    /// Delay before retry number `attempt` (1-based), doubling from the base
    /// delay and capped at the max delay.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_message_queue")]
    pub message_queue: String,
    #[serde(default = "default_trade_action_queue")]
    pub trade_action_queue: String,
    #[serde(default = "default_pop_timeout_secs")]
    pub pop_timeout_secs: u64,
    #[serde(default = "default_max_reply_depth")]
    pub max_reply_depth: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            message_queue: default_message_queue(),
            trade_action_queue: default_trade_action_queue(),
            pop_timeout_secs: default_pop_timeout_secs(),
            max_reply_depth: default_max_reply_depth(),
            history_limit: default_history_limit(),
        }
    }
}

impl PipelineConfig {
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Address for the `/health` listener; disabled when absent.
    #[serde(default)]
    pub health_addr: Option<String>,
    #[serde(default = "default_dashboard_period_secs")]
    pub dashboard_period_secs: u64,
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            health_addr: None,
            dashboard_period_secs: default_dashboard_period_secs(),
            max_staleness_secs: default_max_staleness_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub postgres: PostgresConfig,
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl AppConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {path}"))?;
        let mut cfg: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to deserialize TOML config at {path}"))?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Secrets and connection strings from the environment win over the file.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("XAI_API_KEY") {
            self.classifier.api_key = key;
        }
        if let Some(url) = non_empty("DATABASE_URL") {
            self.postgres.url = url;
        }
        if let Some(url) = non_empty("REDIS_URL") {
            self.redis.url = url;
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_classifier_base_url() -> String {
    "https://api.x.ai/v1".to_string()
}

fn default_model() -> String {
    "grok-3-mini".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_message_queue() -> String {
    "discord_messages".to_string()
}

fn default_trade_action_queue() -> String {
    "trade_actions".to_string()
}

fn default_pop_timeout_secs() -> u64 {
    1
}

fn default_max_reply_depth() -> usize {
    10
}

fn default_history_limit() -> usize {
    10
}

fn default_dashboard_period_secs() -> u64 {
    10
}

fn default_max_staleness_secs() -> u64 {
    120
}
