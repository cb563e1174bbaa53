use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub forum: ForumConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default, rename = "agent")]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Falls back to the STRIDECOACH_API_KEY environment variable when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ForumConfig {
    /// Model for the head-coach synthesis turn; defaults to the agent model.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Seconds between head-coach passes over the forum log.
    #[serde(default = "default_host_interval")]
    pub host_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResearchConfig {
    /// Reflection iterations after the first pass, per topic.
    #[serde(default = "default_reflections")]
    pub reflection_iterations: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataConfig {
    /// Training data source: "keep" or "garmin".
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Tavily-style search endpoint for the theory/intel agents.
    #[serde(default)]
    pub search_endpoint: Option<String>,
    /// Falls back to the STRIDECOACH_SEARCH_KEY environment variable when empty.
    #[serde(default)]
    pub search_api_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    /// Forum speaker name, e.g. INSIGHT, MEDIA, QUERY.
    pub name: String,
    #[serde(default, rename = "topic")]
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicConfig {
    pub title: String,
    pub content: String,
}

fn default_base_url() -> String {
    "https://api.siliconflow.cn/v1".to_string()
}

fn default_model() -> String {
    "Qwen/Qwen2.5-72B-Instruct".to_string()
}

fn default_temperature() -> f32 {
    0.6
}

fn default_top_p() -> f32 {
    0.9
}

fn default_log_path() -> PathBuf {
    PathBuf::from("forum.log")
}

fn default_host_interval() -> u64 {
    60
}

fn default_reflections() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_source() -> String {
    "garmin".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("training.sqlite")
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

impl Default for ForumConfig {
    fn default() -> Self {
        ForumConfig {
            model: None,
            log_path: default_log_path(),
            host_interval_secs: default_host_interval(),
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        ResearchConfig {
            reflection_iterations: default_reflections(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        DataConfig {
            source: default_source(),
            db_path: default_db_path(),
            search_endpoint: None,
            search_api_key: String::new(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults so a fresh
    /// checkout can run against environment-variable credentials alone.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> String {
        if !self.api_key.is_empty() {
            return self.api_key.clone();
        }
        std::env::var("STRIDECOACH_API_KEY").unwrap_or_default()
    }
}

impl DataConfig {
    pub fn search_api_key(&self) -> String {
        if !self.search_api_key.is_empty() {
            return self.search_api_key.clone();
        }
        std::env::var("STRIDECOACH_SEARCH_KEY").unwrap_or_default()
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.initial_backoff_ms, self.max_backoff_ms)
    }
}
