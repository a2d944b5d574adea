//! TOML configuration.
//!
//! Every section except `[db]` and `[server]` is optional and falls back to
//! defaults. [`load_config`] parses and validates in one step; anything that
//! would make retrieval or handoff misbehave is rejected at startup.
//!
//! ```toml
//! [db]
//! path = "./data/replyhub.sqlite"
//!
//! [retrieval]
//! result_limit = 5
//! context_budget = 10000
//! deadline_ms = 5000
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//!
//! [server]
//! bind = "127.0.0.1:7331"
//! ```

use anyhow::{Context, Result};
use replyhub_core::rank::RankParams;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_result_limit")]
    pub result_limit: usize,
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
    #[serde(default = "default_base_threshold")]
    pub base_threshold: f64,
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f64,
    #[serde(default = "default_high_confidence_ratio")]
    pub high_confidence_ratio: f64,
    #[serde(default = "default_embedding_weight")]
    pub embedding_weight: f64,
    #[serde(default = "default_fallback_count")]
    pub fallback_count: usize,
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            result_limit: default_result_limit(),
            context_budget: default_context_budget(),
            base_threshold: default_base_threshold(),
            high_confidence: default_high_confidence(),
            high_confidence_ratio: default_high_confidence_ratio(),
            embedding_weight: default_embedding_weight(),
            fallback_count: default_fallback_count(),
            deadline_ms: default_deadline_ms(),
        }
    }
}

impl RetrievalConfig {
    pub fn rank_params(&self) -> RankParams {
        RankParams {
            embedding_weight: self.embedding_weight,
            base_threshold: self.base_threshold,
            high_confidence: self.high_confidence,
            high_confidence_ratio: self.high_confidence_ratio,
            fallback_count: self.fallback_count,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

fn default_result_limit() -> usize {
    5
}
fn default_context_budget() -> usize {
    10_000
}
fn default_base_threshold() -> f64 {
    0.3
}
fn default_high_confidence() -> f64 {
    0.7
}
fn default_high_confidence_ratio() -> f64 {
    0.5
}
fn default_embedding_weight() -> f64 {
    0.7
}
fn default_fallback_count() -> usize {
    3
}
fn default_deadline_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for Ollama (default `http://localhost:11434`).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    2
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResponderConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default = "default_responder_model")]
    pub model: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Sent to the customer when the responder fails.
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: default_responder_model(),
            timeout_secs: default_timeout_secs(),
            fallback_reply: default_fallback_reply(),
        }
    }
}

fn default_responder_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_fallback_reply() -> String {
    "Thanks for your message! A member of our team will get back to you shortly.".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HubConfig {
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

fn default_mailbox_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `0` disables caching.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    300
}
fn default_max_entries() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    let r = &config.retrieval;
    if r.result_limit < 1 {
        anyhow::bail!("retrieval.result_limit must be >= 1");
    }
    if r.context_budget < 1 {
        anyhow::bail!("retrieval.context_budget must be >= 1");
    }
    if r.fallback_count < 1 {
        anyhow::bail!("retrieval.fallback_count must be >= 1");
    }
    for (name, value) in [
        ("base_threshold", r.base_threshold),
        ("high_confidence", r.high_confidence),
        ("high_confidence_ratio", r.high_confidence_ratio),
        ("embedding_weight", r.embedding_weight),
    ] {
        if !(0.0..=1.0).contains(&value) {
            anyhow::bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" | "hash" => {
            if e.dims.is_none() || e.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
            if e.provider != "hash" && e.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or hash.",
            other
        ),
    }

    match config.responder.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown responder provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.hub.mailbox_capacity == 0 {
        anyhow::bail!("hub.mailbox_capacity must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "./data/test.sqlite"

        [server]
        bind = "127.0.0.1:7331"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.retrieval.result_limit, 5);
        assert_eq!(config.retrieval.context_budget, 10_000);
        assert_eq!(config.retrieval.deadline(), Duration::from_secs(5));
        assert_eq!(config.hub.mailbox_capacity, 64);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.chunking.max_tokens, 700);
        assert!(!config.embedding.is_enabled());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_rank_params_follow_retrieval_section() {
        let toml = format!("{}\n[retrieval]\nbase_threshold = 0.2\nembedding_weight = 0.5\n", MINIMAL);
        let params = parse_config(&toml).unwrap().retrieval.rank_params();
        assert_eq!(params.base_threshold, 0.2);
        assert_eq!(params.embedding_weight, 0.5);
        assert_eq!(params.high_confidence, 0.7);
    }

    #[test]
    fn test_rejects_out_of_range_weight() {
        let toml = format!("{}\n[retrieval]\nembedding_weight = 1.5\n", MINIMAL);
        let err = parse_config(&toml).unwrap_err().to_string();
        assert!(err.contains("embedding_weight"));
    }

    #[test]
    fn test_rejects_unknown_embedding_provider() {
        let toml = format!("{}\n[embedding]\nprovider = \"magic\"\n", MINIMAL);
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_enabled_embedding_requires_dims() {
        let toml = format!("{}\n[embedding]\nprovider = \"openai\"\nmodel = \"m\"\n", MINIMAL);
        assert!(parse_config(&toml).is_err());
        let toml = format!("{}\n[embedding]\nprovider = \"hash\"\ndims = 64\n", MINIMAL);
        assert!(parse_config(&toml).is_ok());
    }
}
