//! TOML configuration.
//!
//! Every command reads a single file (default `./config/sitechat.toml`).
//! Only `[db]` is required; all other sections fall back to defaults that
//! mirror a small local deployment: HTML scraping, keyword retrieval and
//! no model providers.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub scrape: ScrapeConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Crawler limits. `max_depth` counts link hops from the start page (0).
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlConfig {
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default)]
    pub max_depth: Option<usize>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_crawl_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Permit loopback and private-network hosts. Off by default.
    #[serde(default)]
    pub allow_private_hosts: bool,
    #[serde(default = "default_min_line_words")]
    pub min_line_words: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            max_depth: None,
            concurrency: default_concurrency(),
            timeout_secs: default_crawl_timeout(),
            delay_ms: 0,
            user_agent: default_user_agent(),
            allow_private_hosts: false,
            min_line_words: default_min_line_words(),
        }
    }
}

fn default_max_pages() -> usize {
    200
}
fn default_concurrency() -> usize {
    8
}
fn default_crawl_timeout() -> u64 {
    10
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/91.0.4472.124 Safari/537.36"
        .to_string()
}
fn default_min_line_words() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScrapeConfig {
    #[serde(default = "default_scrape_provider")]
    pub provider: String,
    #[serde(default = "default_firecrawl_url")]
    pub api_url: String,
    #[serde(default = "default_scrape_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub only_main_content: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            provider: default_scrape_provider(),
            api_url: default_firecrawl_url(),
            timeout_secs: default_scrape_timeout(),
            only_main_content: true,
        }
    }
}

fn default_scrape_provider() -> String {
    "html".to_string()
}
fn default_firecrawl_url() -> String {
    "https://api.firecrawl.dev".to_string()
}
fn default_scrape_timeout() -> u64 {
    30
}
fn default_true() -> bool {
    true
}

/// Character-based splitter settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            top_k: default_top_k(),
            candidate_k: default_candidate_k(),
            hybrid_alpha: default_hybrid_alpha(),
        }
    }
}

fn default_mode() -> String {
    "auto".to_string()
}
fn default_top_k() -> usize {
    4
}
fn default_candidate_k() -> i64 {
    40
}
fn default_hybrid_alpha() -> f64 {
    0.6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
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
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
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
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Chat model used for question condensing and answering.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            url: None,
            temperature: None,
            max_tokens: None,
            timeout_secs: default_llm_timeout(),
            max_retries: default_llm_retries(),
            history_turns: default_history_turns(),
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_llm_timeout() -> u64 {
    60
}
fn default_llm_retries() -> u32 {
    3
}
fn default_history_turns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    if config.crawl.concurrency == 0 {
        bail!("crawl.concurrency must be >= 1");
    }
    if config.crawl.max_pages == 0 {
        bail!("crawl.max_pages must be >= 1");
    }

    match config.scrape.provider.as_str() {
        "html" | "firecrawl" => {}
        other => bail!(
            "Unknown scrape provider: '{}'. Must be html or firecrawl.",
            other
        ),
    }

    if config.retrieval.top_k == 0 {
        bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.hybrid_alpha) {
        bail!("retrieval.hybrid_alpha must be in [0.0, 1.0]");
    }
    match config.retrieval.mode.as_str() {
        "auto" | "keyword" | "semantic" | "hybrid" => {}
        other => bail!(
            "Unknown retrieval mode: '{}'. Must be auto, keyword, semantic, or hybrid.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be >= 1");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" | "ollama" | "gemini" => {
            if config.llm.model.is_none() {
                bail!(
                    "llm.model must be specified when provider is '{}'",
                    config.llm.provider
                );
            }
        }
        other => bail!(
            "Unknown llm provider: '{}'. Must be disabled, openai, ollama, or gemini.",
            other
        ),
    }

    Ok(())
}
