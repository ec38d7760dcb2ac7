//! Chat model providers.
//!
//! Mirrors the embedding layer: a small [`ChatProvider`] trait for metadata,
//! and [`complete`] as the entry point that dispatches on `llm.provider`.
//!
//! | Provider | Endpoint | Credentials |
//! |----------|----------|-------------|
//! | `openai` | `POST {url}/v1/chat/completions` | `OPENAI_API_KEY` (optional with a custom `url`) |
//! | `ollama` | `POST {url}/api/chat` | none |
//! | `gemini` | `POST {url}/v1beta/models/{model}:generateContent` | `GOOGLE_API_KEY` |
//!
//! The `openai` provider also covers OpenAI-compatible local servers
//! (LM Studio, vLLM, llama.cpp) through `llm.url`.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::http;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";
const GEMINI_DEFAULT_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Messages plus sampling settings for one completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn from_config(config: &LlmConfig, messages: &[ChatMessage]) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow!("llm.model required"))?;
        Ok(Self {
            model,
            messages: messages.to_vec(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

/// Metadata of a configured chat backend.
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (`"openai"`, `"ollama"`, `"gemini"`, `"disabled"`).
    fn name(&self) -> &str;
    /// Model identifier sent to the backend.
    fn model(&self) -> &str;
}

struct ConfiguredProvider {
    name: &'static str,
    model: String,
}

impl ChatProvider for ConfiguredProvider {
    fn name(&self) -> &str {
        self.name
    }
    fn model(&self) -> &str {
        &self.model
    }
}

/// Validate credentials and describe the backend named by `llm.provider`.
pub fn create_chat_provider(config: &LlmConfig) -> Result<Box<dyn ChatProvider>> {
    let name = match config.provider.as_str() {
        "disabled" => {
            return Ok(Box::new(ConfiguredProvider {
                name: "disabled",
                model: "disabled".to_string(),
            }))
        }
        "openai" => {
            if config.url.is_none() && std::env::var("OPENAI_API_KEY").is_err() {
                bail!("OPENAI_API_KEY environment variable not set");
            }
            "openai"
        }
        "ollama" => "ollama",
        "gemini" => {
            if config.url.is_none() && std::env::var("GOOGLE_API_KEY").is_err() {
                bail!("GOOGLE_API_KEY environment variable not set");
            }
            "gemini"
        }
        other => bail!("Unknown llm provider: {}", other),
    };

    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow!("llm.model must be specified when provider is '{}'", name))?;
    Ok(Box::new(ConfiguredProvider { name, model }))
}

/// Run one chat completion and return the assistant text.
pub async fn complete(config: &LlmConfig, messages: &[ChatMessage]) -> Result<String> {
    match config.provider.as_str() {
        "disabled" => bail!("LLM provider is disabled. Set [llm] provider in config."),
        "openai" => complete_openai(config, &ChatRequest::from_config(config, messages)?).await,
        "ollama" => complete_ollama(config, &ChatRequest::from_config(config, messages)?).await,
        "gemini" => complete_gemini(config, &ChatRequest::from_config(config, messages)?).await,
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ OpenAI-compatible ============

async fn complete_openai(config: &LlmConfig, request: &ChatRequest) -> Result<String> {
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if api_key.is_none() && config.url.is_none() {
        bail!("OPENAI_API_KEY not set");
    }
    let base = config.url.as_deref().unwrap_or(OPENAI_DEFAULT_URL);

    let mut body = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
    });
    if let Some(t) = request.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(m) = request.max_tokens {
        body["max_tokens"] = serde_json::json!(m);
    }

    let json = http::post_json(
        &http::client(config.timeout_secs)?,
        &format!("{}/v1/chat/completions", base.trim_end_matches('/')),
        http::Auth::bearer(api_key.as_deref()),
        &body,
        config.max_retries,
        "OpenAI",
    )
    .await?;

    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

// ============ Ollama ============

async fn complete_ollama(config: &LlmConfig, request: &ChatRequest) -> Result<String> {
    let base = config.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);

    let mut options = serde_json::Map::new();
    if let Some(t) = request.temperature {
        options.insert("temperature".into(), serde_json::json!(t));
    }
    if let Some(m) = request.max_tokens {
        options.insert("num_predict".into(), serde_json::json!(m));
    }

    let body = serde_json::json!({
        "model": request.model,
        "messages": request.messages,
        "stream": false,
        "options": options,
    });

    let json = http::post_json(
        &http::client(config.timeout_secs)?,
        &format!("{}/api/chat", base.trim_end_matches('/')),
        http::Auth::None,
        &body,
        config.max_retries,
        "Ollama",
    )
    .await?;

    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing message.content"))
}

// ============ Gemini ============

async fn complete_gemini(config: &LlmConfig, request: &ChatRequest) -> Result<String> {
    let api_key = std::env::var("GOOGLE_API_KEY").ok();
    if api_key.is_none() && config.url.is_none() {
        bail!("GOOGLE_API_KEY not set");
    }
    gemini_generate(config, request, api_key.as_deref()).await
}

async fn gemini_generate(
    config: &LlmConfig,
    request: &ChatRequest,
    api_key: Option<&str>,
) -> Result<String> {
    let base = config.url.as_deref().unwrap_or(GEMINI_DEFAULT_URL);
    let url = format!(
        "{}/v1beta/models/{}:generateContent",
        base.trim_end_matches('/'),
        request.model
    );
    let auth = match api_key {
        Some(key) => http::Auth::Header("x-goog-api-key", key),
        None => http::Auth::None,
    };

    let json = http::post_json(
        &http::client(config.timeout_secs)?,
        &url,
        auth,
        &gemini_body(request),
        config.max_retries,
        "Gemini",
    )
    .await?;

    parse_gemini_response(&json)
}

/// System messages become `systemInstruction`; assistant turns use role `model`.
fn gemini_body(request: &ChatRequest) -> serde_json::Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.as_str())
        .collect();

    let contents: Vec<serde_json::Value> = request
        .messages
        .iter()
        .filter(|m| m.role != "system")
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            serde_json::json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let mut body = serde_json::json!({ "contents": contents });
    if !system.is_empty() {
        body["systemInstruction"] = serde_json::json!({
            "parts": [{ "text": system.join("\n\n") }]
        });
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), serde_json::json!(t));
    }
    if let Some(m) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), serde_json::json!(m));
    }
    if !generation.is_empty() {
        body["generationConfig"] = serde_json::Value::Object(generation);
    }

    body
}

fn parse_gemini_response(json: &serde_json::Value) -> Result<String> {
    let parts = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .ok_or_else(|| anyhow!("Invalid Gemini response: missing candidates[0].content.parts"))?;

    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join(""))
}
