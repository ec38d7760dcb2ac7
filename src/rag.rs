//! History-aware question answering over a session's chunks.
//!
//! Answering a question takes two model calls when the session already has
//! a conversation:
//!
//! 1. **Condense**: the chat history and the new question are rewritten into
//!    a standalone question, so follow-ups like "and how much does it cost?"
//!    retrieve the right chunks.
//! 2. **Answer**: the top-k chunks for the standalone question are placed in
//!    the system prompt, followed by the history and the original question.
//!
//! Without history the question is used for retrieval as is.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::Config;
use crate::db;
use crate::llm::{self, ChatMessage};
use crate::models::{RetrievedChunk, SessionStatus, Turn};
use crate::search;
use crate::session::{self, SessionError};

pub const CONTEXTUALIZE_PROMPT: &str = "Given a chat history and the latest user question \
which might reference context in the chat history, formulate a standalone question which can \
be understood without the chat history. Do NOT answer the question, just reformulate it if \
needed and otherwise return it as is.";

pub const QA_PROMPT: &str = "You are a helpful assistant. If you don't know the answer, just \
say that you don't know. Answer the user's question based only on the following context:\n\n";

pub const FALLBACK_ANSWER: &str = "Sorry, I couldn't generate an answer.";

const NO_CONTEXT: &str = "(no relevant content was found on this site)";

#[derive(Debug, Error)]
pub enum AskError {
    #[error("Question must not be empty.")]
    EmptyQuestion,
}

/// A generated answer and where it came from.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub standalone_question: String,
    /// Page URLs of the retrieved chunks, best first, without duplicates.
    pub sources: Vec<String>,
}

/// The last `max_turns` turns as alternating user/assistant messages.
pub fn history_messages(turns: &[Turn], max_turns: usize) -> Vec<ChatMessage> {
    let start = turns.len().saturating_sub(max_turns);
    turns[start..]
        .iter()
        .flat_map(|t| {
            [
                ChatMessage::user(t.question.clone()),
                ChatMessage::assistant(t.answer.clone()),
            ]
        })
        .collect()
}

/// Rewrite `question` into a standalone question using `history`.
pub async fn condense_question(
    config: &Config,
    history: &[ChatMessage],
    question: &str,
) -> Result<String> {
    if history.is_empty() {
        return Ok(question.to_string());
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(CONTEXTUALIZE_PROMPT));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(question));

    let rewritten = llm::complete(&config.llm, &messages).await?;
    let rewritten = rewritten.trim();
    if rewritten.is_empty() {
        Ok(question.to_string())
    } else {
        Ok(rewritten.to_string())
    }
}

/// Render retrieved chunks for the system prompt.
pub fn format_context(chunks: &[RetrievedChunk]) -> String {
    if chunks.is_empty() {
        return NO_CONTEXT.to_string();
    }

    chunks
        .iter()
        .map(|c| match &c.page_title {
            Some(title) => format!("Source: {} ({})\n{}", c.page_url, title, c.text),
            None => format!("Source: {}\n{}", c.page_url, c.text),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn unique_sources(chunks: &[RetrievedChunk]) -> Vec<String> {
    let mut sources: Vec<String> = Vec::new();
    for c in chunks {
        if !sources.contains(&c.page_url) {
            sources.push(c.page_url.clone());
        }
    }
    sources
}

/// Answer `question` for a ready session and record the turn.
pub async fn answer_question(
    config: &Config,
    pool: &SqlitePool,
    session_id: &str,
    question: &str,
) -> Result<Answer> {
    let session = session::require_session(pool, session_id).await?;
    if session.status != SessionStatus::Ready {
        return Err(SessionError::NotReady {
            id: session_id.to_string(),
            status: session.status,
        }
        .into());
    }

    let question = question.trim();
    if question.is_empty() {
        return Err(AskError::EmptyQuestion.into());
    }
    if !config.llm.is_enabled() {
        bail!("LLM provider is disabled. Set [llm] provider in config.");
    }
    let provider = llm::create_chat_provider(&config.llm)?;

    let turns = session::conversation(pool, session_id).await?;
    let history = history_messages(&turns, config.llm.history_turns);

    let standalone = condense_question(config, &history, question).await?;
    debug!(session_id, standalone = %standalone, "condensed question");

    let mode = search::resolve_mode(config, None)?;
    let chunks = search::retrieve(
        config,
        pool,
        session_id,
        &standalone,
        mode,
        config.retrieval.top_k,
    )
    .await?;

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(format!(
        "{}{}",
        QA_PROMPT,
        format_context(&chunks)
    )));
    messages.extend(history);
    messages.push(ChatMessage::user(question));

    let reply = llm::complete(&config.llm, &messages).await?;
    let answer = match reply.trim() {
        "" => FALLBACK_ANSWER.to_string(),
        text => text.to_string(),
    };

    session::append_turn(pool, session_id, question, &answer).await?;
    info!(
        session_id,
        chunks = chunks.len(),
        mode = mode.as_str(),
        provider = provider.name(),
        model = provider.model(),
        "answered question"
    );

    Ok(Answer {
        answer,
        standalone_question: standalone,
        sources: unique_sources(&chunks),
    })
}

/// CLI entry point for `sitechat ask`.
pub async fn run_ask(config: &Config, session_id: &str, question: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = answer_question(config, &pool, session_id, question).await;
    pool.close().await;
    let answer = result?;

    println!("{}", answer.answer);
    if !answer.sources.is_empty() {
        println!();
        println!("sources:");
        for url in &answer.sources {
            println!("  {}", url);
        }
    }
    Ok(())
}
