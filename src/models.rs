//! Core data models shared by the crawl, index, and chat pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cleaned content of one crawled page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
}

/// Lifecycle of a chat session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Crawling,
    Indexing,
    Ready,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Crawling => "crawling",
            SessionStatus::Indexing => "indexing",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "crawling" => Some(SessionStatus::Crawling),
            "indexing" => Some(SessionStatus::Indexing),
            "ready" => Some(SessionStatus::Ready),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A crawled site and its chat state.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub page_count: i64,
    pub chunk_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Row of the session listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub created_at: i64,
}

/// One question/answer exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
    /// ISO 8601 UTC.
    pub timestamp: String,
}

/// A piece of page text stored for retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub session_id: String,
    pub page_url: String,
    pub page_title: Option<String>,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk selected for a question, with its retrieval score.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub chunk_index: i64,
    pub page_url: String,
    pub page_title: Option<String>,
    pub text: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_text_roundtrip() {
        for s in [
            SessionStatus::Crawling,
            SessionStatus::Indexing,
            SessionStatus::Ready,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionStatus::parse("done"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Ready).unwrap();
        assert_eq!(json, "\"ready\"");
    }
}
