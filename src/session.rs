//! Chat sessions: one crawled site plus its conversation.
//!
//! A session is created as `crawling` when a URL is submitted, moves to
//! `indexing` once pages are in hand, and ends as `ready` or `failed`.
//! Questions are only accepted on `ready` sessions.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::{Session, SessionStatus, SessionSummary, Turn};

/// Default cap on [`list_sessions`].
pub const LIST_LIMIT: i64 = 100;

/// Lookup failures callers map to specific responses (404 / 409).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found.")]
    NotFound(String),
    #[error("Session {id} is not ready (status: {status}).")]
    NotReady { id: String, status: SessionStatus },
}

/// A session with its full conversation, as returned by `show` and
/// `GET /session/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionDetails {
    #[serde(flatten)]
    pub session: Session,
    pub conversation: Vec<Turn>,
}

/// Insert a new `crawling` session and return its id.
pub async fn create_session(pool: &SqlitePool, url: &str, domain: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO sessions (id, url, domain, title, status, error, page_count, chunk_count, created_at, updated_at)
        VALUES (?, ?, ?, NULL, ?, NULL, 0, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(url)
    .bind(domain)
    .bind(SessionStatus::Crawling.as_str())
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: SessionStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE sessions SET status = ?, error = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a finished crawl and mark the session `ready`.
pub async fn set_result(
    pool: &SqlitePool,
    id: &str,
    title: &str,
    page_count: i64,
    chunk_count: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sessions
        SET title = ?, page_count = ?, chunk_count = ?, status = ?, error = NULL, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(title)
    .bind(page_count)
    .bind(chunk_count)
    .bind(SessionStatus::Ready.as_str())
    .bind(chrono::Utc::now().timestamp())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_session(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let row = sqlx::query(
        r#"
        SELECT id, url, domain, title, status, error, page_count, chunk_count, created_at, updated_at
        FROM sessions WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let status: String = row.get("status");
        Session {
            session_id: row.get("id"),
            url: row.get("url"),
            domain: row.get("domain"),
            title: row.get("title"),
            status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
            error: row.get("error"),
            page_count: row.get("page_count"),
            chunk_count: row.get("chunk_count"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }))
}

/// Like [`get_session`], but a missing session is a [`SessionError::NotFound`].
pub async fn require_session(pool: &SqlitePool, id: &str) -> Result<Session> {
    get_session(pool, id)
        .await?
        .ok_or_else(|| SessionError::NotFound(id.to_string()).into())
}

/// Sessions newest first.
pub async fn list_sessions(pool: &SqlitePool, limit: i64) -> Result<Vec<SessionSummary>> {
    let rows = sqlx::query(
        r#"
        SELECT id, title, status, created_at
        FROM sessions
        ORDER BY created_at DESC, rowid DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let status: String = row.get("status");
            SessionSummary {
                session_id: row.get("id"),
                title: row.get("title"),
                status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Failed),
                created_at: row.get("created_at"),
            }
        })
        .collect())
}

/// Conversation turns, oldest first.
pub async fn conversation(pool: &SqlitePool, id: &str) -> Result<Vec<Turn>> {
    let rows = sqlx::query(
        "SELECT question, answer, created_at FROM turns WHERE session_id = ? ORDER BY id ASC",
    )
    .bind(id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let created_at: i64 = row.get("created_at");
            Turn {
                question: row.get("question"),
                answer: row.get("answer"),
                timestamp: format_ts_iso(created_at),
            }
        })
        .collect())
}

pub async fn append_turn(pool: &SqlitePool, id: &str, question: &str, answer: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query("INSERT INTO turns (session_id, question, answer, created_at) VALUES (?, ?, ?, ?)")
        .bind(id)
        .bind(question)
        .bind(answer)
        .bind(now)
        .execute(pool)
        .await?;
    sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn session_details(pool: &SqlitePool, id: &str) -> Result<SessionDetails> {
    let session = require_session(pool, id).await?;
    let conversation = conversation(pool, id).await?;
    Ok(SessionDetails {
        session,
        conversation,
    })
}

/// Delete a session with its turns, chunks, and vectors. The domain's page
/// cache is kept. Returns `false` when no such session exists.
pub async fn delete_session(pool: &SqlitePool, id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE session_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE session_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE session_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM turns WHERE session_id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    let deleted = sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(deleted > 0)
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// CLI entry point for `sitechat sessions`.
pub async fn run_sessions(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let sessions = list_sessions(&pool, LIST_LIMIT).await?;

    if sessions.is_empty() {
        println!("No sessions.");
    } else {
        println!("{:<38} {:<10} {:<20} TITLE", "SESSION", "STATUS", "CREATED");
        for s in &sessions {
            let created = chrono::DateTime::from_timestamp(s.created_at, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!(
                "{:<38} {:<10} {:<20} {}",
                s.session_id,
                s.status.as_str(),
                created,
                s.title.as_deref().unwrap_or("-")
            );
        }
    }

    pool.close().await;
    Ok(())
}

/// CLI entry point for `sitechat show`.
pub async fn run_show(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let details = session_details(&pool, id).await;
    pool.close().await;
    let details = details?;

    let s = &details.session;
    println!("session: {}", s.session_id);
    println!("url: {}", s.url);
    println!("title: {}", s.title.as_deref().unwrap_or("-"));
    println!("status: {}", s.status);
    if let Some(err) = &s.error {
        println!("error: {}", err);
    }
    println!("pages: {}", s.page_count);
    println!("chunks: {}", s.chunk_count);

    if !details.conversation.is_empty() {
        println!();
        for turn in &details.conversation {
            println!("[{}]", turn.timestamp);
            println!("Q: {}", turn.question);
            println!("A: {}", turn.answer);
            println!();
        }
    }

    Ok(())
}

/// CLI entry point for `sitechat delete`.
pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let deleted = delete_session(&pool, id).await;
    pool.close().await;

    if !deleted? {
        return Err(SessionError::NotFound(id.to_string()).into());
    }
    println!("Deleted session {}", id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn create_and_fetch() {
        let pool = test_pool().await;
        let id = create_session(&pool, "https://example.com/", "example.com")
            .await
            .unwrap();

        let s = get_session(&pool, &id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Crawling);
        assert_eq!(s.domain, "example.com");
        assert!(s.title.is_none());
        assert!(get_session(&pool, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn require_session_reports_not_found() {
        let pool = test_pool().await;
        let err = require_session(&pool, "missing").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SessionError>(),
            Some(SessionError::NotFound(_))
        ));
        assert_eq!(err.to_string(), "Session not found.");
    }

    #[tokio::test]
    async fn status_transitions() {
        let pool = test_pool().await;
        let id = create_session(&pool, "https://example.com/", "example.com")
            .await
            .unwrap();

        set_status(&pool, &id, SessionStatus::Failed, Some("timeout"))
            .await
            .unwrap();
        let s = get_session(&pool, &id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.error.as_deref(), Some("timeout"));

        set_result(&pool, &id, "Example", 3, 12).await.unwrap();
        let s = get_session(&pool, &id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Ready);
        assert_eq!(s.title.as_deref(), Some("Example"));
        assert_eq!(s.page_count, 3);
        assert_eq!(s.chunk_count, 12);
        assert!(s.error.is_none());
    }

    #[tokio::test]
    async fn list_newest_first_with_limit() {
        let pool = test_pool().await;
        let first = create_session(&pool, "https://a.com/", "a.com").await.unwrap();
        let second = create_session(&pool, "https://b.com/", "b.com").await.unwrap();

        let all = list_sessions(&pool, LIST_LIMIT).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, second);
        assert_eq!(all[1].session_id, first);

        assert_eq!(list_sessions(&pool, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conversation_in_order() {
        let pool = test_pool().await;
        let id = create_session(&pool, "https://a.com/", "a.com").await.unwrap();
        append_turn(&pool, &id, "q1", "a1").await.unwrap();
        append_turn(&pool, &id, "q2", "a2").await.unwrap();

        let turns = conversation(&pool, &id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].question, "q1");
        assert_eq!(turns[1].answer, "a2");
        assert!(turns[0].timestamp.contains('T'));

        let details = session_details(&pool, &id).await.unwrap();
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["session_id"], id);
        assert_eq!(json["conversation"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_everything_but_cache() {
        let pool = test_pool().await;
        let id = create_session(&pool, "https://a.com/", "a.com").await.unwrap();
        append_turn(&pool, &id, "q", "a").await.unwrap();

        assert!(delete_session(&pool, &id).await.unwrap());
        assert!(get_session(&pool, &id).await.unwrap().is_none());
        assert!(conversation(&pool, &id).await.unwrap().is_empty());
        assert!(!delete_session(&pool, &id).await.unwrap());
    }
}
