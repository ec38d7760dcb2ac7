//! Chunk storage and embedding maintenance.
//!
//! [`index_session`] turns crawled pages into stored chunks (plus their FTS5
//! rows) and embeds them inline. Embedding is best effort: a provider outage
//! leaves chunks keyword-searchable and counted as pending, to be filled in
//! later by [`embed_pending`].

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::chunk;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::{Chunk, ScrapedPage};

/// Result of indexing one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub chunks: u64,
    pub embedded: u64,
    pub pending: u64,
}

/// Result of an `embed pending` / `embed rebuild` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmbedReport {
    pub total: u64,
    pub embedded: u64,
    pub failed: u64,
}

/// Chunk `pages`, replace the session's stored chunks, and embed them.
pub async fn index_session(
    config: &Config,
    pool: &SqlitePool,
    session_id: &str,
    pages: &[ScrapedPage],
) -> Result<IndexStats> {
    let chunks = chunk::chunk_pages(session_id, pages, &config.chunking);
    replace_chunks(pool, session_id, &chunks).await?;

    let (embedded, pending) = embed_chunks_inline(config, pool, &chunks).await;
    info!(
        session_id,
        chunks = chunks.len(),
        embedded,
        pending,
        "indexed session"
    );

    Ok(IndexStats {
        chunks: chunks.len() as u64,
        embedded,
        pending,
    })
}

async fn replace_chunks(pool: &SqlitePool, session_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks_fts WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE session_id = ?")
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, session_id, page_url, page_title, chunk_index, text, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.session_id)
        .bind(&chunk.page_url)
        .bind(&chunk.page_title)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, session_id, text) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.session_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Embed freshly stored chunks. Non-fatal on failure: returns
/// `(embedded, pending)`.
async fn embed_chunks_inline(config: &Config, pool: &SqlitePool, chunks: &[Chunk]) -> (u64, u64) {
    if !config.embedding.is_enabled() || chunks.is_empty() {
        return (0, 0);
    }

    let provider = match embedding::create_provider(&config.embedding) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "could not create embedding provider");
            return (0, chunks.len() as u64);
        }
    };

    let model_name = provider.model_name().to_string();
    let mut embedded = 0u64;
    let mut pending = 0u64;

    for batch in chunks.chunks(config.embedding.batch_size) {
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

        match embedding::embed_texts(provider.as_ref(), &config.embedding, &texts).await {
            Ok(vectors) => {
                for (chunk, vec) in batch.iter().zip(vectors.iter()) {
                    let stored = upsert_vector(
                        pool,
                        &chunk.id,
                        &chunk.session_id,
                        &model_name,
                        provider.dims(),
                        &chunk.hash,
                        &embedding::vec_to_blob(vec),
                    )
                    .await;
                    match stored {
                        Ok(()) => embedded += 1,
                        Err(e) => {
                            warn!(chunk_id = %chunk.id, error = %e, "failed to store embedding");
                            pending += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "embedding batch failed");
                pending += batch.len() as u64;
            }
        }
    }

    (embedded, pending)
}

/// Embed chunks whose vector is missing, stale, or from another model.
pub async fn embed_pending(
    config: &Config,
    pool: &SqlitePool,
    session_id: Option<&str>,
    limit: Option<usize>,
) -> Result<EmbedReport> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;
    let pending = find_pending_chunks(pool, provider.model_name(), session_id, limit).await?;
    embed_batches(config, pool, provider.as_ref(), &pending).await
}

/// Delete every stored vector and embed all chunks again.
pub async fn embed_rebuild(config: &Config, pool: &SqlitePool) -> Result<EmbedReport> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let provider = embedding::create_provider(&config.embedding)?;

    sqlx::query("DELETE FROM chunk_vectors")
        .execute(pool)
        .await?;
    info!("cleared existing embeddings");

    let all = find_pending_chunks(pool, provider.model_name(), None, None).await?;
    embed_batches(config, pool, provider.as_ref(), &all).await
}

async fn embed_batches(
    config: &Config,
    pool: &SqlitePool,
    provider: &dyn embedding::EmbeddingProvider,
    pending: &[PendingChunk],
) -> Result<EmbedReport> {
    let mut report = EmbedReport {
        total: pending.len() as u64,
        ..EmbedReport::default()
    };

    for batch in pending.chunks(config.embedding.batch_size) {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();

        match embedding::embed_texts(provider, &config.embedding, &texts).await {
            Ok(vectors) => {
                for (item, vec) in batch.iter().zip(vectors.iter()) {
                    upsert_vector(
                        pool,
                        &item.chunk_id,
                        &item.session_id,
                        provider.model_name(),
                        provider.dims(),
                        &item.hash,
                        &embedding::vec_to_blob(vec),
                    )
                    .await?;
                    report.embedded += 1;
                }
            }
            Err(e) => {
                warn!(error = %e, "embedding batch failed");
                report.failed += batch.len() as u64;
            }
        }
    }

    Ok(report)
}

struct PendingChunk {
    chunk_id: String,
    session_id: String,
    text: String,
    hash: String,
}

async fn find_pending_chunks(
    pool: &SqlitePool,
    model: &str,
    session_id: Option<&str>,
    limit: Option<usize>,
) -> Result<Vec<PendingChunk>> {
    let limit_val = limit.map_or(i64::MAX, |l| l as i64);

    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.session_id, c.text, c.hash
        FROM chunks c
        LEFT JOIN chunk_vectors v ON v.chunk_id = c.id AND v.model = ?
        WHERE (v.chunk_id IS NULL OR v.hash != c.hash)
          AND (? IS NULL OR c.session_id = ?)
        ORDER BY c.session_id, c.chunk_index
        LIMIT ?
        "#,
    )
    .bind(model)
    .bind(session_id)
    .bind(session_id)
    .bind(limit_val)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| PendingChunk {
            chunk_id: row.get("chunk_id"),
            session_id: row.get("session_id"),
            text: row.get("text"),
            hash: row.get("hash"),
        })
        .collect())
}

async fn upsert_vector(
    pool: &SqlitePool,
    chunk_id: &str,
    session_id: &str,
    model: &str,
    dims: usize,
    hash: &str,
    blob: &[u8],
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO chunk_vectors (chunk_id, session_id, model, dims, hash, embedding, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            session_id = excluded.session_id,
            model = excluded.model,
            dims = excluded.dims,
            hash = excluded.hash,
            embedding = excluded.embedding,
            created_at = excluded.created_at
        "#,
    )
    .bind(chunk_id)
    .bind(session_id)
    .bind(model)
    .bind(dims as i64)
    .bind(hash)
    .bind(blob)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// CLI entry point for `sitechat embed pending`.
pub async fn run_embed_pending(
    config: &Config,
    session_id: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = embed_pending(config, &pool, session_id, limit).await?;

    println!("embed pending");
    if report.total == 0 {
        println!("  all chunks up to date");
    } else {
        println!("  total pending: {}", report.total);
        println!("  embedded: {}", report.embedded);
        println!("  failed: {}", report.failed);
    }

    pool.close().await;
    Ok(())
}

/// CLI entry point for `sitechat embed rebuild`.
pub async fn run_embed_rebuild(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let report = embed_rebuild(config, &pool).await?;

    println!("embed rebuild");
    println!("  total chunks: {}", report.total);
    println!("  embedded: {}", report.embedded);
    println!("  failed: {}", report.failed);

    pool.close().await;
    Ok(())
}
