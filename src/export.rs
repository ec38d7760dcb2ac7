//! Export a crawled site as a JSON text corpus.
//!
//! Produces one entry per cached page of the session's site with the page
//! text normalized by [`clean_text`] (lowercase, plain punctuation, single
//! spaces). Suitable as a small training or evaluation corpus.

use anyhow::Result;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::Path;

use crate::config::Config;
use crate::db;
use crate::extract::clean_text;
use crate::ingest;
use crate::session;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CorpusEntry {
    pub url: String,
    pub text: String,
}

/// Cleaned text of every cached page for the session's site, in crawl order.
/// Pages whose text is empty after cleaning are dropped.
pub async fn export_corpus(pool: &SqlitePool, session_id: &str) -> Result<Vec<CorpusEntry>> {
    let session = session::require_session(pool, session_id).await?;
    let pages = ingest::load_cached_pages(pool, &session.domain).await?;

    Ok(pages
        .into_iter()
        .map(|page| CorpusEntry {
            url: page.url,
            text: clean_text(&page.content),
        })
        .filter(|entry| !entry.text.is_empty())
        .collect())
}

/// CLI entry point for `sitechat export`.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, session_id: &str, output: Option<&Path>) -> Result<()> {
    let pool = db::connect(config).await?;
    let corpus = export_corpus(&pool, session_id).await;
    pool.close().await;
    let corpus = corpus?;

    let json = serde_json::to_string_pretty(&corpus)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, &json)?;
            eprintln!("Exported {} pages to {}", corpus.len(), path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::ScrapedPage;

    #[tokio::test]
    async fn corpus_uses_cleaned_cached_pages() {
        let pool = test_pool().await;
        let id = session::create_session(&pool, "https://a.com/", "a.com")
            .await
            .unwrap();
        ingest::save_pages(
            &pool,
            "a.com",
            &[
                ScrapedPage {
                    url: "https://a.com/".into(),
                    title: None,
                    content: "Hello   World!\n★ Welcome".into(),
                },
                ScrapedPage {
                    url: "https://a.com/icons".into(),
                    title: None,
                    content: "★ ★ ★".into(),
                },
            ],
        )
        .await
        .unwrap();

        let corpus = export_corpus(&pool, &id).await.unwrap();
        assert_eq!(
            corpus,
            vec![CorpusEntry {
                url: "https://a.com/".into(),
                text: "hello world! welcome".into(),
            }]
        );
    }

    #[tokio::test]
    async fn unknown_session_is_error() {
        let pool = test_pool().await;
        assert!(export_corpus(&pool, "nope").await.is_err());
    }
}
