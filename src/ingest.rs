//! URL → session pipeline.
//!
//! Coordinates the full flow for one submitted URL: session creation →
//! page cache lookup or crawl → chunking → embedding → storage. Crawled
//! pages are cached per site (host and port), so a second session for the
//! same site skips the crawl unless a refresh is requested.
//!
//! Any failure after the session exists marks it `failed` with the error
//! text, so clients polling the status see why.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::crawl::Crawler;
use crate::db;
use crate::extract::fallback_title;
use crate::index;
use crate::models::{ScrapedPage, SessionStatus};
use crate::progress::{CrawlProgressEvent, CrawlProgressReporter, NoProgress, ProgressMode};
use crate::scrape::{self, PageScraper};
use crate::session;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid URL provided: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Ignore the page cache and crawl again.
    pub refresh: bool,
}

/// Summary of a processed URL.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub session_id: String,
    pub title: String,
    pub pages: usize,
    pub chunks: u64,
    pub embedded: u64,
    pub cache_hit: bool,
}

/// Parse a submitted URL. Only http(s) URLs with a host are accepted.
pub fn parse_site_url(raw: &str) -> Result<Url, IngestError> {
    let url = Url::parse(raw.trim()).map_err(|_| IngestError::InvalidUrl(raw.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(IngestError::InvalidUrl(raw.to_string()));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(IngestError::InvalidUrl(raw.to_string())),
    }
}

/// Page cache key: lowercase host, plus `:port` when the URL names one.
pub fn cache_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host,
    }
}

/// Cached pages for a site, in crawl order.
pub async fn load_cached_pages(pool: &SqlitePool, domain: &str) -> Result<Vec<ScrapedPage>> {
    let rows = sqlx::query(
        "SELECT url, title, content FROM pages WHERE domain = ? ORDER BY position ASC",
    )
    .bind(domain)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ScrapedPage {
            url: row.get("url"),
            title: row.get("title"),
            content: row.get("content"),
        })
        .collect())
}

/// Replace a site's cached pages and return how many were written.
///
/// Pages whose content hash is unchanged keep their stored content and
/// `fetched_at`; only their position and title are refreshed. Pages no
/// longer present are removed.
pub async fn save_pages(pool: &SqlitePool, domain: &str, pages: &[ScrapedPage]) -> Result<usize> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    let existing: HashMap<String, String> =
        sqlx::query("SELECT url, content_hash FROM pages WHERE domain = ?")
            .bind(domain)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|row| (row.get("url"), row.get("content_hash")))
            .collect();

    let current: HashSet<&str> = pages.iter().map(|p| p.url.as_str()).collect();
    for url in existing.keys().filter(|u| !current.contains(u.as_str())) {
        sqlx::query("DELETE FROM pages WHERE domain = ? AND url = ?")
            .bind(domain)
            .bind(url)
            .execute(&mut *tx)
            .await?;
    }

    let mut written = 0;
    for (position, page) in pages.iter().enumerate() {
        let content_hash = page_hash(&page.content);

        if existing.get(&page.url) == Some(&content_hash) {
            sqlx::query("UPDATE pages SET position = ?, title = ? WHERE domain = ? AND url = ?")
                .bind(position as i64)
                .bind(&page.title)
                .bind(domain)
                .bind(&page.url)
                .execute(&mut *tx)
                .await?;
            continue;
        }

        sqlx::query(
            r#"
            INSERT INTO pages (domain, url, position, title, content, content_hash, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain, url) DO UPDATE SET
                position = excluded.position,
                title = excluded.title,
                content = excluded.content,
                content_hash = excluded.content_hash,
                fetched_at = excluded.fetched_at
            "#,
        )
        .bind(domain)
        .bind(&page.url)
        .bind(position as i64)
        .bind(&page.title)
        .bind(&page.content)
        .bind(&content_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        written += 1;
    }

    tx.commit().await?;
    Ok(written)
}

fn page_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Crawl (or load from cache) and index `url` into a new session.
pub async fn process_url(
    config: &Config,
    pool: &SqlitePool,
    url: &str,
    opts: ProcessOptions,
    reporter: &dyn CrawlProgressReporter,
) -> Result<ProcessOutcome> {
    let start = parse_site_url(url)?;
    let domain = cache_key(&start);
    let session_id = session::create_session(pool, start.as_str(), &domain).await?;

    run_pipeline(config, pool, &session_id, &start, &domain, opts, reporter).await
}

/// Create the session now and process it on a background task.
///
/// Returns the session id immediately; progress is visible through the
/// session status.
pub async fn spawn_process_url(
    config: Arc<Config>,
    pool: SqlitePool,
    url: &str,
    opts: ProcessOptions,
) -> Result<String> {
    let start = parse_site_url(url)?;
    let domain = cache_key(&start);
    let session_id = session::create_session(&pool, start.as_str(), &domain).await?;

    let id = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = run_pipeline(&config, &pool, &id, &start, &domain, opts, &NoProgress).await
        {
            error!(session_id = %id, error = %e, "background processing failed");
        }
    });

    Ok(session_id)
}

async fn run_pipeline(
    config: &Config,
    pool: &SqlitePool,
    session_id: &str,
    start: &Url,
    domain: &str,
    opts: ProcessOptions,
    reporter: &dyn CrawlProgressReporter,
) -> Result<ProcessOutcome> {
    let mut guard = CancelGuard {
        pool: pool.clone(),
        session_id: session_id.to_string(),
        armed: true,
    };
    let result = build_session(config, pool, session_id, start, domain, opts, reporter).await;
    guard.armed = false;

    match result {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            let message = e.to_string();
            if let Err(status_err) =
                session::set_status(pool, session_id, SessionStatus::Failed, Some(&message)).await
            {
                warn!(session_id, error = %status_err, "could not mark session failed");
            }
            Err(e)
        }
    }
}

const CANCELLED: &str = "Processing was cancelled before it finished.";

/// Marks the session failed when the pipeline future is dropped mid-way,
/// e.g. when an HTTP client disconnects during a synchronous crawl.
struct CancelGuard {
    pool: SqlitePool,
    session_id: String,
    armed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let pool = self.pool.clone();
        let id = std::mem::take(&mut self.session_id);
        warn!(session_id = %id, "processing cancelled");
        handle.spawn(async move {
            if let Err(e) =
                session::set_status(&pool, &id, SessionStatus::Failed, Some(CANCELLED)).await
            {
                warn!(session_id = %id, error = %e, "could not mark session failed");
            }
        });
    }
}

async fn build_session(
    config: &Config,
    pool: &SqlitePool,
    session_id: &str,
    start: &Url,
    domain: &str,
    opts: ProcessOptions,
    reporter: &dyn CrawlProgressReporter,
) -> Result<ProcessOutcome> {
    let cached = if opts.refresh {
        Vec::new()
    } else {
        load_cached_pages(pool, domain).await?
    };

    let cache_hit = !cached.is_empty();
    let (pages, title) = if cache_hit {
        info!(session_id, domain, pages = cached.len(), "using cached pages");
        let title = cached
            .first()
            .and_then(|p| p.title.clone())
            .unwrap_or_else(|| fallback_title(start));
        (cached, title)
    } else {
        let scraper: Arc<dyn PageScraper> = Arc::from(scrape::create_scraper(
            &config.scrape,
            config.crawl.min_line_words,
        )?);
        let crawler = Crawler::new(&config.crawl)?;
        let outcome = crawler.crawl(start, scraper, reporter).await?;
        let written = save_pages(pool, domain, &outcome.pages).await?;
        info!(session_id, domain, written, "page cache updated");
        (outcome.pages, outcome.title)
    };

    session::set_status(pool, session_id, SessionStatus::Indexing, None).await?;
    reporter.report(CrawlProgressEvent::Indexing {
        pages: pages.len() as u64,
    });

    let stats = index::index_session(config, pool, session_id, &pages).await?;
    session::set_result(
        pool,
        session_id,
        &title,
        pages.len() as i64,
        stats.chunks as i64,
    )
    .await?;

    Ok(ProcessOutcome {
        session_id: session_id.to_string(),
        title,
        pages: pages.len(),
        chunks: stats.chunks,
        embedded: stats.embedded,
        cache_hit,
    })
}

/// CLI entry point for `sitechat crawl`.
pub async fn run_crawl(
    config: &Config,
    url: &str,
    refresh: bool,
    progress: ProgressMode,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let reporter = progress.reporter();

    let result = process_url(
        config,
        &pool,
        url,
        ProcessOptions { refresh },
        reporter.as_ref(),
    )
    .await;
    pool.close().await;
    let outcome = result?;

    println!("session: {}", outcome.session_id);
    println!("title: {}", outcome.title);
    println!("pages: {}", outcome.pages);
    println!("chunks: {}", outcome.chunks);
    if config.embedding.is_enabled() {
        println!("embedded: {}", outcome.embedded);
    }
    if outcome.cache_hit {
        println!("cache: hit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_config, test_pool};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn crawl_config() -> Config {
        let mut config = test_config();
        config.crawl.allow_private_hosts = true;
        config
    }

    async fn mount_site(server: &MockServer, expected_hits: u64) {
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><head><title>Bakery</title></head><body>\
                 <p>Fresh sourdough bread is baked every single morning.</p>\
                 <a href=\"/hours\">Hours</a></body></html>", "text/html"
            ))
            .expect(expected_hits)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/hours"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                "<html><body><p>We are open from seven until three daily.</p></body></html>", "text/html"
            ))
            .mount(server)
            .await;
    }

    #[test]
    fn url_validation() {
        assert!(parse_site_url("https://example.com").is_ok());
        assert!(parse_site_url("ftp://example.com").is_err());
        assert!(parse_site_url("not a url").is_err());
        assert!(parse_site_url("mailto:someone@example.com").is_err());
    }

    #[test]
    fn cache_key_includes_explicit_port() {
        let url = Url::parse("http://Example.com:8080/docs").unwrap();
        assert_eq!(cache_key(&url), "example.com:8080");
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(cache_key(&url), "example.com");
    }

    #[tokio::test]
    async fn page_cache_roundtrip_preserves_order() {
        let pool = test_pool().await;
        let pages = vec![
            ScrapedPage {
                url: "https://a.com/z".into(),
                title: None,
                content: "last alphabetically".into(),
            },
            ScrapedPage {
                url: "https://a.com/a".into(),
                title: Some("A".into()),
                content: "first alphabetically".into(),
            },
        ];
        save_pages(&pool, "a.com", &pages).await.unwrap();
        assert_eq!(load_cached_pages(&pool, "a.com").await.unwrap(), pages);

        assert_eq!(save_pages(&pool, "a.com", &pages[..1]).await.unwrap(), 0);
        assert_eq!(load_cached_pages(&pool, "a.com").await.unwrap().len(), 1);
        assert!(load_cached_pages(&pool, "b.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unchanged_pages_are_not_rewritten() {
        let pool = test_pool().await;
        let page = |url: &str, content: &str| ScrapedPage {
            url: url.into(),
            title: None,
            content: content.into(),
        };
        let first = vec![page("https://a.com/", "home"), page("https://a.com/b", "old")];
        assert_eq!(save_pages(&pool, "a.com", &first).await.unwrap(), 2);

        sqlx::query("UPDATE pages SET fetched_at = 1 WHERE domain = 'a.com'")
            .execute(&pool)
            .await
            .unwrap();

        let second = vec![page("https://a.com/b", "new"), page("https://a.com/", "home")];
        assert_eq!(save_pages(&pool, "a.com", &second).await.unwrap(), 1);
        assert_eq!(load_cached_pages(&pool, "a.com").await.unwrap(), second);

        let home_fetched: i64 =
            sqlx::query_scalar("SELECT fetched_at FROM pages WHERE url = 'https://a.com/'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(home_fetched, 1);
    }

    #[tokio::test]
    async fn cancelled_processing_marks_session_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body><p>Slow pages still have real words.</p></body></html>", "text/html")
                    .set_delay(std::time::Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let pool = test_pool().await;
        let config = crawl_config();

        let uri = server.uri();
        let run = process_url(&config, &pool, &uri, ProcessOptions::default(), &NoProgress);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(300), run)
            .await
            .is_err());

        let id = session::list_sessions(&pool, 10).await.unwrap()[0]
            .session_id
            .clone();
        let mut s = session::get_session(&pool, &id).await.unwrap().unwrap();
        for _ in 0..40 {
            if s.status == SessionStatus::Failed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            s = session::get_session(&pool, &id).await.unwrap().unwrap();
        }
        assert_eq!(s.status, SessionStatus::Failed);
        assert_eq!(s.error.as_deref(), Some(CANCELLED));
    }

    #[tokio::test]
    async fn process_url_crawls_then_uses_cache() {
        let server = MockServer::start().await;
        mount_site(&server, 2).await;
        let pool = test_pool().await;
        let config = crawl_config();

        let first = process_url(&config, &pool, &server.uri(), ProcessOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert_eq!(first.title, "Bakery");
        assert_eq!(first.pages, 2);
        assert!(first.chunks >= 2);
        assert!(!first.cache_hit);

        let s = session::get_session(&pool, &first.session_id).await.unwrap().unwrap();
        assert_eq!(s.status, SessionStatus::Ready);
        assert_eq!(s.page_count, 2);

        let second = process_url(&config, &pool, &server.uri(), ProcessOptions::default(), &NoProgress)
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.title, "Bakery");
        assert_ne!(second.session_id, first.session_id);

        let refreshed = process_url(
            &config,
            &pool,
            &server.uri(),
            ProcessOptions { refresh: true },
            &NoProgress,
        )
        .await
        .unwrap();
        assert!(!refreshed.cache_hit);
        // `/` fetched exactly twice: first crawl and refresh.
    }

    #[tokio::test]
    async fn failure_marks_session_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let pool = test_pool().await;

        let err = process_url(&crawl_config(), &pool, &server.uri(), ProcessOptions::default(), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no content was scraped"));

        let sessions = session::list_sessions(&pool, 10).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].status, SessionStatus::Failed);
        let s = session::get_session(&pool, &sessions[0].session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(s.error.unwrap().contains("no content was scraped"));
    }

    #[tokio::test]
    async fn invalid_url_creates_no_session() {
        let pool = test_pool().await;
        let err = process_url(&test_config(), &pool, "file:///etc", ProcessOptions::default(), &NoProgress)
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<IngestError>().is_some());
        assert!(session::list_sessions(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn background_processing_reaches_ready() {
        let server = MockServer::start().await;
        mount_site(&server, 1).await;
        let pool = test_pool().await;

        let id = spawn_process_url(
            Arc::new(crawl_config()),
            pool.clone(),
            &server.uri(),
            ProcessOptions::default(),
        )
        .await
        .unwrap();

        let mut status = SessionStatus::Crawling;
        for _ in 0..100 {
            status = session::get_session(&pool, &id).await.unwrap().unwrap().status;
            if status == SessionStatus::Ready || status == SessionStatus::Failed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(status, SessionStatus::Ready);
    }
}
