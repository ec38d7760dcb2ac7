//! Same-site breadth-first crawler.
//!
//! Starting from one URL, the crawler walks every reachable page on the same
//! host (and port), one depth level at a time. Each level is fetched by a
//! bounded worker pool: a [`Semaphore`] caps in-flight requests at
//! `crawl.concurrency` and the tasks live in a [`JoinSet`]. Pages that fail
//! to fetch or scrape are logged and skipped; the crawl only fails when no
//! page at all produced content.
//!
//! Results come back in discovery order, independent of which worker
//! finished first, so repeated crawls of an unchanged site index the same
//! chunks in the same order.

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use scraper::Html;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::{Host, Url};

use crate::config::CrawlConfig;
use crate::extract::{self, fallback_title};
use crate::models::ScrapedPage;
use crate::progress::{CrawlProgressEvent, CrawlProgressReporter};
use crate::scrape::PageScraper;

/// Summary of a finished crawl.
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    /// Pages that produced content, in discovery order.
    pub pages: Vec<ScrapedPage>,
    /// Site title taken from the first page with content.
    pub title: String,
    /// Number of URLs fetched (successfully or not).
    pub visited: usize,
    /// `(url, error)` for every page that was skipped because of an error.
    pub failed: Vec<(String, String)>,
}

/// Result of one worker task.
struct PageResult {
    seq: usize,
    url: Url,
    links: Vec<String>,
    page: Option<ScrapedPage>,
    error: Option<String>,
}

const MAX_REDIRECTS: usize = 5;

pub struct Crawler {
    config: CrawlConfig,
    client: Client,
}

impl Crawler {
    pub fn new(config: &CrawlConfig) -> Result<Self> {
        let allow_private = config.allow_private_hosts;
        let redirects = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if !allow_private && is_private_target(attempt.url()) {
                let target = attempt.url().host_str().unwrap_or_default().to_string();
                attempt.error(format!("redirect to private or loopback host: {target}"))
            } else {
                attempt.follow()
            }
        });

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(redirects)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow!("failed to build HTTP client: {e}"))?;

        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    /// Crawl the site rooted at `start_url`.
    #[instrument(skip_all, fields(start_url = %start_url, scraper = scraper.name()))]
    pub async fn crawl(
        &self,
        start_url: &Url,
        scraper: Arc<dyn PageScraper>,
        reporter: &dyn CrawlProgressReporter,
    ) -> Result<CrawlOutcome> {
        let scope = CrawlScope::new(start_url)?;
        if !self.config.allow_private_hosts && is_private_target(start_url) {
            bail!(
                "Refusing to crawl private or loopback host: {}",
                start_url.host_str().unwrap_or_default()
            );
        }

        info!(
            max_pages = self.config.max_pages,
            max_depth = ?self.config.max_depth,
            concurrency = self.config.concurrency,
            "starting crawl"
        );
        reporter.report(CrawlProgressEvent::Discovering {
            url: start_url.to_string(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(normalize_url(start_url));

        let mut level: Vec<Url> = vec![start_url.clone()];
        let mut depth = 0usize;
        let mut scheduled = 0usize;
        let mut fetched = 0u64;
        let mut pages: Vec<(usize, ScrapedPage)> = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();

        while !level.is_empty() && scheduled < self.config.max_pages {
            let mut workers = JoinSet::new();

            for url in level.drain(..) {
                if scheduled >= self.config.max_pages {
                    break;
                }
                let seq = scheduled;
                scheduled += 1;

                let client = self.client.clone();
                let scope = scope.clone();
                let sem = semaphore.clone();
                let scraper = scraper.clone();
                let delay_ms = self.config.delay_ms;

                workers.spawn(async move {
                    let _permit = sem.acquire_owned().await;
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    process_page(&client, &scope, scraper.as_ref(), seq, url).await
                });
            }

            let mut results = Vec::new();
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => failed.push(("task".to_string(), e.to_string())),
                }
            }
            results.sort_by_key(|r| r.seq);

            let follow_links = self.config.max_depth.map_or(true, |max| depth < max);
            let mut next_level = Vec::new();

            for result in results {
                if let Some(err) = result.error {
                    warn!(url = %result.url, error = %err, "skipping page");
                    failed.push((result.url.to_string(), err));
                    continue;
                }

                fetched += 1;
                reporter.report(CrawlProgressEvent::Fetched {
                    n: fetched,
                    url: result.url.to_string(),
                });

                if follow_links {
                    for link in &result.links {
                        let Ok(link_url) = Url::parse(link) else {
                            continue;
                        };
                        if scope.contains(&link_url) && seen.insert(normalize_url(&link_url)) {
                            next_level.push(link_url);
                        }
                    }
                }

                if let Some(page) = result.page {
                    pages.push((result.seq, page));
                }
            }

            level = next_level;
            depth += 1;
        }

        pages.sort_by_key(|(seq, _)| *seq);
        let pages: Vec<ScrapedPage> = pages.into_iter().map(|(_, p)| p).collect();

        let Some(first) = pages.first() else {
            bail!("Crawl completed, but no content was scraped from any page.");
        };
        let title = first
            .title
            .clone()
            .unwrap_or_else(|| fallback_title(start_url));

        info!(
            pages = pages.len(),
            visited = scheduled,
            failed = failed.len(),
            "crawl completed"
        );

        Ok(CrawlOutcome {
            pages,
            title,
            visited: scheduled,
            failed,
        })
    }
}

/// Fetch one page, collect its links, and scrape its content.
async fn process_page(
    client: &Client,
    scope: &CrawlScope,
    scraper: &dyn PageScraper,
    seq: usize,
    url: Url,
) -> PageResult {
    let mut result = PageResult {
        seq,
        url,
        links: Vec::new(),
        page: None,
        error: None,
    };

    let html = match fetch_html(client, scope, &result.url).await {
        Ok(Some(html)) => html,
        Ok(None) => {
            debug!(url = %result.url, "non-HTML response, skipping content");
            return result;
        }
        Err(e) => {
            result.error = Some(format!("{e:#}"));
            return result;
        }
    };

    result.links = links_in(&html, &result.url);

    match scraper.scrape(&result.url, &html).await {
        Ok(page) => result.page = page,
        Err(e) => {
            // Content failures keep the links so the crawl can continue past this page
            warn!(url = %result.url, error = %e, "scraper failed");
        }
    }

    result
}

/// GET a page. `Ok(None)` for non-HTML content types.
///
/// A redirect that lands outside `scope` is an error, so off-site content
/// is never indexed under an in-site URL.
async fn fetch_html(client: &Client, scope: &CrawlScope, url: &Url) -> Result<Option<String>> {
    debug!(%url, "fetching page");
    let response = client.get(url.as_str()).send().await?;

    if !scope.contains(response.url()) {
        bail!("redirected outside the site to {}", response.url());
    }

    let status = response.status();
    if !status.is_success() {
        bail!("HTTP {}", status);
    }

    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(true, |ct| ct.contains("html"));
    if !is_html {
        return Ok(None);
    }

    Ok(Some(response.text().await?))
}

fn links_in(html: &str, base: &Url) -> Vec<String> {
    let doc = Html::parse_document(html);
    extract::extract_links(&doc, base)
}

/// Which URLs belong to the crawl: same host and port as the start URL.
#[derive(Clone)]
struct CrawlScope {
    host: String,
    port: Option<u16>,
}

impl CrawlScope {
    fn new(start_url: &Url) -> Result<Self> {
        if start_url.scheme() != "http" && start_url.scheme() != "https" {
            bail!("Invalid start URL provided: {}", start_url);
        }
        let host = start_url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow!("Invalid start URL provided: {}", start_url))?;

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port: start_url.port_or_known_default(),
        })
    }

    fn contains(&self, url: &Url) -> bool {
        (url.scheme() == "http" || url.scheme() == "https")
            && url.host_str().map(|h| h.to_ascii_lowercase()).as_deref() == Some(&self.host)
            && url.port_or_known_default() == self.port
    }
}

/// Dedup key: URL without fragment.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);
    normalized.to_string()
}

/// Loopback, private, link-local, or `.local`/`.internal` hosts.
fn is_private_target(url: &Url) -> bool {
    match url.host() {
        Some(Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 (unique local)
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 (link-local)
                || (first & 0xffc0) == 0xfe80
        }
    }
}
