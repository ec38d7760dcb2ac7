//! Page content scrapers.
//!
//! The crawler always fetches HTML itself (it needs the links), but the text
//! that gets indexed can come from two places:
//!
//! - **[`HtmlScraper`]** extracts prose from the HTML already in hand.
//! - **[`FirecrawlScraper`]** asks the Firecrawl API for a clean Markdown
//!   rendering of the page (main content only), at one API call per page.
//!
//! Use [`create_scraper`] to pick one from configuration.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::config::ScrapeConfig;
use crate::extract;
use crate::models::ScrapedPage;

/// Produces indexable content for a fetched page.
#[async_trait]
pub trait PageScraper: Send + Sync {
    /// Short identifier used in logs (`"html"`, `"firecrawl"`).
    fn name(&self) -> &str;

    /// Scrape one page. `html` is the body the crawler already fetched.
    ///
    /// Returns `Ok(None)` when the page has no usable content.
    async fn scrape(&self, url: &Url, html: &str) -> Result<Option<ScrapedPage>>;
}

/// Local extraction from fetched HTML.
pub struct HtmlScraper {
    min_line_words: usize,
}

impl HtmlScraper {
    pub fn new(min_line_words: usize) -> Self {
        Self { min_line_words }
    }
}

#[async_trait]
impl PageScraper for HtmlScraper {
    fn name(&self) -> &str {
        "html"
    }

    async fn scrape(&self, url: &Url, html: &str) -> Result<Option<ScrapedPage>> {
        let page = extract::extract_page(html, url, self.min_line_words);
        if page.text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(ScrapedPage {
            url: url.to_string(),
            title: page.title,
            content: page.text,
        }))
    }
}

/// Firecrawl `/v1/scrape` client. Requires `FIRECRAWL_API_KEY`.
pub struct FirecrawlScraper {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout_ms: u64,
    only_main_content: bool,
}

impl FirecrawlScraper {
    pub fn new(config: &ScrapeConfig) -> Result<Self> {
        let api_key = std::env::var("FIRECRAWL_API_KEY")
            .map_err(|_| anyhow!("FIRECRAWL_API_KEY environment variable not set"))?;
        Self::with_key(config, api_key)
    }

    pub fn with_key(config: &ScrapeConfig, api_key: String) -> Result<Self> {
        // Leave headroom over the server-side timeout we request.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs + 10))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_ms: config.timeout_secs * 1000,
            only_main_content: config.only_main_content,
        })
    }
}

#[async_trait]
impl PageScraper for FirecrawlScraper {
    fn name(&self) -> &str {
        "firecrawl"
    }

    async fn scrape(&self, url: &Url, _html: &str) -> Result<Option<ScrapedPage>> {
        let body = serde_json::json!({
            "url": url.as_str(),
            "formats": ["markdown"],
            "onlyMainContent": self.only_main_content,
            "timeout": self.timeout_ms,
        });

        let response = self
            .client
            .post(format!("{}/v1/scrape", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Firecrawl API error {}: {}", status, text);
        }

        let json: serde_json::Value = response.json().await?;
        Ok(parse_firecrawl_response(url, &json))
    }
}

fn parse_firecrawl_response(url: &Url, json: &serde_json::Value) -> Option<ScrapedPage> {
    let data = json.get("data")?;
    let markdown = data.get("markdown").and_then(|m| m.as_str())?.trim();
    if markdown.is_empty() {
        return None;
    }

    let title = data
        .get("metadata")
        .and_then(|m| m.get("title"))
        .and_then(|t| t.as_str())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    Some(ScrapedPage {
        url: url.to_string(),
        title,
        content: markdown.to_string(),
    })
}

/// Create the scraper named by `scrape.provider`.
pub fn create_scraper(config: &ScrapeConfig, min_line_words: usize) -> Result<Box<dyn PageScraper>> {
    match config.provider.as_str() {
        "html" => Ok(Box::new(HtmlScraper::new(min_line_words))),
        "firecrawl" => Ok(Box::new(FirecrawlScraper::new(config)?)),
        other => bail!("Unknown scrape provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page_url() -> Url {
        Url::parse("https://example.com/guide").unwrap()
    }

    #[tokio::test]
    async fn html_scraper_extracts_prose() {
        let scraper = HtmlScraper::new(4);
        let html = "<html><head><title>Guide</title></head><body>\
                    <p>This guide explains how the widget pipeline works.</p></body></html>";
        let page = scraper.scrape(&page_url(), html).await.unwrap().unwrap();
        assert_eq!(page.title.as_deref(), Some("Guide"));
        assert!(page.content.contains("widget pipeline"));
    }

    #[tokio::test]
    async fn html_scraper_returns_none_for_empty_page() {
        let scraper = HtmlScraper::new(4);
        let page = scraper
            .scrape(&page_url(), "<html><body><p>Hi</p></body></html>")
            .await
            .unwrap();
        assert!(page.is_none());
    }

    #[tokio::test]
    async fn firecrawl_scraper_reads_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/scrape"))
            .and(header("authorization", "Bearer fc-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "data": {
                    "markdown": "# Guide\n\nEverything about widgets.",
                    "metadata": { "title": "Widget Guide" }
                }
            })))
            .mount(&server)
            .await;

        let config = ScrapeConfig {
            provider: "firecrawl".into(),
            api_url: server.uri(),
            timeout_secs: 5,
            only_main_content: true,
        };
        let scraper = FirecrawlScraper::with_key(&config, "fc-test".into()).unwrap();
        let page = scraper.scrape(&page_url(), "").await.unwrap().unwrap();
        assert_eq!(page.title.as_deref(), Some("Widget Guide"));
        assert!(page.content.starts_with("# Guide"));
    }

    #[tokio::test]
    async fn firecrawl_scraper_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/scrape"))
            .respond_with(ResponseTemplate::new(402).set_body_string("payment required"))
            .mount(&server)
            .await;

        let config = ScrapeConfig {
            provider: "firecrawl".into(),
            api_url: server.uri(),
            timeout_secs: 5,
            only_main_content: true,
        };
        let scraper = FirecrawlScraper::with_key(&config, "fc-test".into()).unwrap();
        let err = scraper.scrape(&page_url(), "").await.unwrap_err();
        assert!(err.to_string().contains("402"));
    }

    #[test]
    fn firecrawl_empty_markdown_is_none() {
        let json = serde_json::json!({ "data": { "markdown": "   " } });
        assert!(parse_firecrawl_response(&page_url(), &json).is_none());
    }
}
