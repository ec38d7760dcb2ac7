//! Crawl and index progress reporting.
//!
//! `sitechat crawl` can take minutes on a large site, so the pipeline emits
//! progress events on **stderr**; stdout stays reserved for the summary.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum CrawlProgressEvent {
    /// Crawl started for this URL. Total page count unknown.
    Discovering { url: String },
    /// A page was fetched. `n` counts fetched pages so far.
    Fetched { n: u64, url: String },
    /// Crawl finished; chunking and embedding `pages` pages.
    Indexing { pages: u64 },
}

/// Receives progress events from the crawl pipeline.
pub trait CrawlProgressReporter: Send + Sync {
    fn report(&self, event: CrawlProgressEvent);
}

/// Human-friendly progress on stderr: "crawl  fetched  12  https://…".
pub struct StderrProgress;

impl CrawlProgressReporter for StderrProgress {
    fn report(&self, event: CrawlProgressEvent) {
        let line = match &event {
            CrawlProgressEvent::Discovering { url } => format!("crawl {}  discovering...\n", url),
            CrawlProgressEvent::Fetched { n, url } => {
                format!("crawl  fetched  {:>5}  {}\n", format_number(*n), url)
            }
            CrawlProgressEvent::Indexing { pages } => {
                format!("crawl  indexing  {} pages\n", format_number(*pages))
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl CrawlProgressReporter for JsonProgress {
    fn report(&self, event: CrawlProgressEvent) {
        let obj = match &event {
            CrawlProgressEvent::Discovering { url } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "url": url,
            }),
            CrawlProgressEvent::Fetched { n, url } => serde_json::json!({
                "event": "progress",
                "phase": "fetched",
                "n": n,
                "url": url,
            }),
            CrawlProgressEvent::Indexing { pages } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "pages": pages,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CrawlProgressReporter for NoProgress {
    fn report(&self, _event: CrawlProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn CrawlProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parse() {
        assert_eq!(ProgressMode::parse("json"), Some(ProgressMode::Json));
        assert_eq!(ProgressMode::parse("off"), Some(ProgressMode::Off));
        assert_eq!(ProgressMode::parse("loud"), None);
    }
}
