//! # Site Chat
//!
//! Chat with a website. Site Chat crawls a site, splits its text into
//! chunks, indexes them for keyword and semantic retrieval, and answers
//! questions about the site with a chat model, keeping a conversation per
//! session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │   Crawler   │──▶│  Pipeline   │──▶│  SQLite   │
//! │ BFS+scraper │   │ Chunk+Embed │   │ FTS5+Vec  │
//! └─────────────┘   └─────────────┘   └─────┬─────┘
//!                                           │
//!                                     ┌─────┴─────┐
//!                                     │    RAG    │
//!                                     │ retrieve  │
//!                                     │ + answer  │
//!                                     └─────┬─────┘
//!                      ┌────────────────────┤
//!                      ▼                    ▼
//!                 ┌──────────┐        ┌──────────┐
//!                 │   CLI    │        │   HTTP   │
//!                 │(sitechat)│        │  (axum)  │
//!                 └──────────┘        └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! sitechat init                                  # create database
//! sitechat crawl https://example.com             # crawl + index, prints session id
//! sitechat ask <session> "What do you sell?"
//! sitechat search <session> "pricing" --mode hybrid
//! sitechat serve                                 # start HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`crawl`] | Breadth-first same-site crawler |
//! | [`extract`] | HTML text and link extraction |
//! | [`scrape`] | Page scraper backends (local HTML, Firecrawl) |
//! | [`chunk`] | Recursive text splitting |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Chunk storage and embedding backfill |
//! | [`search`] | Keyword, semantic, and hybrid retrieval |
//! | [`llm`] | Chat completion providers |
//! | [`rag`] | History-aware question answering |
//! | [`session`] | Session lifecycle and conversation log |
//! | [`ingest`] | Crawl → index pipeline with page cache |
//! | [`export`] | JSON text corpus export |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod crawl;
pub mod db;
pub mod embedding;
pub mod export;
pub mod extract;
pub mod http;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod rag;
pub mod scrape;
pub mod search;
pub mod server;
pub mod session;
