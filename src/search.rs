//! Retrieval over one session's chunks.
//!
//! Three modes share a single scoring path:
//!
//! - **keyword**: FTS5 BM25 over the chunk text.
//! - **semantic**: cosine similarity between the query embedding and the
//!   stored chunk vectors (computed in Rust; vectors are small per session).
//! - **hybrid**: both channels, each min-max normalized to `[0, 1]`, then
//!   blended as `(1 - α)·keyword + α·vector` with `α = retrieval.hybrid_alpha`.
//!
//! Results are ordered by score, ties broken by chunk position so the same
//! query always yields the same context.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::debug;

use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::models::RetrievedChunk;
use crate::session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Keyword => "keyword",
            SearchMode::Semantic => "semantic",
            SearchMode::Hybrid => "hybrid",
        }
    }

    fn alpha(&self, hybrid_alpha: f64) -> f64 {
        match self {
            SearchMode::Keyword => 0.0,
            SearchMode::Semantic => 1.0,
            SearchMode::Hybrid => hybrid_alpha,
        }
    }
}

/// Pick the retrieval mode: the requested one, else `retrieval.mode`.
///
/// `auto` means semantic when an embedding provider is configured and
/// keyword otherwise.
pub fn resolve_mode(config: &Config, requested: Option<&str>) -> Result<SearchMode> {
    let name = requested.unwrap_or(config.retrieval.mode.as_str());

    let mode = match name {
        "auto" if config.embedding.is_enabled() => SearchMode::Semantic,
        "auto" => SearchMode::Keyword,
        "keyword" => SearchMode::Keyword,
        "semantic" => SearchMode::Semantic,
        "hybrid" => SearchMode::Hybrid,
        other => bail!(
            "Unknown search mode: {}. Use auto, keyword, semantic, or hybrid.",
            other
        ),
    };

    if mode != SearchMode::Keyword && !config.embedding.is_enabled() {
        bail!(
            "Mode '{}' requires embeddings. Set [embedding] provider in config.",
            mode.as_str()
        );
    }

    Ok(mode)
}

/// Top `k` chunks of `session_id` for `query`.
pub async fn retrieve(
    config: &Config,
    pool: &SqlitePool,
    session_id: &str,
    query: &str,
    mode: SearchMode,
    k: usize,
) -> Result<Vec<RetrievedChunk>> {
    if query.trim().is_empty() || k == 0 {
        return Ok(Vec::new());
    }

    let candidate_k = config.retrieval.candidate_k.max(k as i64);

    let keyword = if mode != SearchMode::Semantic {
        fetch_keyword_candidates(pool, session_id, query, candidate_k).await?
    } else {
        Vec::new()
    };

    let vector = if mode != SearchMode::Keyword {
        fetch_vector_candidates(pool, config, session_id, query, candidate_k).await?
    } else {
        Vec::new()
    };

    debug!(
        mode = mode.as_str(),
        keyword = keyword.len(),
        vector = vector.len(),
        "retrieval candidates"
    );

    let mut results = fuse(&keyword, &vector, mode.alpha(config.retrieval.hybrid_alpha));
    results.truncate(k);
    Ok(results)
}

// ============ Candidate types ============

#[derive(Debug, Clone)]
struct ChunkCandidate {
    chunk_id: String,
    chunk_index: i64,
    page_url: String,
    page_title: Option<String>,
    text: String,
    raw_score: f64,
}

// ============ Keyword search ============

/// Turn free text into an FTS5 expression: every word quoted, joined by OR.
///
/// Quoting keeps user punctuation (`-`, `:`, `*`, quotes) from being read
/// as FTS5 syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

async fn fetch_keyword_candidates(
    pool: &SqlitePool,
    session_id: &str,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let Some(expression) = fts_query(query) else {
        return Ok(Vec::new());
    };

    let rows = sqlx::query(
        r#"
        SELECT chunks_fts.chunk_id AS chunk_id, bm25(chunks_fts) AS score,
               c.chunk_index, c.page_url, c.page_title, c.text
        FROM chunks_fts
        JOIN chunks c ON c.id = chunks_fts.chunk_id
        WHERE chunks_fts MATCH ? AND chunks_fts.session_id = ?
        ORDER BY score
        LIMIT ?
        "#,
    )
    .bind(&expression)
    .bind(session_id)
    .bind(candidate_k)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let bm25: f64 = row.get("score");
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                chunk_index: row.get("chunk_index"),
                page_url: row.get("page_url"),
                page_title: row.get("page_title"),
                text: row.get("text"),
                raw_score: -bm25, // negate so higher = better
            }
        })
        .collect())
}

// ============ Vector search ============

async fn fetch_vector_candidates(
    pool: &SqlitePool,
    config: &Config,
    session_id: &str,
    query: &str,
    candidate_k: i64,
) -> Result<Vec<ChunkCandidate>> {
    let provider = embedding::create_provider(&config.embedding)?;
    let query_vec = embedding::embed_query(provider.as_ref(), &config.embedding, query).await?;

    let rows = sqlx::query(
        r#"
        SELECT v.chunk_id, v.embedding, c.chunk_index, c.page_url, c.page_title, c.text
        FROM chunk_vectors v
        JOIN chunks c ON c.id = v.chunk_id
        WHERE v.session_id = ? AND v.model = ?
        "#,
    )
    .bind(session_id)
    .bind(provider.model_name())
    .fetch_all(pool)
    .await?;

    let mut candidates: Vec<ChunkCandidate> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let vec = embedding::blob_to_vec(&blob);
            ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                chunk_index: row.get("chunk_index"),
                page_url: row.get("page_url"),
                page_title: row.get("page_title"),
                text: row.get("text"),
                raw_score: embedding::cosine_similarity(&query_vec, &vec) as f64,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    candidates.truncate(candidate_k as usize);

    Ok(candidates)
}

// ============ Scoring ============

/// Min-max normalize scores to [0, 1]. A single candidate, or all-equal
/// scores, normalize to 1.0.
fn normalize_scores(candidates: &[ChunkCandidate]) -> Vec<(&ChunkCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

/// Blend both channels and sort: score desc, then chunk index asc.
fn fuse(keyword: &[ChunkCandidate], vector: &[ChunkCandidate], alpha: f64) -> Vec<RetrievedChunk> {
    let kw_map: HashMap<&str, f64> = normalize_scores(keyword)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();
    let vec_map: HashMap<&str, f64> = normalize_scores(vector)
        .into_iter()
        .map(|(c, s)| (c.chunk_id.as_str(), s))
        .collect();

    let mut unique: HashMap<&str, &ChunkCandidate> = HashMap::new();
    for c in keyword.iter().chain(vector.iter()) {
        unique.entry(c.chunk_id.as_str()).or_insert(c);
    }

    let mut results: Vec<RetrievedChunk> = unique
        .into_iter()
        .map(|(id, cand)| {
            let k = kw_map.get(id).copied().unwrap_or(0.0);
            let v = vec_map.get(id).copied().unwrap_or(0.0);
            RetrievedChunk {
                chunk_id: cand.chunk_id.clone(),
                chunk_index: cand.chunk_index,
                page_url: cand.page_url.clone(),
                page_title: cand.page_title.clone(),
                text: cand.text.clone(),
                score: (1.0 - alpha) * k + alpha * v,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    results
}

/// CLI entry point for `sitechat search`.
pub async fn run_search(
    config: &Config,
    session_id: &str,
    query: &str,
    mode: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let mode = resolve_mode(config, mode)?;
    let pool = db::connect(config).await?;
    session::require_session(&pool, session_id).await?;

    let k = limit.unwrap_or(config.retrieval.top_k);
    let results = retrieve(config, &pool, session_id, query, mode, k).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            result.score,
            result.page_title.as_deref().unwrap_or("(untitled)")
        );
        println!("    url: {}", result.page_url);
        let excerpt: String = result.text.chars().take(240).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!();
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_config, test_pool};
    use crate::index::{self, tests::ollama_embedding};
    use crate::models::ScrapedPage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn make_candidate(chunk_id: &str, index: i64, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: chunk_id.to_string(),
            chunk_index: index,
            page_url: "https://example.com/".to_string(),
            page_title: None,
            text: String::new(),
            raw_score: score,
        }
    }

    fn ids(results: &[RetrievedChunk]) -> Vec<&str> {
        results.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    fn site() -> Vec<ScrapedPage> {
        vec![
            ScrapedPage {
                url: "https://shop.example.com/".into(),
                title: Some("Shop".into()),
                content: "We sell handmade ceramic mugs and bowls.".into(),
            },
            ScrapedPage {
                url: "https://shop.example.com/shipping".into(),
                title: Some("Shipping".into()),
                content: "Shipping takes three business days within the country.".into(),
            },
            ScrapedPage {
                url: "https://shop.example.com/returns".into(),
                title: Some("Returns".into()),
                content: "Returns are accepted within thirty days of delivery.".into(),
            },
        ]
    }

    /// Embedding stub: texts mentioning shipping point one way, the rest the other.
    async fn mount_topic_embeddings(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(|req: &Request| {
                let body: serde_json::Value =
                    serde_json::from_slice(&req.body).unwrap_or_default();
                let vectors: Vec<Vec<f32>> = body["input"]
                    .as_array()
                    .map(|inputs| {
                        inputs
                            .iter()
                            .map(|t| {
                                let text = t.as_str().unwrap_or_default().to_lowercase();
                                if text.contains("shipping") || text.contains("deliver") {
                                    vec![0.0, 1.0]
                                } else {
                                    vec![1.0, 0.0]
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "embeddings": vectors }))
            })
            .mount(server)
            .await;
    }

    #[test]
    fn test_normalize_empty() {
        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn test_normalize_single() {
        let candidates = vec![make_candidate("c1", 0, 5.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_range() {
        let candidates = vec![
            make_candidate("c1", 0, 10.0),
            make_candidate("c2", 1, 5.0),
            make_candidate("c3", 2, 0.0),
        ];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_fuse_alpha_zero_keeps_keyword_order() {
        let kw = vec![
            make_candidate("c1", 0, 10.0),
            make_candidate("c2", 1, 5.0),
            make_candidate("c3", 2, 1.0),
        ];
        let vec_cands = vec![make_candidate("c1", 0, 0.1), make_candidate("c2", 1, 0.9)];
        let fused = fuse(&kw, &vec_cands, 0.0);
        assert_eq!(ids(&fused), vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_fuse_alpha_one_keeps_vector_order() {
        let kw = vec![make_candidate("c1", 0, 10.0), make_candidate("c2", 1, 5.0)];
        let vec_cands = vec![
            make_candidate("c1", 0, 0.1),
            make_candidate("c2", 1, 0.9),
            make_candidate("c3", 2, 0.5),
        ];
        let fused = fuse(&kw, &vec_cands, 1.0);
        assert_eq!(ids(&fused), vec!["c2", "c3", "c1"]);
    }

    #[test]
    fn test_fuse_ties_break_on_chunk_index() {
        let kw = vec![
            make_candidate("late", 7, 2.0),
            make_candidate("early", 3, 2.0),
        ];
        let fused = fuse(&kw, &[], 0.0);
        assert_eq!(ids(&fused), vec!["early", "late"]);
    }

    #[test]
    fn test_fts_query_quotes_terms() {
        assert_eq!(
            fts_query("how long does shipping take?").as_deref(),
            Some("\"how\" OR \"long\" OR \"does\" OR \"shipping\" OR \"take\"")
        );
        assert_eq!(fts_query("  -- ?? ").as_deref(), None);
    }

    #[test]
    fn test_resolve_mode() {
        let mut config = test_config();
        assert_eq!(resolve_mode(&config, None).unwrap(), SearchMode::Keyword);
        assert!(resolve_mode(&config, Some("semantic"))
            .unwrap_err()
            .to_string()
            .contains("requires embeddings"));
        assert!(resolve_mode(&config, Some("fuzzy")).is_err());

        config.embedding = ollama_embedding("http://localhost:11434".into());
        assert_eq!(resolve_mode(&config, None).unwrap(), SearchMode::Semantic);
        assert_eq!(
            resolve_mode(&config, Some("hybrid")).unwrap(),
            SearchMode::Hybrid
        );
    }

    #[tokio::test]
    async fn keyword_retrieval_scoped_to_session() {
        let pool = test_pool().await;
        let config = test_config();
        index::index_session(&config, &pool, "s1", &site()).await.unwrap();
        index::index_session(&config, &pool, "s2", &site()[1..2]).await.unwrap();

        let results = retrieve(
            &config,
            &pool,
            "s1",
            "shipping days?",
            SearchMode::Keyword,
            4,
        )
        .await
        .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].page_url, "https://shop.example.com/shipping");
        assert!(results.iter().all(|r| r.score >= 0.0 && r.score <= 1.0));

        let none = retrieve(&config, &pool, "s1", "   ", SearchMode::Keyword, 4)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn keyword_retrieval_respects_k() {
        let pool = test_pool().await;
        let config = test_config();
        index::index_session(&config, &pool, "s1", &site()).await.unwrap();

        let results = retrieve(&config, &pool, "s1", "within", SearchMode::Keyword, 1)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn semantic_retrieval_uses_vectors() {
        let server = MockServer::start().await;
        mount_topic_embeddings(&server).await;

        let pool = test_pool().await;
        let mut config = test_config();
        config.embedding = ollama_embedding(server.uri());
        index::index_session(&config, &pool, "s1", &site()).await.unwrap();

        let results = retrieve(
            &config,
            &pool,
            "s1",
            "when will my parcel be delivered",
            SearchMode::Semantic,
            1,
        )
        .await
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].page_url, "https://shop.example.com/shipping");
    }

    #[tokio::test]
    async fn hybrid_retrieval_merges_channels() {
        let server = MockServer::start().await;
        mount_topic_embeddings(&server).await;

        let pool = test_pool().await;
        let mut config = test_config();
        config.embedding = ollama_embedding(server.uri());
        index::index_session(&config, &pool, "s1", &site()).await.unwrap();

        let results = retrieve(&config, &pool, "s1", "mugs", SearchMode::Hybrid, 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].page_url, "https://shop.example.com/");
    }
}
