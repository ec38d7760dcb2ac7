//! JSON-over-HTTP calls to model providers, with retry.
//!
//! Embedding and chat backends share one policy:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// How a request authenticates.
///
/// Keys never go into the URL, so error text and logs stay free of them.
#[derive(Debug, Clone, Copy)]
pub enum Auth<'a> {
    None,
    Bearer(&'a str),
    /// Key in a named header, e.g. `x-goog-api-key`.
    Header(&'static str, &'a str),
}

impl<'a> Auth<'a> {
    /// Bearer auth when a token is present.
    pub fn bearer(token: Option<&'a str>) -> Self {
        token.map_or(Auth::None, Auth::Bearer)
    }
}

/// Build a client with the provider timeout.
pub fn client(timeout_secs: u64) -> Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// POST `body` to `url` and return the parsed JSON response.
///
/// `label` names the provider in error messages (`"OpenAI"`, `"Ollama"`).
pub async fn post_json(
    client: &Client,
    url: &str,
    auth: Auth<'_>,
    body: &serde_json::Value,
    max_retries: u32,
    label: &str,
) -> Result<serde_json::Value> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            debug!(attempt, ?delay, provider = label, "retrying request");
            tokio::time::sleep(delay).await;
        }

        let request = client.post(url).json(body);
        let request = match auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Header(name, value) => request.header(name, value),
        };

        match request.send().await {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    return response.json().await.map_err(|e| {
                        anyhow!("{} returned an invalid response: {}", label, e.without_url())
                    });
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    warn!(%status, provider = label, "transient API error");
                    last_err = Some(anyhow!("{} API error {}: {}", label, status, body_text));
                    continue;
                }

                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                let e = e.without_url();
                warn!(error = %e, provider = label, "request failed");
                last_err = Some(anyhow!("{} connection error: {}", label, e));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", label)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn success_returns_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/thing"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let url = format!("{}/v1/thing", server.uri());
        let json = post_json(
            &client(5).unwrap(),
            &url,
            Auth::Bearer("sk-test"),
            &serde_json::json!({}),
            0,
            "Test",
        )
        .await
        .unwrap();
        assert_eq!(json["ok"], true);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let err = post_json(
            &client(5).unwrap(),
            &server.uri(),
            Auth::None,
            &serde_json::json!({}),
            3,
            "Test",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("bad key"));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let err = post_json(
            &client(5).unwrap(),
            &server.uri(),
            Auth::None,
            &serde_json::json!({}),
            1,
            "Test",
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn header_auth_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        post_json(
            &client(5).unwrap(),
            &server.uri(),
            Auth::Header("x-goog-api-key", "g-key"),
            &serde_json::json!({}),
            0,
            "Test",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn connection_errors_omit_the_url() {
        let err = post_json(
            &client(2).unwrap(),
            "http://127.0.0.1:9/v1/thing?token=SECRET",
            Auth::None,
            &serde_json::json!({}),
            0,
            "Test",
        )
        .await
        .unwrap_err();
        let text = format!("{:#}", err);
        assert!(text.contains("Test connection error"));
        assert!(!text.contains("SECRET"), "leaked: {}", text);
        assert!(!text.contains("127.0.0.1"), "leaked: {}", text);
    }
}
