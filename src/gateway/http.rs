//! Generic HTTP/JSON source provider.
//!
//! Talks to any search or profile API that accepts query-string parameters
//! and answers with a JSON `results` envelope. Discovery hits
//! `{endpoint}/search`, lookups hit `{endpoint}/profile`.

use super::{SourceParams, SourceProvider};
use crate::error::SourceError;
use crate::models::SourceKind;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Provider backed by a single HTTP endpoint.
pub struct HttpSourceProvider {
    kind: SourceKind,
    endpoint: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl HttpSourceProvider {
    /// Create a provider for `kind` at `endpoint`.
    pub fn new(
        kind: SourceKind,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("yoscout/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Unavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            kind,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key,
            http_client,
        })
    }

    fn request_parts(&self, params: &SourceParams) -> (String, Vec<(&'static str, String)>) {
        match params {
            SourceParams::Discover {
                topic,
                niche,
                region,
                platform,
                limit,
            } => {
                let mut query = vec![
                    ("q", topic.clone()),
                    ("platform", platform.as_str().to_string()),
                    ("limit", limit.to_string()),
                ];
                if let Some(niche) = niche {
                    query.push(("niche", niche.clone()));
                }
                if let Some(region) = region {
                    query.push(("region", region.clone()));
                }
                (format!("{}/search", self.endpoint), query)
            }
            SourceParams::Lookup { platform, handle } => (
                format!("{}/profile", self.endpoint),
                vec![
                    ("platform", platform.as_str().to_string()),
                    ("handle", handle.clone()),
                ],
            ),
        }
    }
}

#[async_trait]
impl SourceProvider for HttpSourceProvider {
    async fn fetch(&self, params: &SourceParams) -> Result<Value, SourceError> {
        let (url, query) = self.request_parts(params);
        debug!(source = %self.kind, %url, "HTTP request");

        let mut request = self.http_client.get(&url).query(&query);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else if e.is_connect() {
                SourceError::Unavailable(format!("cannot connect to {}", self.endpoint))
            } else {
                SourceError::Unavailable(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, retry_after, &body));
        }

        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout
            } else {
                SourceError::Unavailable(format!("failed to read body: {}", e))
            }
        })?;

        serde_json::from_str(&text)
            .map_err(|e| SourceError::Malformed(format!("body is not JSON: {}", e)))
    }
}

/// Map a non-success HTTP status to the gateway error taxonomy.
fn map_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> SourceError {
    let detail = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SourceError::AuthFailure(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => SourceError::Timeout,
        s if s.is_server_error() => SourceError::Unavailable(detail),
        _ => SourceError::Malformed(detail),
    }
}

/// `Retry-After` in its delta-seconds form; HTTP dates are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Platform;
    use crate::pipeline::test_support::serve_once;

    fn provider() -> HttpSourceProvider {
        HttpSourceProvider::new(
            SourceKind::WebSearch,
            "https://search.example.com/v1/",
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            map_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3)), ""),
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, None, "no"),
            SourceError::AuthFailure(_)
        ));
        assert_eq!(map_status(StatusCode::GATEWAY_TIMEOUT, None, ""), SourceError::Timeout);
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, None, ""),
            SourceError::Unavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, None, ""),
            SourceError::Malformed(_)
        ));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 12 "), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_request_parts() {
        let p = provider();
        let (url, query) = p.request_parts(&SourceParams::Discover {
            topic: "fitness".into(),
            niche: None,
            region: Some("Europe".into()),
            platform: Platform::TikTok,
            limit: 20,
        });
        assert_eq!(url, "https://search.example.com/v1/search");
        assert!(query.contains(&("platform", "tiktok".to_string())));
        assert!(query.contains(&("region", "Europe".to_string())));
        assert!(!query.iter().any(|(k, _)| *k == "niche"));

        let (url, _) = p.request_parts(&SourceParams::Lookup {
            platform: Platform::YouTube,
            handle: "trainhard".into(),
        });
        assert_eq!(url, "https://search.example.com/v1/profile");
    }

    fn local(endpoint: &str) -> HttpSourceProvider {
        HttpSourceProvider::new(
            SourceKind::WebSearch,
            endpoint,
            Some("secret".into()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn discover() -> SourceParams {
        SourceParams::Discover {
            topic: "fitness".into(),
            niche: None,
            region: Some("Europe".into()),
            platform: Platform::Instagram,
            limit: 20,
        }
    }

    #[tokio::test]
    async fn test_fetch_sends_query_and_bearer_token() {
        let body = r#"{"results": [{"platform": "instagram", "handle": "anna"}]}"#;
        let (endpoint, server) = serve_once(200, &[], body).await;

        let raw = local(&endpoint).fetch(&discover()).await.unwrap();
        assert_eq!(raw["results"][0]["handle"], "anna");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /search?"));
        assert!(request.contains("q=fitness"));
        assert!(request.contains("platform=instagram"));
        assert!(request.contains("region=europe"));
        assert!(request.contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_fetch_rate_limit_carries_retry_after() {
        let (endpoint, _server) = serve_once(429, &[("retry-after", "3")], "slow down").await;

        let err = local(&endpoint).fetch(&discover()).await.unwrap_err();
        assert_eq!(
            err,
            SourceError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_maps_auth_failure() {
        let (endpoint, _server) = serve_once(401, &[], "bad key").await;

        let err = local(&endpoint).fetch(&discover()).await.unwrap_err();
        assert!(matches!(err, SourceError::AuthFailure(_)));
    }

    #[tokio::test]
    async fn test_fetch_rejects_non_json_body() {
        let (endpoint, _server) = serve_once(200, &[], "<html>maintenance</html>").await;

        let err = local(&endpoint).fetch(&discover()).await.unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
