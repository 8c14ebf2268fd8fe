//! Twitter/X API v2 recent-search client with bearer authentication, plus the
//! oEmbed enrichment endpoint.
//!
//! Request parameters are an immutable per-call value; the only cross-call
//! state the service keeps is the rate-limit snapshot returned alongside each
//! response.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use watch_ingest_types::RateLimitInfo;

/// Endpoint configuration handed to the client at construction.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub bearer: String,
    pub search_url: String,
    pub oembed_url: String,
    pub status_url_root: String,
}

/// Parameters for one search call. Built fresh per request.
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    /// Extra raw query-string fragment, appended verbatim.
    pub parameters: Option<String>,
    pub since_id: Option<String>,
    pub until_id: Option<String>,
    pub next_token: Option<String>,
}

impl SearchRequest {
    pub fn to_query_string(&self) -> String {
        let mut qs = format!("query={}", urlencoding::encode(&self.query));
        if let Some(p) = &self.parameters {
            qs.push('&');
            qs.push_str(p);
        }
        if let Some(v) = &self.since_id {
            qs.push_str("&since_id=");
            qs.push_str(v);
        }
        if let Some(v) = &self.until_id {
            qs.push_str("&until_id=");
            qs.push_str(v);
        }
        if let Some(v) = &self.next_token {
            qs.push_str("&next_token=");
            qs.push_str(v);
        }
        qs
    }
}

// =====================================================
// Wire Types
// =====================================================

/// A primary record from the search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tweet {
    pub id: String,
    pub author_id: Option<String>,
    #[serde(default)]
    pub text: String,
    pub created_at: Option<String>,
    pub public_metrics: Option<PublicMetrics>,
    pub entities: Option<Entities>,
    pub attachments: Option<Attachments>,
    /// Matching author objects, folded in by the normalizer.
    #[serde(default)]
    pub author: Vec<ApiUser>,
    /// Matching media objects, folded in by the normalizer.
    #[serde(default)]
    pub media: Vec<ApiMedia>,
    /// Embedded HTML from the enrichment endpoint, or a placeholder.
    #[serde(default)]
    pub tweet_html: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicMetrics {
    pub like_count: Option<i64>,
    pub reply_count: Option<i64>,
    pub retweet_count: Option<i64>,
    pub quote_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entities {
    pub hashtags: Option<Vec<HashtagEntity>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashtagEntity {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachments {
    pub media_keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiUser {
    pub id: String,
    #[serde(default)]
    pub username: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMedia {
    pub media_key: String,
    #[serde(rename = "type")]
    pub media_type: Option<String>,
    pub url: Option<String>,
    /// Copied from the referencing record's hashtag entities.
    #[serde(default)]
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Includes {
    pub users: Option<Vec<ApiUser>>,
    pub media: Option<Vec<ApiMedia>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Meta {
    #[serde(default)]
    pub result_count: i64,
    pub newest_id: Option<String>,
    pub oldest_id: Option<String>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub data: Option<Vec<Tweet>>,
    pub includes: Option<Includes>,
    #[serde(default)]
    pub meta: Meta,
}

#[derive(Debug, Deserialize)]
struct OembedResponse {
    html: String,
}

// =====================================================
// Provider Trait
// =====================================================

/// Abstract search-API client. The pipeline is generic over this so tests can
/// drive it with canned pages.
#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(
        &self,
        req: &SearchRequest,
    ) -> Result<(SearchResponse, RateLimitInfo), IngestError>;

    /// Fetch embedded HTML for one record. Best effort.
    async fn oembed_html(&self, username: &str, record_id: &str) -> Result<String, IngestError>;
}

// =====================================================
// HTTP Implementation
// =====================================================

pub struct HttpProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for HttpProvider {
    async fn search(
        &self,
        req: &SearchRequest,
    ) -> Result<(SearchResponse, RateLimitInfo), IngestError> {
        let url = format!("{}?{}", self.config.search_url, req.to_query_string());

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.config.bearer))
            .send()
            .await?;

        let ratelimit = rate_limit_from_headers(response.headers());
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let parsed: serde_json::Value =
                serde_json::from_str(&body).map_err(|_| IngestError::UpstreamFormat)?;
            let api_status = parsed
                .get("status")
                .and_then(|v| v.as_i64())
                .unwrap_or(status.as_u16() as i64);
            let detail = parsed
                .get("detail")
                .and_then(|v| v.as_str())
                .unwrap_or("no detail provided")
                .to_string();
            return Err(IngestError::UpstreamApi {
                status: api_status,
                detail,
            });
        }

        let resp: SearchResponse =
            serde_json::from_str(&body).map_err(|_| IngestError::UpstreamFormat)?;
        Ok((resp, ratelimit))
    }

    async fn oembed_html(&self, username: &str, record_id: &str) -> Result<String, IngestError> {
        let status_url = format!(
            "{}{}/status/{}",
            self.config.status_url_root, username, record_id
        );
        let url = format!("{}{}", self.config.oembed_url, urlencoding::encode(&status_url));

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| IngestError::Enrichment(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IngestError::Enrichment(format!(
                "{}: error loading tweet {}",
                response.status(),
                status_url
            )));
        }

        let parsed: OembedResponse = response
            .json()
            .await
            .map_err(|e| IngestError::Enrichment(e.to_string()))?;
        Ok(parsed.html)
    }
}

fn rate_limit_from_headers(headers: &reqwest::header::HeaderMap) -> RateLimitInfo {
    let parse = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    };
    RateLimitInfo {
        endpoint_limit: parse("x-rate-limit-limit"),
        remaining: parse("x-rate-limit-remaining"),
        reset_at: headers
            .get("x-rate-limit-reset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string_minimal() {
        let req = SearchRequest {
            query: "#rustlang lang:en".to_string(),
            ..Default::default()
        };
        assert_eq!(req.to_query_string(), "query=%23rustlang%20lang%3Aen");
    }

    #[test]
    fn test_query_string_full() {
        let req = SearchRequest {
            query: "cats".to_string(),
            parameters: Some("tweet.fields=public_metrics".to_string()),
            since_id: Some("100".to_string()),
            until_id: Some("200".to_string()),
            next_token: Some("abc".to_string()),
        };
        assert_eq!(
            req.to_query_string(),
            "query=cats&tweet.fields=public_metrics&since_id=100&until_id=200&next_token=abc"
        );
    }

    #[test]
    fn test_response_decodes_without_optional_keys() {
        let resp: SearchResponse =
            serde_json::from_str(r#"{"meta":{"result_count":0}}"#).unwrap();
        assert!(resp.data.is_none());
        assert!(resp.includes.is_none());
        assert_eq!(resp.meta.result_count, 0);
        assert!(resp.meta.next_token.is_none());
    }
}
