//! Shared types for the watch ingest service and its RPC clients.

use serde::{Deserialize, Serialize};

// =====================================================
// Domain Types
// =====================================================

/// A named, persisted search-ingestion configuration.
///
/// Owned by operators through the RPC surface; the pipeline only reads it
/// and advances `since_id` / the progress fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub name: String,
    pub query: String,
    /// Extra raw query-string fragment appended to every search call.
    pub parameters: Option<String>,
    /// Newest record ID already ingested. Only ever moves forward.
    pub since_id: Option<String>,
    /// Recency window (hours) inside which stored records are refreshed.
    pub maintenance_delta_hours: i64,
    /// Optional cap on cumulative records fetched across one pagination run.
    pub max_results: Option<i64>,
    pub active: bool,
    pub status: Option<String>,
    pub first_run_completed: bool,
    /// Cooperative stop flag, checked before each pagination continuation.
    pub kill_switch: bool,
    pub last_pull_started: Option<String>,
    pub last_pull_finished: Option<String>,
    pub last_pull_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// A stored, normalized record (a tweet in the provider's domain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub author_id: Option<String>,
    pub author_username: Option<String>,
    pub text: String,
    pub created_at: Option<String>,
    pub like_count: i64,
    pub reply_count: i64,
    pub retweet_count: i64,
    pub quote_count: i64,
    pub hashtags: Vec<String>,
    pub media_keys: Vec<String>,
    pub tweet_score: i64,
    pub synergy: f64,
    pub tweet_html: Option<String>,
    /// Watch names that have produced this record. Additive set.
    pub requests: Vec<String>,
    /// Set once, when the record's statistics were rolled into its author.
    pub stat_rolled_at: Option<String>,
    pub captured_at: String,
}

/// Per-watch usage entry on an author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchUsage {
    pub watch_name: String,
    pub count: i64,
    pub last_used: Option<String>,
}

/// Per-hashtag usage entry on an author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashtagUsage {
    pub tag: String,
    pub count: i64,
    pub last_used: Option<String>,
}

/// Cumulative score sum for one (author, watch) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchScore {
    pub watch_name: String,
    pub score_sum: i64,
}

/// An author document with its incrementally-maintained aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorStats {
    pub id: String,
    pub username: Option<String>,
    pub watch_usage: Vec<WatchUsage>,
    pub hashtag_usage: Vec<HashtagUsage>,
    pub tweet_scores: Vec<WatchScore>,
}

/// A media asset referenced by one or more records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    pub media_key: String,
    pub media_type: Option<String>,
    pub url: Option<String>,
    pub hashtags: Vec<String>,
    pub requests: Vec<String>,
}

/// Rate-limit snapshot parsed from the provider's response headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub endpoint_limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<u64>,
}

// =====================================================
// Trigger Endpoint Types
// =====================================================

/// Body of the trigger response. All trigger responses use HTTP 200; error
/// detail travels in the body.
#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tweets_new: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tweets_maintained: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ratelimit_info: Option<RateLimitInfo>,
}

impl TriggerResponse {
    pub fn ok(tweets_new: i64, tweets_maintained: i64, ratelimit: RateLimitInfo) -> Self {
        Self {
            success: true,
            error: None,
            tweets_new: Some(tweets_new),
            tweets_maintained: Some(tweets_maintained),
            ratelimit_info: Some(ratelimit),
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(msg.into()),
            tweets_new: None,
            tweets_maintained: None,
            ratelimit_info: None,
        }
    }
}

// =====================================================
// RPC Request Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct AddWatchRequest {
    pub name: String,
    pub query: String,
    pub parameters: Option<String>,
    pub maintenance_delta_hours: Option<i64>,
    pub max_results: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopWatchRequest {
    pub name: String,
}

// =====================================================
// RPC Response Types
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// =====================================================
// Service Status
// =====================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub watches: i64,
    pub active_watches: i64,
    pub total_records: i64,
    pub total_authors: i64,
}
