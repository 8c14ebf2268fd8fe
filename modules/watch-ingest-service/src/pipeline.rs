//! The ingestion pipeline: fetch a page, normalize, enrich, persist, roll up.
//!
//! `run_watch` performs the first page inline and hands any continuation to
//! the background worker, so the trigger response reports the first page's
//! numbers while deeper pagination proceeds asynchronously.

use crate::db::{Db, NewRecord};
use crate::error::IngestError;
use crate::maintenance;
use crate::normalize;
use crate::scoring;
use crate::twitter_api::{ApiMedia, ApiUser, SearchProvider, SearchRequest, SearchResponse};
use crate::worker::{ContinuationJob, Phase};
use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use watch_ingest_types::RateLimitInfo;

/// Concurrent in-flight enrichment calls per page.
pub const ENRICH_CONCURRENCY: usize = 8;

#[derive(Debug)]
pub struct RunStats {
    pub tweets_new: i64,
    pub tweets_maintained: i64,
    pub ratelimit: RateLimitInfo,
}

/// Execute one trigger for a named watch: fetch and process the first page,
/// enqueue pagination, advance the cursor, then run maintenance if this is
/// not the watch's first run.
pub async fn run_watch(
    db: &Db,
    provider: &dyn SearchProvider,
    jobs: &UnboundedSender<ContinuationJob>,
    watch_name: &str,
) -> Result<RunStats, IngestError> {
    let watch = db
        .get_watch(watch_name)?
        .ok_or_else(|| IngestError::UnknownWatch(watch_name.to_string()))?;

    db.mark_pull_started(&watch.name, "Download & process new Tweets.")?;
    // A fresh trigger clears any stop request left over from a prior run
    db.set_kill_switch(&watch.name, false)?;

    let request = SearchRequest {
        query: watch.query.clone(),
        parameters: watch.parameters.clone(),
        since_id: watch.since_id.clone(),
        until_id: None,
        next_token: None,
    };

    let (mut resp, ratelimit) = match provider.search(&request).await {
        Ok(page) => page,
        Err(e) => {
            // A watch must never stay stuck in the active state
            db.set_watch_active(&watch.name, false, Some("failed"))?;
            return Err(e);
        }
    };

    let newest = resp.meta.newest_id.clone();
    let next_token = resp.meta.next_token.clone();

    let tweets_new = match process_new_page(db, provider, &watch.name, &mut resp).await {
        Ok(count) => count,
        Err(e) => {
            db.set_watch_active(&watch.name, false, Some("failed"))?;
            return Err(e);
        }
    };

    if let Some(id) = newest.as_deref() {
        db.advance_since_id(&watch.name, id)?;
    }

    if should_continue(next_token.as_deref(), watch.max_results, tweets_new) {
        let job = ContinuationJob {
            watch_name: watch.name.clone(),
            request: SearchRequest {
                next_token,
                ..request
            },
            cumulative: tweets_new,
            phase: Phase::NewRecords,
        };
        let _ = jobs.send(job);
    } else {
        db.mark_pull_finished(&watch.name, tweets_new)?;
    }

    let tweets_maintained = if watch.first_run_completed {
        maintenance::run_maintenance(db, provider, jobs, &watch.name).await?
    } else {
        0
    };
    db.set_first_run_completed(&watch.name)?;

    Ok(RunStats {
        tweets_new,
        tweets_maintained,
        ratelimit,
    })
}

/// Pagination continues while the provider offers a next page and the watch's
/// cumulative cap (if any) has not been reached.
pub fn should_continue(next_token: Option<&str>, cap: Option<i64>, cumulative: i64) -> bool {
    next_token.is_some() && cap.map_or(true, |c| cumulative < c)
}

/// Normalize, enrich, and persist one page of new records, then roll the
/// page's ID range into author statistics. Returns the record count.
pub async fn process_new_page(
    db: &Db,
    provider: &dyn SearchProvider,
    watch_name: &str,
    resp: &mut SearchResponse,
) -> Result<i64, IngestError> {
    if resp.meta.result_count == 0 {
        return Ok(0);
    }
    normalize::normalize(resp);

    let (records, authors, media, page_oldest, page_newest) = {
        let Some(tweets) = resp.data.as_mut() else {
            return Ok(0);
        };
        enrich_page(provider, tweets).await;

        let now = Utc::now();
        let mut records = Vec::with_capacity(tweets.len());
        let mut authors: Vec<ApiUser> = Vec::new();
        let mut media: Vec<ApiMedia> = Vec::new();
        let mut oldest: Option<String> = None;
        let mut newest: Option<String> = None;

        for t in tweets.iter() {
            let metrics = t.public_metrics.as_ref();
            let m = t.public_metrics.clone().unwrap_or_default();
            records.push(NewRecord {
                id: t.id.clone(),
                author_id: t.author_id.clone(),
                author_username: t.author.first().map(|u| u.username.clone()),
                text: t.text.clone(),
                created_at: t.created_at.clone(),
                like_count: m.like_count.unwrap_or(0),
                reply_count: m.reply_count.unwrap_or(0),
                retweet_count: m.retweet_count.unwrap_or(0),
                quote_count: m.quote_count.unwrap_or(0),
                hashtags: normalize::hashtag_tags(t),
                media_keys: t
                    .attachments
                    .as_ref()
                    .and_then(|a| a.media_keys.clone())
                    .unwrap_or_default(),
                tweet_score: scoring::tweet_score(metrics),
                synergy: scoring::synergy(t.created_at.as_deref(), metrics, now),
                tweet_html: t.tweet_html.clone(),
            });

            for u in &t.author {
                if !authors.iter().any(|a| a.id == u.id) {
                    authors.push(u.clone());
                }
            }
            for item in &t.media {
                if !media.iter().any(|x| x.media_key == item.media_key) {
                    media.push(item.clone());
                }
            }
            if oldest.as_deref().map_or(true, |o| crate::db::id_newer(o, &t.id)) {
                oldest = Some(t.id.clone());
            }
            if newest.as_deref().map_or(true, |n| crate::db::id_newer(&t.id, n)) {
                newest = Some(t.id.clone());
            }
        }
        (records, authors, media, oldest, newest)
    };

    if records.is_empty() {
        return Ok(0);
    }

    db.upsert_authors(&authors)?;
    db.upsert_records(&records, watch_name)?;
    db.upsert_media(&media, watch_name)?;

    let oldest = resp.meta.oldest_id.clone().or(page_oldest);
    let newest = resp.meta.newest_id.clone().or(page_newest);
    if let (Some(oldest), Some(newest)) = (oldest, newest) {
        db.rollup_author_stats(watch_name, &oldest, &newest)?;
    }

    Ok(records.len() as i64)
}

/// Fetch embedded HTML for every record with a resolved author, a bounded
/// number in flight at once. A failed call stores its error message as a
/// placeholder; it never fails the page.
pub async fn enrich_page(provider: &dyn SearchProvider, tweets: &mut [crate::twitter_api::Tweet]) {
    let targets: Vec<(usize, String, String)> = tweets
        .iter()
        .enumerate()
        .filter_map(|(i, t)| t.author.first().map(|u| (i, u.username.clone(), t.id.clone())))
        .collect();

    let mut results = futures_util::stream::iter(targets.into_iter().map(
        |(i, username, id)| async move { (i, provider.oembed_html(&username, &id).await) },
    ))
    .buffer_unordered(ENRICH_CONCURRENCY);

    while let Some((i, result)) = results.next().await {
        match result {
            Ok(html) => tweets[i].tweet_html = Some(html),
            Err(e) => {
                let placeholder = match e {
                    IngestError::Enrichment(msg) => msg,
                    other => other.to_string(),
                };
                log::warn!(
                    "[WATCH_INGEST] Enrichment failed for record {}: {}",
                    tweets[i].id,
                    placeholder
                );
                tweets[i].tweet_html = Some(placeholder);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::twitter_api::{
        Attachments, Entities, HashtagEntity, Includes, Meta, PublicMetrics, Tweet,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use watch_ingest_types::AddWatchRequest;

    pub(crate) struct MockProvider {
        pub pages: Mutex<VecDeque<Result<SearchResponse, IngestError>>>,
        pub search_calls: AtomicUsize,
        pub fail_oembed: bool,
    }

    impl MockProvider {
        pub fn new(pages: Vec<SearchResponse>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().map(Ok).collect()),
                search_calls: AtomicUsize::new(0),
                fail_oembed: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl SearchProvider for MockProvider {
        async fn search(
            &self,
            _req: &SearchRequest,
        ) -> Result<(SearchResponse, RateLimitInfo), IngestError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            let page = self
                .pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(IngestError::UpstreamFormat))?;
            Ok((page, RateLimitInfo::default()))
        }

        async fn oembed_html(
            &self,
            username: &str,
            record_id: &str,
        ) -> Result<String, IngestError> {
            if self.fail_oembed {
                return Err(IngestError::Enrichment("service unavailable".to_string()));
            }
            Ok(format!("<blockquote>{username}/{record_id}</blockquote>"))
        }
    }

    pub(crate) fn api_tweet(id: &str, author_id: &str, likes: i64) -> Tweet {
        Tweet {
            id: id.to_string(),
            author_id: Some(author_id.to_string()),
            text: format!("record {id}"),
            created_at: Some("2024-01-01T12:00:00.000Z".to_string()),
            public_metrics: Some(PublicMetrics {
                like_count: Some(likes),
                reply_count: Some(0),
                retweet_count: Some(0),
                quote_count: Some(0),
            }),
            entities: Some(Entities {
                hashtags: Some(vec![HashtagEntity {
                    tag: "rust".to_string(),
                }]),
            }),
            attachments: None,
            author: Vec::new(),
            media: Vec::new(),
            tweet_html: None,
        }
    }

    pub(crate) fn page(tweets: Vec<Tweet>, next_token: Option<&str>) -> SearchResponse {
        let users = tweets
            .iter()
            .filter_map(|t| t.author_id.clone())
            .map(|id| ApiUser {
                username: format!("user_{id}"),
                id,
                name: None,
            })
            .collect();
        let ids: Vec<&str> = tweets.iter().map(|t| t.id.as_str()).collect();
        SearchResponse {
            meta: Meta {
                result_count: tweets.len() as i64,
                newest_id: ids.iter().max().map(|s| s.to_string()),
                oldest_id: ids.iter().min().map(|s| s.to_string()),
                next_token: next_token.map(|s| s.to_string()),
            },
            includes: Some(Includes {
                users: Some(users),
                media: None,
            }),
            data: Some(tweets),
        }
    }

    fn test_db() -> Db {
        let db = Db::open(":memory:").unwrap();
        db.add_watch(&AddWatchRequest {
            name: "w1".to_string(),
            query: "#rustlang".to_string(),
            parameters: None,
            maintenance_delta_hours: Some(48),
            max_results: None,
        })
        .unwrap();
        db
    }

    fn jobs_channel() -> (
        UnboundedSender<ContinuationJob>,
        tokio::sync::mpsc::UnboundedReceiver<ContinuationJob>,
    ) {
        tokio::sync::mpsc::unbounded_channel()
    }

    #[test]
    fn test_should_continue() {
        assert!(should_continue(Some("t"), None, 500));
        assert!(should_continue(Some("t"), Some(100), 99));
        assert!(!should_continue(Some("t"), Some(100), 100));
        assert!(!should_continue(None, None, 0));
    }

    #[tokio::test]
    async fn test_run_watch_single_page() {
        let db = test_db();
        let provider = MockProvider::new(vec![page(
            vec![api_tweet("100", "a1", 5), api_tweet("101", "a2", 0)],
            None,
        )]);
        let (tx, mut rx) = jobs_channel();

        let stats = run_watch(&db, &provider, &tx, "w1").await.unwrap();
        assert_eq!(stats.tweets_new, 2);
        assert_eq!(stats.tweets_maintained, 0);

        let stored = db.get_record("100").unwrap().unwrap();
        assert_eq!(stored.tweet_score, 10);
        assert_eq!(stored.author_username.as_deref(), Some("user_a1"));
        assert_eq!(
            stored.tweet_html.as_deref(),
            Some("<blockquote>user_a1/100</blockquote>")
        );
        assert!(stored.stat_rolled_at.is_some());
        assert_eq!(db.watch_score("a1", "w1").unwrap(), 10);

        let watch = db.get_watch("w1").unwrap().unwrap();
        assert!(!watch.active);
        assert_eq!(watch.since_id.as_deref(), Some("101"));
        assert_eq!(watch.last_pull_count, 2);
        assert!(watch.first_run_completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_watch_empty_page() {
        let db = test_db();
        let provider = MockProvider::new(vec![SearchResponse::default()]);
        let (tx, mut rx) = jobs_channel();

        let stats = run_watch(&db, &provider, &tx, "w1").await.unwrap();
        assert_eq!(stats.tweets_new, 0);

        let watch = db.get_watch("w1").unwrap().unwrap();
        assert!(!watch.active);
        assert!(watch.since_id.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_watch_unknown_name() {
        let db = test_db();
        let provider = MockProvider::new(vec![]);
        let (tx, _rx) = jobs_channel();

        let err = run_watch(&db, &provider, &tx, "nope").await.unwrap_err();
        assert_eq!(err.to_string(), "The watch nope does not exist.");
        assert_eq!(provider.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_watch_enqueues_continuation() {
        let db = test_db();
        let provider = MockProvider::new(vec![page(vec![api_tweet("100", "a1", 0)], Some("tok"))]);
        let (tx, mut rx) = jobs_channel();

        run_watch(&db, &provider, &tx, "w1").await.unwrap();

        let job = rx.try_recv().unwrap();
        assert_eq!(job.watch_name, "w1");
        assert_eq!(job.request.next_token.as_deref(), Some("tok"));
        assert_eq!(job.cumulative, 1);
        assert!(matches!(job.phase, Phase::NewRecords));

        // Still active: the worker owns the finish
        let watch = db.get_watch("w1").unwrap().unwrap();
        assert!(watch.active);
    }

    #[tokio::test]
    async fn test_run_watch_search_failure_deactivates() {
        let db = test_db();
        let provider = MockProvider {
            pages: Mutex::new(VecDeque::from([Err(IngestError::UpstreamApi {
                status: 429,
                detail: "Too Many Requests".to_string(),
            })])),
            search_calls: AtomicUsize::new(0),
            fail_oembed: false,
        };
        let (tx, _rx) = jobs_channel();

        let err = run_watch(&db, &provider, &tx, "w1").await.unwrap_err();
        assert_eq!(err.to_string(), "API-response: 429 - Too Many Requests");

        let watch = db.get_watch("w1").unwrap().unwrap();
        assert!(!watch.active);
        assert_eq!(watch.status.as_deref(), Some("failed"));
    }

    #[tokio::test]
    async fn test_enrichment_failure_stores_placeholder() {
        let db = test_db();
        let mut provider = MockProvider::new(vec![page(vec![api_tweet("100", "a1", 0)], None)]);
        provider.fail_oembed = true;
        let (tx, _rx) = jobs_channel();

        run_watch(&db, &provider, &tx, "w1").await.unwrap();

        let stored = db.get_record("100").unwrap().unwrap();
        assert_eq!(stored.tweet_html.as_deref(), Some("service unavailable"));
    }

    #[tokio::test]
    async fn test_rerunning_same_page_rolls_up_once() {
        let db = test_db();
        let tweets = vec![api_tweet("100", "a1", 5)];
        let provider = MockProvider::new(vec![page(tweets.clone(), None), page(tweets, None)]);
        let (tx, _rx) = jobs_channel();

        run_watch(&db, &provider, &tx, "w1").await.unwrap();
        // since_id did not move past 100, so a retriggered provider may hand
        // back the same record; the marker keeps aggregates stable
        db.advance_since_id("w1", "100").unwrap();
        run_watch(&db, &provider, &tx, "w1").await.unwrap();

        assert_eq!(db.watch_score("a1", "w1").unwrap(), 10);
        let stats = db.get_author_stats("a1").unwrap().unwrap();
        assert_eq!(stats.watch_usage[0].count, 1);
    }
}
