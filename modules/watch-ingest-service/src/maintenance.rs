//! Maintenance pass: refresh volatile engagement metrics on recently stored
//! records and feed score changes into author aggregates as deltas.
//!
//! The pass only ever looks strictly behind the watch's cursor, bounded below
//! by the recency window, so it can never collide with new-record ingestion.

use crate::db::Db;
use crate::error::IngestError;
use crate::pipeline;
use crate::scoring;
use crate::twitter_api::{SearchProvider, SearchRequest, SearchResponse};
use crate::worker::{ContinuationJob, Phase};
use chrono::{Duration, Utc};
use tokio::sync::mpsc::UnboundedSender;

/// Timestamps are compared as strings against the provider's own format.
const WINDOW_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Refresh stored records inside the recency window. Returns the number of
/// records refreshed on the first page; continuations run in the worker.
pub async fn run_maintenance(
    db: &Db,
    provider: &dyn SearchProvider,
    jobs: &UnboundedSender<ContinuationJob>,
    watch_name: &str,
) -> Result<i64, IngestError> {
    let watch = db
        .get_watch(watch_name)?
        .ok_or_else(|| IngestError::UnknownWatch(watch_name.to_string()))?;

    // Nothing ingested yet means nothing to refresh
    let Some(since_id) = watch.since_id.clone() else {
        return Ok(0);
    };

    let window_start = (Utc::now() - Duration::hours(watch.maintenance_delta_hours))
        .format(WINDOW_FORMAT)
        .to_string();

    let Some(floor) = db.oldest_record_in_window(&watch.name, &since_id, &window_start)? else {
        return Ok(0);
    };

    db.mark_pull_started(&watch.name, "Update Likes & Replies.")?;

    // Fetch strictly between the refresh floor and the cursor. Records at or
    // after the cursor belong to the new-record pass.
    let request = SearchRequest {
        query: watch.query.clone(),
        parameters: watch.parameters.clone(),
        since_id: Some(floor.id.clone()),
        until_id: Some(since_id),
        next_token: None,
    };

    let (mut resp, _ratelimit) = match provider.search(&request).await {
        Ok(page) => page,
        Err(e) => {
            db.set_watch_active(&watch.name, false, Some("failed"))?;
            return Err(e);
        }
    };
    let next_token = resp.meta.next_token.clone();

    let refreshed = match refresh_page(db, &watch.name, &mut resp) {
        Ok(count) => count,
        Err(e) => {
            db.set_watch_active(&watch.name, false, Some("failed"))?;
            return Err(e);
        }
    };

    if pipeline::should_continue(next_token.as_deref(), watch.max_results, refreshed) {
        let _ = jobs.send(ContinuationJob {
            watch_name: watch.name.clone(),
            request: SearchRequest {
                next_token,
                ..request
            },
            cumulative: refreshed,
            phase: Phase::Maintenance,
        });
    } else {
        db.mark_pull_finished(&watch.name, refreshed)?;
    }

    Ok(refreshed)
}

/// Apply one page of refreshed metrics. Each record's new score replaces the
/// stored one, and the difference is added to the author's score sum so the
/// aggregate tracks the replacement without a recount.
pub fn refresh_page(
    db: &Db,
    watch_name: &str,
    resp: &mut SearchResponse,
) -> Result<i64, IngestError> {
    if resp.meta.result_count == 0 {
        return Ok(0);
    }
    let Some(tweets) = resp.data.as_ref() else {
        return Ok(0);
    };

    let now = Utc::now();
    let mut refreshed = 0;
    for t in tweets {
        let metrics = t.public_metrics.as_ref();
        let new_score = scoring::tweet_score(metrics);
        let new_synergy = scoring::synergy(t.created_at.as_deref(), metrics, now);

        let stored = db.get_record(&t.id)?;
        db.refresh_record(t, new_score, new_synergy)?;

        // Only records already rolled into the aggregates carry a delta; an
        // unrolled score was never counted, so there is nothing to adjust
        if let Some(stored) = stored {
            if stored.stat_rolled_at.is_some() {
                let delta = new_score - stored.tweet_score;
                if delta != 0 {
                    if let Some(author_id) = t.author_id.as_deref() {
                        db.apply_score_delta(author_id, watch_name, delta)?;
                    }
                }
            }
        }
        refreshed += 1;
    }

    Ok(refreshed)
}
