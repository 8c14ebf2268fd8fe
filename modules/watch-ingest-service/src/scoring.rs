//! Engagement scoring for ingested records.
//!
//! `tweet_score` is deterministic from public metrics. `synergy` additionally
//! depends on the wall clock and is recomputed on every touch of a record;
//! stored values drift across maintenance passes and are display-only.

use crate::twitter_api::PublicMetrics;
use chrono::{DateTime, Utc};

/// Engagement-weighted score. Zero when metrics are absent.
pub fn tweet_score(metrics: Option<&PublicMetrics>) -> i64 {
    match metrics {
        Some(m) => {
            m.like_count.unwrap_or(0) * 2
                + m.reply_count.unwrap_or(0) * 2
                + m.retweet_count.unwrap_or(0)
                + m.quote_count.unwrap_or(0)
        }
        None => 0,
    }
}

/// Time-decayed value: age in seconds over 100, pulled down by engagement.
pub fn synergy(
    created_at: Option<&str>,
    metrics: Option<&PublicMetrics>,
    now: DateTime<Utc>,
) -> f64 {
    let (Some(created), Some(m)) = (created_at, metrics) else {
        return 0.0;
    };
    let Ok(created) = DateTime::parse_from_rfc3339(created) else {
        return 0.0;
    };

    let age = now - created.with_timezone(&Utc);
    let mut synergy = age.num_milliseconds() as f64 / 1000.0 / 100.0;

    let likes = m.like_count.unwrap_or(0);
    let replies = m.reply_count.unwrap_or(0);
    let quotes = m.quote_count.unwrap_or(0);

    if likes > 0 {
        synergy -= likes as f64 / 4.0;
    }
    if replies > 0 {
        synergy -= (replies * 250) as f64;
    }
    if replies + quotes > 0 {
        synergy -= ((replies + quotes) * 100) as f64;
    }

    synergy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(likes: i64, replies: i64, retweets: i64, quotes: i64) -> PublicMetrics {
        PublicMetrics {
            like_count: Some(likes),
            reply_count: Some(replies),
            retweet_count: Some(retweets),
            quote_count: Some(quotes),
        }
    }

    #[test]
    fn test_score_formula() {
        assert_eq!(tweet_score(Some(&metrics(3, 2, 4, 1))), 3 * 2 + 2 * 2 + 4 + 1);
        assert_eq!(tweet_score(Some(&metrics(0, 0, 0, 0))), 0);
    }

    #[test]
    fn test_score_absent_metrics_is_zero() {
        assert_eq!(tweet_score(None), 0);
        // Individually absent counts contribute nothing
        let m = PublicMetrics {
            like_count: Some(5),
            ..Default::default()
        };
        assert_eq!(tweet_score(Some(&m)), 10);
    }

    #[test]
    fn test_score_monotonic_in_each_metric() {
        let base = tweet_score(Some(&metrics(1, 1, 1, 1)));
        assert!(tweet_score(Some(&metrics(2, 1, 1, 1))) > base);
        assert!(tweet_score(Some(&metrics(1, 2, 1, 1))) > base);
        assert!(tweet_score(Some(&metrics(1, 1, 2, 1))) > base);
        assert!(tweet_score(Some(&metrics(1, 1, 1, 2))) > base);
    }

    #[test]
    fn test_synergy_no_engagement_is_zero() {
        let now = Utc::now();
        assert_eq!(synergy(None, Some(&metrics(1, 0, 0, 0)), now), 0.0);
        assert_eq!(synergy(Some("2024-01-01T00:00:00.000Z"), None, now), 0.0);
        assert_eq!(synergy(Some("not a timestamp"), Some(&metrics(1, 0, 0, 0)), now), 0.0);
    }

    #[test]
    fn test_synergy_base_is_age_over_100() {
        let created = "2024-01-01T00:00:00.000Z";
        let now = DateTime::parse_from_rfc3339("2024-01-01T01:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let s = synergy(Some(created), Some(&metrics(0, 0, 0, 0)), now);
        assert_eq!(s, 3600.0 / 100.0);
    }

    #[test]
    fn test_synergy_engagement_reductions() {
        let created = "2024-01-01T00:00:00.000Z";
        let now = DateTime::parse_from_rfc3339("2024-01-01T01:00:00.000Z")
            .unwrap()
            .with_timezone(&Utc);
        let base = 3600.0 / 100.0;

        // Likes shave off likes/4
        let s = synergy(Some(created), Some(&metrics(8, 0, 0, 0)), now);
        assert_eq!(s, base - 2.0);

        // Replies cost 250 each plus the shared (replies+quotes)*100 term
        let s = synergy(Some(created), Some(&metrics(0, 1, 0, 0)), now);
        assert_eq!(s, base - 250.0 - 100.0);

        // Quotes alone only hit the shared term
        let s = synergy(Some(created), Some(&metrics(0, 0, 0, 2)), now);
        assert_eq!(s, base - 200.0);
    }
}
