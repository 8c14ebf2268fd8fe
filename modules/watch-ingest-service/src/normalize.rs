//! Folds the search response's `includes` side-tables into the primary
//! records, so reads never need joins, and propagates record hashtags onto
//! referenced media items.
//!
//! Every step is a no-op when `includes` or a sub-key is absent, and an
//! unmatched author id or media key just leaves the association empty.

use crate::twitter_api::{SearchResponse, Tweet};

/// Run both normalization passes. Must complete before persistence.
pub fn normalize(resp: &mut SearchResponse) {
    copy_hashtags_into_media(resp);
    fold_includes(resp);
}

/// Attach matching author and media objects directly onto each record.
pub fn fold_includes(resp: &mut SearchResponse) {
    let SearchResponse { data, includes, .. } = resp;
    let (Some(data), Some(includes)) = (data.as_mut(), includes.as_ref()) else {
        return;
    };

    if let Some(users) = includes.users.as_ref() {
        for tweet in data.iter_mut() {
            if let Some(author_id) = tweet.author_id.as_deref() {
                tweet.author = users.iter().filter(|u| u.id == author_id).cloned().collect();
            }
        }
    }

    if let Some(media) = includes.media.as_ref() {
        for tweet in data.iter_mut() {
            if let Some(keys) = tweet.attachments.as_ref().and_then(|a| a.media_keys.as_ref()) {
                tweet.media = media
                    .iter()
                    .filter(|m| keys.contains(&m.media_key))
                    .cloned()
                    .collect();
            }
        }
    }
}

/// Copy each record's hashtag tag list onto the media items it references.
pub fn copy_hashtags_into_media(resp: &mut SearchResponse) {
    let SearchResponse { data, includes, .. } = resp;
    let (Some(data), Some(includes)) = (data.as_ref(), includes.as_mut()) else {
        return;
    };
    let Some(media) = includes.media.as_mut() else {
        return;
    };

    for tweet in data {
        let tags = hashtag_tags(tweet);
        if tags.is_empty() {
            continue;
        }
        let Some(keys) = tweet.attachments.as_ref().and_then(|a| a.media_keys.as_ref()) else {
            continue;
        };
        for m in media.iter_mut() {
            if keys.contains(&m.media_key) {
                m.hashtags = tags.clone();
            }
        }
    }
}

/// Hashtag tags on a record, in entity order.
pub fn hashtag_tags(tweet: &Tweet) -> Vec<String> {
    tweet
        .entities
        .as_ref()
        .and_then(|e| e.hashtags.as_ref())
        .map(|hs| hs.iter().map(|h| h.tag.clone()).collect())
        .unwrap_or_default()
}
