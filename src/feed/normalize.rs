//! Listing payload → [`Item`] normalization.
//!
//! The payload is walked as loose JSON so one odd entry never sinks the
//! whole listing: entries without an id or a creation time are dropped,
//! optional fields fall back to empty values.

use serde_json::Value;

use crate::storage::{Item, Media, MediaRef};

/// Width band used to pick a preview image, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPrefs {
    pub min_width: u32,
    pub max_width: u32,
}

impl Default for MediaPrefs {
    fn default() -> Self {
        Self {
            min_width: 320,
            max_width: 960,
        }
    }
}

/// Result of normalizing one listing.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub items: Vec<Item>,
    /// Entries dropped for lacking an id or a creation time.
    pub skipped: usize,
}

/// The payload was not a listing at all.
#[derive(Debug, thiserror::Error)]
#[error("Malformed listing: {0}")]
pub struct MalformedListing(pub String);

/// Parse a listing body (`{"data": {"children": [{"data": {...}}]}}`).
pub fn parse_listing(
    bytes: &[u8],
    fallback_source: &str,
    prefs: MediaPrefs,
) -> Result<ParseResult, MalformedListing> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| MalformedListing(e.to_string()))?;
    let children = root
        .pointer("/data/children")
        .and_then(Value::as_array)
        .ok_or_else(|| MalformedListing("missing data.children".to_string()))?;

    let mut result = ParseResult::default();
    for child in children {
        let entry = child.get("data").unwrap_or(child);
        match normalize_entry(entry, fallback_source, prefs) {
            Some(item) => result.items.push(item),
            None => result.skipped += 1,
        }
    }
    Ok(result)
}

/// Normalize one entry. `None` when it has no usable id or `created_utc`.
pub fn normalize_entry(entry: &Value, fallback_source: &str, prefs: MediaPrefs) -> Option<Item> {
    let id = entry
        .get("name")
        .or_else(|| entry.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())?
        .to_string();

    // Without a timestamp the item can be neither ordered nor aged out.
    let created_at = entry
        .get("created_utc")
        .and_then(Value::as_f64)
        .filter(|t| t.is_finite() && *t > 0.0)
        .map(|t| t as i64)?;

    let source_key = str_field(entry, "subreddit")
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_source)
        .to_string();

    Some(Item {
        id,
        source_key,
        author: str_field(entry, "author").unwrap_or("[deleted]").to_string(),
        created_at,
        title: str_field(entry, "title").unwrap_or_default().to_string(),
        text: str_field(entry, "selftext").unwrap_or_default().to_string(),
        url: str_field(entry, "url").map(unescape_url),
        permalink: str_field(entry, "permalink").map(str::to_string),
        score: entry.get("score").and_then(Value::as_i64).unwrap_or(0),
        num_comments: entry
            .get("num_comments")
            .and_then(Value::as_i64)
            .unwrap_or(0),
        media: extract_media(entry, prefs),
    })
}

fn str_field<'a>(entry: &'a Value, key: &str) -> Option<&'a str> {
    entry.get(key).and_then(Value::as_str)
}

/// Listing URLs arrive HTML-escaped unless the raw encoding was honored.
pub fn unescape_url(url: &str) -> String {
    url.replace("&amp;", "&")
}

fn media_ref(value: &Value) -> Option<MediaRef> {
    let url = value.get("url").and_then(Value::as_str)?;
    if url.is_empty() {
        return None;
    }
    let dim = |key| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    Some(MediaRef {
        url: unescape_url(url),
        width: dim("width"),
        height: dim("height"),
    })
}

/// Pick one preview image.
///
/// Order: the first resolution inside the width band, then the widest
/// resolution, then the full-size source image.
pub fn select_image(image: &Value, prefs: MediaPrefs) -> Option<MediaRef> {
    let resolutions: Vec<MediaRef> = image
        .get("resolutions")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(media_ref).collect())
        .unwrap_or_default();

    resolutions
        .iter()
        .find(|r| (prefs.min_width..=prefs.max_width).contains(&r.width))
        .or_else(|| resolutions.iter().max_by_key(|r| r.width))
        .cloned()
        .or_else(|| image.get("source").and_then(media_ref))
}

fn extract_media(entry: &Value, prefs: MediaPrefs) -> Option<Media> {
    let image = entry
        .pointer("/preview/images/0")
        .and_then(|img| select_image(img, prefs));

    let video = entry
        .pointer("/media/reddit_video")
        .or_else(|| entry.pointer("/secure_media/reddit_video"));
    let video_url = video
        .and_then(|v| v.get("fallback_url"))
        .and_then(Value::as_str)
        .map(unescape_url);
    let is_video = video.is_some()
        || entry
            .get("is_video")
            .and_then(Value::as_bool)
            .unwrap_or(false);
    let audio_url = video_url.as_deref().and_then(derive_audio_url);

    if image.is_none() && !is_video {
        return None;
    }
    Some(Media {
        image,
        is_video,
        video_url,
        audio_url,
    })
}

/// Hosted videos are served without sound; the audio track lives next to
/// the video file. `…/DASH_720.mp4?source=fallback` → `…/DASH_AUDIO_128.mp4`.
///
/// Returns `None` when the filename does not follow the `DASH_<digits>` form.
pub fn derive_audio_url(video_url: &str) -> Option<String> {
    let without_query = video_url.split(['?', '#']).next().unwrap_or(video_url);
    let (dir, file) = without_query.rsplit_once('/')?;
    let rest = file.strip_prefix("DASH_")?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let extension = &rest[digits_end..];
    if !(extension.is_empty() || extension.starts_with('.')) {
        return None;
    }
    Some(format!("{dir}/DASH_AUDIO_128{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn prefs() -> MediaPrefs {
        MediaPrefs {
            min_width: 320,
            max_width: 960,
        }
    }

    #[test]
    fn test_normalize_basic_fields() {
        let entry = json!({
            "name": "t3_abc",
            "id": "abc",
            "subreddit": "rust",
            "author": "ferris",
            "created_utc": 1700000000.0,
            "title": "Hello",
            "selftext": "body",
            "url": "https://example.com/?a=1&amp;b=2",
            "permalink": "/r/rust/comments/abc/hello/",
            "score": 42,
            "num_comments": 7
        });
        let item = normalize_entry(&entry, "fallback", prefs()).unwrap();

        assert_eq!(item.id, "t3_abc");
        assert_eq!(item.source_key, "rust");
        assert_eq!(item.author, "ferris");
        assert_eq!(item.created_at, 1_700_000_000);
        assert_eq!(item.url.as_deref(), Some("https://example.com/?a=1&b=2"));
        assert_eq!(item.score, 42);
        assert_eq!(item.num_comments, 7);
        assert!(item.media.is_none());
    }

    #[test]
    fn test_entry_without_id_is_dropped() {
        assert!(normalize_entry(&json!({"title": "x"}), "a", prefs()).is_none());
        assert!(normalize_entry(&json!({"name": "  "}), "a", prefs()).is_none());
    }

    #[test]
    fn test_entry_without_timestamp_is_dropped() {
        assert!(normalize_entry(&json!({"id": "x"}), "a", prefs()).is_none());
        assert!(normalize_entry(&json!({"id": "x", "created_utc": "soon"}), "a", prefs()).is_none());
        assert!(normalize_entry(&json!({"id": "x", "created_utc": 0.0}), "a", prefs()).is_none());
    }

    #[test]
    fn test_missing_source_uses_fallback() {
        let entry = json!({"id": "x", "created_utc": 1700000000.9});
        let item = normalize_entry(&entry, "popular", prefs()).unwrap();
        assert_eq!(item.source_key, "popular");
        assert_eq!(item.author, "[deleted]");
        assert_eq!(item.created_at, 1_700_000_000);
    }

    #[test]
    fn test_select_image_prefers_band() {
        let image = json!({
            "source": {"url": "https://i/src.jpg", "width": 4000, "height": 3000},
            "resolutions": [
                {"url": "https://i/108.jpg", "width": 108, "height": 81},
                {"url": "https://i/640.jpg?x=1&amp;y=2", "width": 640, "height": 480},
                {"url": "https://i/960.jpg", "width": 960, "height": 720}
            ]
        });
        let chosen = select_image(&image, prefs()).unwrap();
        assert_eq!(chosen.url, "https://i/640.jpg?x=1&y=2");
        assert_eq!(chosen.width, 640);
    }

    #[test]
    fn test_select_image_falls_back_to_widest_then_source() {
        let image = json!({
            "source": {"url": "https://i/src.jpg", "width": 4000, "height": 3000},
            "resolutions": [
                {"url": "https://i/108.jpg", "width": 108},
                {"url": "https://i/216.jpg", "width": 216}
            ]
        });
        assert_eq!(select_image(&image, prefs()).unwrap().url, "https://i/216.jpg");

        let only_source = json!({"source": {"url": "https://i/src.jpg", "width": 4000}});
        assert_eq!(
            select_image(&only_source, prefs()).unwrap().url,
            "https://i/src.jpg"
        );
        assert!(select_image(&json!({}), prefs()).is_none());
    }

    #[test]
    fn test_video_entry_gets_audio_url() {
        let entry = json!({
            "id": "vid",
            "created_utc": 1700000000.0,
            "is_video": true,
            "media": {"reddit_video": {"fallback_url": "https://v.redd.it/xyz/DASH_720.mp4?source=fallback"}}
        });
        let media = normalize_entry(&entry, "a", prefs()).unwrap().media.unwrap();
        assert!(media.is_video);
        assert_eq!(
            media.video_url.as_deref(),
            Some("https://v.redd.it/xyz/DASH_720.mp4?source=fallback")
        );
        assert_eq!(
            media.audio_url.as_deref(),
            Some("https://v.redd.it/xyz/DASH_AUDIO_128.mp4")
        );
    }

    #[test]
    fn test_derive_audio_url_requires_pattern() {
        assert_eq!(
            derive_audio_url("https://v.redd.it/a/DASH_1080"),
            Some("https://v.redd.it/a/DASH_AUDIO_128".to_string())
        );
        assert_eq!(derive_audio_url("https://v.redd.it/a/video.mp4"), None);
        assert_eq!(derive_audio_url("https://v.redd.it/a/DASH_.mp4"), None);
        assert_eq!(derive_audio_url("https://v.redd.it/a/DASH_720x.mp4"), None);
        assert_eq!(derive_audio_url("DASH_720.mp4"), None);
    }

    #[test]
    fn test_parse_listing_skips_bad_entries() {
        let body = json!({
            "kind": "Listing",
            "data": {"children": [
                {"kind": "t3", "data": {"name": "t3_1", "subreddit": "rust", "created_utc": 3.0}},
                {"kind": "t3", "data": {"title": "no id"}},
                {"kind": "t3", "data": {"name": "t3_undated", "subreddit": "rust"}},
                {"kind": "t3", "data": {"name": "t3_2", "subreddit": "rust", "created_utc": 2.0}}
            ]}
        });
        let result = parse_listing(body.to_string().as_bytes(), "rust", prefs()).unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.items[0].id, "t3_1");
    }

    #[test]
    fn test_parse_listing_rejects_non_listing() {
        assert!(parse_listing(b"<html>", "a", prefs()).is_err());
        assert!(parse_listing(br#"{"data": {}}"#, "a", prefs()).is_err());
    }
}
