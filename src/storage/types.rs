use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors surfaced by the persistence layer.
///
/// Loading never fails (corrupt fields fall back to defaults), so these only
/// come out of saves.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Snapshot does not fit within the storage quota, even after eviction.
    #[error("Storage full: snapshot needs {needed} bytes, quota is {quota} bytes")]
    StorageFull { needed: u64, quota: u64 },
}

// ============================================================================
// Items
// ============================================================================

/// A single picture reference chosen from the available resolutions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Media attached to an item after normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Media {
    pub image: Option<MediaRef>,
    pub is_video: bool,
    pub video_url: Option<String>,
    /// Best-effort separate audio track for videos served without sound.
    pub audio_url: Option<String>,
}

/// A normalized feed entry.
///
/// Items are immutable once fetched. Pin status lives in [`Library`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub source_key: String,
    #[serde(default)]
    pub author: String,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub num_comments: i64,
    #[serde(default)]
    pub media: Option<Media>,
}

// ============================================================================
// Feeds
// ============================================================================

/// Logical feed views held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    /// Items from every followed source. The primary feed for quota eviction.
    Subscribed,
    /// Items from the distinguished "popular" pseudo-source.
    Global,
}

impl FeedKind {
    pub const ALL: [FeedKind; 2] = [FeedKind::Subscribed, FeedKind::Global];

    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Subscribed => "subscribed",
            FeedKind::Global => "global",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "subscribed" => Ok(FeedKind::Subscribed),
            "global" | "popular" => Ok(FeedKind::Global),
            other => Err(format!("unknown feed '{other}' (expected subscribed or global)")),
        }
    }
}

/// One feed view: applied items, staged items and per-source bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Feed {
    /// Visible items, unique by id, `created_at` descending once applied.
    pub items: Vec<Item>,
    /// Fetched but not yet applied, unique by id.
    pub pending: Vec<Item>,
    /// Newest `created_at` seen per source. Observability only.
    pub last_fetch: BTreeMap<String, i64>,
}

impl Feed {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.pending.is_empty()
    }
}

// ============================================================================
// Library
// ============================================================================

/// User-curated state: followed sources, block-lists and pinned items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Library {
    pub subscriptions: Vec<String>,
    pub blocked_sources: Vec<String>,
    pub blocked_authors: Vec<String>,
    /// Full records of pinned items, so they survive eviction from feeds.
    pub pinned: Vec<Item>,
}

impl Library {
    pub fn pinned_ids(&self) -> HashSet<String> {
        self.pinned.iter().map(|item| item.id.clone()).collect()
    }

    pub fn is_subscribed(&self, source: &str) -> bool {
        contains_ignore_case(&self.subscriptions, source)
    }

    /// Whether an item comes from a blocked source or a blocked author.
    pub fn is_blocked(&self, item: &Item) -> bool {
        contains_ignore_case(&self.blocked_sources, &item.source_key)
            || contains_ignore_case(&self.blocked_authors, &item.author)
    }
}

pub(crate) fn contains_ignore_case(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n.eq_ignore_ascii_case(name))
}
