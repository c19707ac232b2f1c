//! Incremental reconciliation of fetched items against a feed.
//!
//! Fetched items are first *staged* (held in `pending`) and only become
//! visible when the feed is *applied*. Every read-modify-write of a feed
//! runs under that feed's mutex, so overlapping fetches that finish out of
//! order queue up behind each other instead of interleaving.

use std::collections::HashSet;
use std::sync::Arc;

use super::fetcher::GLOBAL_SOURCE;
use crate::state::SyncState;
use crate::storage::{Feed, FeedKind, Item};

/// Stage the items whose id is neither applied nor already staged.
///
/// Duplicates inside `items` stage once (first occurrence wins). The
/// newest `created_at` per source is recorded in `last_fetch`. Returns the
/// number of newly staged items.
pub fn stage_into(feed: &mut Feed, items: Vec<Item>, source: Option<&str>) -> usize {
    let newest = items.iter().map(|item| item.created_at).max();
    if let Some(newest) = newest {
        let key = source.unwrap_or(GLOBAL_SOURCE).to_string();
        let entry = feed.last_fetch.entry(key).or_insert(newest);
        *entry = (*entry).max(newest);
    }

    let mut known: HashSet<String> = feed
        .items
        .iter()
        .chain(feed.pending.iter())
        .map(|item| item.id.clone())
        .collect();

    let before = feed.pending.len();
    for item in items {
        if known.insert(item.id.clone()) {
            feed.pending.push(item);
        }
    }
    feed.pending.len() - before
}

/// Fold staged items into the applied sequence.
///
/// Staged items come first so they win over an applied copy with the same
/// id; the merged list is stably sorted by `created_at` descending. Returns
/// how many items were staged (zero means nothing changed).
pub fn apply_staged(feed: &mut Feed) -> usize {
    if feed.pending.is_empty() {
        return 0;
    }
    let staged = std::mem::take(&mut feed.pending);
    let promoted = staged.len();

    let mut seen = HashSet::with_capacity(staged.len() + feed.items.len());
    let mut merged: Vec<Item> = staged
        .into_iter()
        .chain(std::mem::take(&mut feed.items))
        .filter(|item| seen.insert(item.id.clone()))
        .collect();
    merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    feed.items = merged;
    promoted
}

/// Serialized staging/apply access to the feeds in [`SyncState`].
pub struct Merger {
    state: Arc<SyncState>,
}

impl Merger {
    pub fn new(state: Arc<SyncState>) -> Self {
        Self { state }
    }

    /// Stage fetched items into one feed. Returns the count newly staged.
    pub async fn stage(&self, kind: FeedKind, items: Vec<Item>, source: Option<&str>) -> usize {
        let fetched = items.len();
        let mut feed = self.state.feed(kind).lock().await;
        let staged = stage_into(&mut feed, items, source);
        tracing::debug!(
            feed = %kind,
            source = source.unwrap_or(GLOBAL_SOURCE),
            fetched,
            staged,
            pending = feed.pending.len(),
            "Staged fetched items"
        );
        staged
    }

    /// Promote a feed's staged items. No-op when nothing is staged.
    pub async fn apply(&self, kind: FeedKind) -> usize {
        let mut feed = self.state.feed(kind).lock().await;
        let promoted = apply_staged(&mut feed);
        if promoted > 0 {
            tracing::info!(feed = %kind, promoted, total = feed.items.len(), "Applied staged items");
        }
        promoted
    }

    /// `(applied, staged)` counts for a feed.
    pub async fn counts(&self, kind: FeedKind) -> (usize, usize) {
        let feed = self.state.feed(kind).lock().await;
        (feed.items.len(), feed.pending.len())
    }
}
