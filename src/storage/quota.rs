//! Storage budget and eviction.
//!
//! Two eviction paths keep the store bounded: an occupancy-threshold pass
//! that trims the oldest fifth of the primary feed, and an age pass that
//! drops anything older than the configured maximum. Pinned items are
//! exempt from both.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use super::types::{Feed, FeedKind};
use crate::config::StorageConfig;
use crate::state::SyncState;

/// Feed whose size drives threshold eviction.
pub const PRIMARY_FEED: FeedKind = FeedKind::Subscribed;

// ============================================================================
// Quota
// ============================================================================

/// Reports how many bytes the platform can still give us.
pub trait QuotaProbe: Send + Sync {
    fn available_bytes(&self) -> Option<u64>;
}

/// Free space on the disk holding a path, via `sysinfo`.
#[derive(Debug, Clone)]
pub struct DiskProbe {
    path: PathBuf,
}

impl DiskProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The path itself may not exist yet; walk up to the first ancestor that does.
    fn resolved(&self) -> Option<PathBuf> {
        self.path
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty())
            .find_map(|p| p.canonicalize().ok())
    }
}

impl QuotaProbe for DiskProbe {
    fn available_bytes(&self) -> Option<u64> {
        let target = self.resolved()?;
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// A fixed amount of space, for tests and for platforms without a probe.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub u64);

impl QuotaProbe for FixedProbe {
    fn available_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}

/// Byte ceiling and current occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageQuota {
    pub quota_bytes: u64,
    pub occupied_bytes: u64,
}

impl StorageQuota {
    pub fn ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            return f64::INFINITY;
        }
        self.occupied_bytes as f64 / self.quota_bytes as f64
    }

    pub fn fits(&self) -> bool {
        self.occupied_bytes <= self.quota_bytes
    }
}

// ============================================================================
// StorageManager
// ============================================================================

pub struct StorageManager {
    probe: Arc<dyn QuotaProbe>,
    config: StorageConfig,
}

impl StorageManager {
    pub fn new(probe: Arc<dyn QuotaProbe>, config: StorageConfig) -> Self {
        Self { probe, config }
    }

    /// Quota for a store currently occupying `occupied_bytes`.
    ///
    /// Platform space is clamped to the configured hard ceiling; when the
    /// platform cannot report, the ceiling alone applies.
    pub fn quota(&self, occupied_bytes: u64) -> StorageQuota {
        let ceiling = self.config.max_store_bytes;
        let quota_bytes = self
            .probe
            .available_bytes()
            .map_or(ceiling, |available| available.min(ceiling));
        StorageQuota {
            quota_bytes,
            occupied_bytes,
        }
    }

    /// Trim the oldest unpinned items once occupancy crosses the threshold.
    ///
    /// Returns the ids removed.
    pub async fn evict_if_over_threshold(
        &self,
        state: &SyncState,
        quota: StorageQuota,
    ) -> Vec<String> {
        let ratio = quota.ratio();
        if ratio < self.config.eviction_threshold {
            tracing::trace!(ratio = ratio, "Storage below eviction threshold");
            return Vec::new();
        }

        let library = state.library.lock().await;
        let pinned = library.pinned_ids();
        let mut subscribed = state.feed(FeedKind::Subscribed).lock().await;
        let mut global = state.feed(FeedKind::Global).lock().await;
        let (primary, mut others) = match PRIMARY_FEED {
            FeedKind::Subscribed => (&mut *subscribed, vec![&mut *global]),
            FeedKind::Global => (&mut *global, vec![&mut *subscribed]),
        };

        let count = (primary.items.len() as f64 * self.config.eviction_fraction).floor() as usize;
        let removed = evict_oldest(primary, &mut others, &pinned, count);
        tracing::info!(
            ratio = ratio,
            occupied = quota.occupied_bytes,
            quota = quota.quota_bytes,
            evicted = removed.len(),
            "Storage over threshold, evicted oldest items"
        );
        removed
    }

    /// Drop unpinned items older than the configured age from every feed.
    pub async fn evict_by_age(&self, state: &SyncState, now_secs: i64) -> usize {
        let max_age = self.config.max_item_age_secs();
        let library = state.library.lock().await;
        let pinned = library.pinned_ids();

        let mut removed = 0;
        for kind in FeedKind::ALL {
            let mut feed = state.feed(kind).lock().await;
            removed += evict_older_than(&mut feed, &pinned, now_secs, max_age);
        }
        if removed > 0 {
            tracing::info!(evicted = removed, max_age_secs = max_age, "Evicted expired items");
        }
        removed
    }
}

/// Remove up to `count` of the oldest unpinned applied items of `primary`
/// (scanning from the tail, as applied items are newest-first) and the same
/// ids from every other feed.
pub fn evict_oldest(
    primary: &mut Feed,
    others: &mut [&mut Feed],
    pinned: &HashSet<String>,
    count: usize,
) -> Vec<String> {
    if count == 0 {
        return Vec::new();
    }

    let victims: Vec<String> = primary
        .items
        .iter()
        .rev()
        .filter(|item| !pinned.contains(&item.id))
        .take(count)
        .map(|item| item.id.clone())
        .collect();
    let doomed: HashSet<&str> = victims.iter().map(String::as_str).collect();

    primary.items.retain(|item| !doomed.contains(item.id.as_str()));
    for feed in others.iter_mut() {
        feed.items.retain(|item| !doomed.contains(item.id.as_str()));
        feed.pending.retain(|item| !doomed.contains(item.id.as_str()));
    }
    victims
}

/// Remove unpinned items whose age exceeds `max_age_secs`, applied and staged.
pub fn evict_older_than(
    feed: &mut Feed,
    pinned: &HashSet<String>,
    now_secs: i64,
    max_age_secs: i64,
) -> usize {
    let before = feed.items.len() + feed.pending.len();
    let keep = |item: &super::types::Item| {
        pinned.contains(&item.id) || now_secs.saturating_sub(item.created_at) <= max_age_secs
    };
    feed.items.retain(|item| keep(item));
    feed.pending.retain(|item| keep(item));
    before - feed.items.len() - feed.pending.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Item;
    use proptest::prelude::*;

    fn item(id: usize, created_at: i64) -> Item {
        Item {
            id: format!("t3_{id}"),
            source_key: "rust".to_string(),
            author: "ferris".to_string(),
            created_at,
            title: String::new(),
            text: String::new(),
            url: None,
            permalink: None,
            score: 0,
            num_comments: 0,
            media: None,
        }
    }

    /// Newest first, as an applied feed is kept.
    fn sorted_feed(n: usize) -> Feed {
        Feed {
            items: (0..n).rev().map(|i| item(i, i as i64)).collect(),
            ..Feed::default()
        }
    }

    fn manager(threshold: f64) -> StorageManager {
        StorageManager::new(
            Arc::new(FixedProbe(u64::MAX)),
            StorageConfig {
                max_store_bytes: 1_000,
                eviction_threshold: threshold,
                ..StorageConfig::default()
            },
        )
    }

    #[test]
    fn test_quota_clamps_to_ceiling() {
        let big = StorageManager::new(Arc::new(FixedProbe(u64::MAX)), StorageConfig::default());
        assert_eq!(big.quota(0).quota_bytes, StorageConfig::default().max_store_bytes);

        let small = StorageManager::new(Arc::new(FixedProbe(10)), StorageConfig::default());
        let quota = small.quota(20);
        assert_eq!(quota.quota_bytes, 10);
        assert_eq!(quota.ratio(), 2.0);
        assert!(!quota.fits());
    }

    #[test]
    fn test_evict_oldest_skips_pinned_and_mirrors() {
        let mut primary = sorted_feed(10);
        let mut other = Feed {
            items: vec![item(0, 0), item(9, 9)],
            pending: vec![item(1, 1)],
            ..Feed::default()
        };
        let pinned: HashSet<String> = ["t3_0".to_string()].into_iter().collect();

        let removed = evict_oldest(&mut primary, &mut [&mut other], &pinned, 2);
        assert_eq!(removed, vec!["t3_1".to_string(), "t3_2".to_string()]);
        assert_eq!(primary.items.len(), 8);
        assert_eq!(primary.items.last().unwrap().id, "t3_0");
        assert_eq!(other.items.len(), 2);
        assert!(other.pending.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_eviction_removes_a_fifth_of_primary() {
        let state = SyncState::default();
        *state.feed(FeedKind::Subscribed).lock().await = sorted_feed(1_000);

        let mgr = manager(0.9);
        let quota = StorageQuota {
            quota_bytes: 1_000,
            occupied_bytes: 950,
        };
        let removed = mgr.evict_if_over_threshold(&state, quota).await;

        assert_eq!(removed.len(), 200);
        let feed = state.feed(FeedKind::Subscribed).lock().await;
        assert_eq!(feed.items.len(), 800);
        // The 200 oldest (created_at 0..200) are gone.
        assert!(feed.items.iter().all(|i| i.created_at >= 200));
    }

    #[tokio::test]
    async fn test_evict_by_age_keeps_pinned() {
        let state = SyncState::default();
        {
            let mut feed = state.feed(FeedKind::Global).lock().await;
            feed.items = vec![item(1, 1_000), item(2, 10)];
            feed.pending = vec![item(3, 5)];
        }
        state.library.lock().await.pinned.push(item(2, 10));

        let mgr = StorageManager::new(
            Arc::new(FixedProbe(u64::MAX)),
            StorageConfig {
                max_item_age_days: 0,
                ..StorageConfig::default()
            },
        );
        let removed = mgr.evict_by_age(&state, 1_000).await;

        assert_eq!(removed, 1);
        let feed = state.feed(FeedKind::Global).lock().await;
        let ids: Vec<&str> = feed.items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["t3_1", "t3_2"]);
        assert!(feed.pending.is_empty());
    }

    proptest! {
        #[test]
        fn prop_age_eviction_never_removes_pinned(
            ages in prop::collection::vec(0i64..10_000, 0..50),
            pin_mask in prop::collection::vec(any::<bool>(), 50),
            max_age in 0i64..10_000,
        ) {
            let mut feed = Feed {
                items: ages.iter().enumerate().map(|(i, a)| item(i, 10_000 - a)).collect(),
                ..Feed::default()
            };
            let pinned: HashSet<String> = (0..ages.len())
                .filter(|i| pin_mask[*i])
                .map(|i| format!("t3_{i}"))
                .collect();

            evict_older_than(&mut feed, &pinned, 10_000, max_age);

            for id in &pinned {
                prop_assert!(feed.items.iter().any(|i| &i.id == id));
            }
            for it in &feed.items {
                prop_assert!(pinned.contains(&it.id) || 10_000 - it.created_at <= max_age);
            }
        }

        #[test]
        fn prop_below_threshold_is_noop(
            n in 0usize..300,
            occupied in 0u64..900,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let state = SyncState::default();
            let removed = rt.block_on(async {
                *state.feed(FeedKind::Subscribed).lock().await = sorted_feed(n);
                manager(0.9)
                    .evict_if_over_threshold(&state, StorageQuota { quota_bytes: 1_000, occupied_bytes: occupied })
                    .await
            });
            prop_assert!(removed.is_empty());
            let len = rt.block_on(async { state.feed(FeedKind::Subscribed).lock().await.items.len() });
            prop_assert_eq!(len, n);
        }
    }
}
