//! The assembled sync engine and the operations a front end calls.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::feed::{FetchClient, ItemSource, Merger};
use crate::state::SyncState;
use crate::storage::{
    contains_ignore_case, DiskProbe, FeedKind, Item, Library, PersistentStore, Persistence, QuotaProbe,
    StorageManager, StorageQuota,
};
use crate::sync::{Job, JobKind, RateLimitState, RateLimiter, RunReport, Scheduler, SyncEvent};
use crate::transfer::{self, ExportDocument, ImportSummary};
use crate::util::validate_source_key;

/// Per-feed counts for [`EngineStatus`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeedStatus {
    pub applied: usize,
    pub staged: usize,
    pub last_fetch: BTreeMap<String, i64>,
}

/// Point-in-time overview of the engine.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state_path: PathBuf,
    pub feeds: BTreeMap<FeedKind, FeedStatus>,
    pub jobs: Vec<Job>,
    pub rate_limit: RateLimitState,
    pub subscriptions: Vec<String>,
    pub blocked_sources: usize,
    pub blocked_authors: usize,
    pub pinned: usize,
    pub quota: StorageQuota,
}

pub struct Engine {
    config: Config,
    state: Arc<SyncState>,
    clock: Arc<dyn Clock>,
    persistence: Arc<Persistence>,
    merger: Arc<Merger>,
    scheduler: Scheduler,
}

impl Engine {
    /// Production wiring: system clock, HTTP client, disk-space probe.
    pub async fn open_default(config: Config, state_path: &Path) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let client = FetchClient::new(config.fetch.clone(), clock.clone())
            .context("Failed to build HTTP client")?;
        Ok(Self::open(config, state_path, clock, Arc::new(client)).await)
    }

    /// Open with the disk holding `state_path` as quota source.
    pub async fn open(
        config: Config,
        state_path: &Path,
        clock: Arc<dyn Clock>,
        source: Arc<dyn ItemSource>,
    ) -> Self {
        let probe = Arc::new(DiskProbe::new(state_path));
        Self::open_with_probe(config, state_path, clock, source, probe).await
    }

    /// Load state from `state_path` (never fails; see [`PersistentStore::load`]),
    /// recover interrupted jobs and bring storage back within budget.
    pub async fn open_with_probe(
        config: Config,
        state_path: &Path,
        clock: Arc<dyn Clock>,
        source: Arc<dyn ItemSource>,
        probe: Arc<dyn QuotaProbe>,
    ) -> Self {
        let store = PersistentStore::new(state_path);
        let state = Arc::new(SyncState::from_snapshot(store.load()));

        let mut changed = false;
        {
            let mut jobs = state.jobs.lock().await;
            let recovered = jobs.recover_interrupted();
            if recovered > 0 {
                tracing::info!(recovered, "Reset jobs interrupted by a previous run");
            }
            let max_age_ms = i64::try_from(config.sync.job_max_age_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX);
            let expired = jobs.prune_older_than(clock.now_ms(), max_age_ms);
            if expired > 0 {
                tracing::info!(expired, "Dropped over-age jobs on load");
            }
            changed |= recovered + expired > 0;
        }

        let storage = StorageManager::new(probe, config.storage.clone());
        let persistence = Arc::new(Persistence::new(
            state.clone(),
            store,
            storage,
            clock.clone(),
            config.storage.flush_delay_ms,
        ));

        changed |= persistence
            .storage()
            .evict_by_age(&state, clock.now_secs())
            .await
            > 0;
        match persistence.enforce_quota().await {
            Ok(evicted) => changed |= !evicted.is_empty(),
            Err(e) => tracing::warn!(error = %e, "Storage check on load failed"),
        }
        if changed {
            persistence.mark_dirty().await;
        }

        let merger = Arc::new(Merger::new(state.clone()));
        let limiter = Arc::new(RateLimiter::new(
            state.clone(),
            clock.clone(),
            config.rate_limit.clone(),
        ));
        let scheduler = Scheduler::new(
            state.clone(),
            limiter,
            merger.clone(),
            source,
            persistence.clone(),
            clock.clone(),
            config.sync.clone(),
            config.fetch.fetch_retries,
        );

        Self {
            config,
            state,
            clock,
            persistence,
            merger,
            scheduler,
        }
    }

    /// Deliver scheduler notifications to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SyncEvent>) -> Self {
        self.scheduler = self.scheduler.with_events(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Queue one job per subscription plus the global listing.
    pub async fn enqueue_all(&self) -> Vec<Job> {
        let subscriptions = self.state.library.lock().await.subscriptions.clone();
        let mut queued = Vec::with_capacity(subscriptions.len() + 1);
        for source in &subscriptions {
            queued.extend(self.scheduler.enqueue(JobKind::FetchSource, Some(source)).await);
        }
        queued.extend(self.scheduler.enqueue(JobKind::FetchGlobal, None).await);
        queued
    }

    /// Enqueue everything and drain the queue once.
    pub async fn sync(&self) -> RunReport {
        self.enqueue_all().await;
        self.scheduler.run().await
    }

    /// Promote staged items of one feed, or of every feed when `None`.
    ///
    /// Age eviction follows every apply.
    pub async fn apply(&self, kind: Option<FeedKind>) -> usize {
        let kinds = match kind {
            Some(kind) => vec![kind],
            None => FeedKind::ALL.to_vec(),
        };
        let mut promoted = 0;
        for kind in kinds {
            promoted += self.merger.apply(kind).await;
        }
        let evicted = self
            .persistence
            .storage()
            .evict_by_age(&self.state, self.clock.now_secs())
            .await;
        if promoted + evicted > 0 {
            self.persistence.mark_dirty().await;
        }
        promoted
    }

    /// Applied items of a feed, newest first.
    pub async fn items(&self, kind: FeedKind, limit: usize) -> Vec<Item> {
        let feed = self.state.feed(kind).lock().await;
        feed.items.iter().take(limit).cloned().collect()
    }

    // ------------------------------------------------------------------
    // Library
    // ------------------------------------------------------------------

    /// Follow a source. Returns false if it was already followed.
    pub async fn subscribe(&self, source: &str) -> Result<bool> {
        let key = validate_source_key(source)
            .with_context(|| format!("Cannot subscribe to '{source}'"))?;
        let added = {
            let mut library = self.state.library.lock().await;
            if library.is_subscribed(key) {
                false
            } else {
                library.subscriptions.push(key.to_string());
                true
            }
        };
        if added {
            tracing::info!(source = key, "Subscribed");
            self.persistence.mark_dirty().await;
        }
        Ok(added)
    }

    /// Stop following a source. Items already fetched stay until evicted.
    ///
    /// Accepts the same key forms as [`Engine::subscribe`]; input that is not
    /// a valid key is matched as given, so stale entries can still be removed.
    pub async fn unsubscribe(&self, source: &str) -> bool {
        let key = validate_source_key(source).unwrap_or_else(|_| source.trim());
        let removed = {
            let mut library = self.state.library.lock().await;
            let before = library.subscriptions.len();
            library
                .subscriptions
                .retain(|s| !s.eq_ignore_ascii_case(key));
            library.subscriptions.len() < before
        };
        if removed {
            tracing::info!(source = key, "Unsubscribed");
            self.persistence.mark_dirty().await;
        }
        removed
    }

    /// Pin an item found in any feed. Pinned items are never evicted.
    pub async fn pin(&self, item_id: &str) -> Result<bool> {
        let added = {
            let mut library = self.state.library.lock().await;
            if library.pinned.iter().any(|item| item.id == item_id) {
                false
            } else {
                let mut found = None;
                for kind in FeedKind::ALL {
                    let feed = self.state.feed(kind).lock().await;
                    found = feed
                        .items
                        .iter()
                        .chain(feed.pending.iter())
                        .find(|item| item.id == item_id)
                        .cloned();
                    if found.is_some() {
                        break;
                    }
                }
                let item = found.with_context(|| format!("No item with id '{item_id}'"))?;
                library.pinned.push(item);
                true
            }
        };
        if added {
            self.persistence.mark_dirty().await;
        }
        Ok(added)
    }

    pub async fn unpin(&self, item_id: &str) -> bool {
        let removed = {
            let mut library = self.state.library.lock().await;
            let before = library.pinned.len();
            library.pinned.retain(|item| item.id != item_id);
            library.pinned.len() < before
        };
        if removed {
            self.persistence.mark_dirty().await;
        }
        removed
    }

    pub async fn pinned(&self) -> Vec<Item> {
        self.state.library.lock().await.pinned.clone()
    }

    /// Block a source; its unpinned items leave every feed. Returns how
    /// many items were removed.
    pub async fn block_source(&self, source: &str) -> Result<usize> {
        let key = validate_source_key(source)
            .with_context(|| format!("Cannot block '{source}'"))?;
        Ok(self
            .block(|library| &mut library.blocked_sources, key, |item| {
                item.source_key.eq_ignore_ascii_case(key)
            })
            .await)
    }

    /// Block an author; their unpinned items leave every feed.
    pub async fn block_author(&self, author: &str) -> usize {
        let author = author.trim();
        if author.is_empty() {
            return 0;
        }
        self.block(|library| &mut library.blocked_authors, author, |item| {
            item.author.eq_ignore_ascii_case(author)
        })
        .await
    }

    async fn block(
        &self,
        list: impl FnOnce(&mut Library) -> &mut Vec<String>,
        name: &str,
        matches: impl Fn(&Item) -> bool,
    ) -> usize {
        let mut library = self.state.library.lock().await;
        let names = list(&mut *library);
        if !contains_ignore_case(names, name) {
            names.push(name.to_string());
        }
        let pinned = library.pinned_ids();

        let mut removed = 0;
        for kind in FeedKind::ALL {
            let mut feed = self.state.feed(kind).lock().await;
            let before = feed.items.len() + feed.pending.len();
            let keep = |item: &Item| pinned.contains(&item.id) || !matches(item);
            feed.items.retain(|item| keep(item));
            feed.pending.retain(|item| keep(item));
            removed += before - feed.items.len() - feed.pending.len();
        }
        drop(library);

        tracing::info!(blocked = name, removed, "Blocked");
        self.persistence.mark_dirty().await;
        removed
    }

    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------

    pub async fn export(&self, path: &Path) -> Result<ExportDocument> {
        self.flush_quietly().await;
        let doc = {
            let library = self.state.library.lock().await;
            ExportDocument::from_library(&library, chrono::Utc::now())
        };
        transfer::write_document(&doc, path)
            .with_context(|| format!("Failed to export to '{}'", path.display()))?;
        tracing::info!(
            path = %path.display(),
            subscriptions = doc.subscriptions.len(),
            pinned = doc.pinned.len(),
            "Exported library"
        );
        Ok(doc)
    }

    pub async fn import(&self, path: &Path) -> Result<ImportSummary> {
        let doc = transfer::read_document(path)
            .with_context(|| format!("Failed to import '{}'", path.display()))?;
        let summary = transfer::merge_into(&mut *self.state.library.lock().await, doc);
        if summary.total() > 0 {
            self.persistence.mark_dirty().await;
        }
        tracing::info!(path = %path.display(), added = summary.total(), "Imported library");
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Status & shutdown
    // ------------------------------------------------------------------

    pub async fn status(&self) -> Result<EngineStatus> {
        self.flush_quietly().await;
        let quota = self
            .persistence
            .quota()
            .await
            .context("Failed to measure storage")?;
        let library = self.state.library.lock().await.clone();
        let mut feeds = BTreeMap::new();
        for kind in FeedKind::ALL {
            let feed = self.state.feed(kind).lock().await;
            feeds.insert(
                kind,
                FeedStatus {
                    applied: feed.items.len(),
                    staged: feed.pending.len(),
                    last_fetch: feed.last_fetch.clone(),
                },
            );
        }
        Ok(EngineStatus {
            state_path: self.persistence.store().path().to_path_buf(),
            feeds,
            jobs: self.state.jobs.lock().await.jobs().to_vec(),
            rate_limit: self.state.rate_limit.lock().await.clone(),
            subscriptions: library.subscriptions,
            blocked_sources: library.blocked_sources.len(),
            blocked_authors: library.blocked_authors.len(),
            pinned: library.pinned.len(),
            quota,
        })
    }

    async fn flush_quietly(&self) {
        if let Err(e) = self.persistence.flush().await {
            tracing::warn!(error = %e, "Failed to save state");
        }
    }

    /// Write any pending change now. Call before exiting.
    pub async fn shutdown(&self) -> Result<()> {
        self.persistence
            .flush()
            .await
            .context("Failed to save state on shutdown")?;
        Ok(())
    }
}
