//! Sequential drain loop over the job queue.
//!
//! One pass (`run`) picks the first pending or failed job, executes it and
//! repeats until nothing runnable is left. Jobs never overlap; a second
//! `run` while one is in progress returns immediately.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::jobs::{Job, JobKind, JobStatus};
use super::rate_limit::RateLimiter;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::feed::{FetchError, ItemSource, Merger};
use crate::state::SyncState;
use crate::storage::{FeedKind, Item, Persistence};

/// Notifications for a UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A feed that already had applied items gained staged ones.
    NewItems { feed: FeedKind, staged: usize },
    /// A feed with nothing applied was populated without confirmation.
    InitialPopulationApplied { feed: FeedKind, applied: usize },
    /// A job exhausted its retries and was dropped from the queue.
    JobFailedPermanently { job: Job, last_error: Option<String> },
    /// A snapshot write failed even after eviction.
    SaveFailed { error: String },
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    pub completed: usize,
    /// Failed attempts, each of which left its job for a later retry.
    pub failed_attempts: usize,
    pub failed_permanently: Vec<Job>,
    /// Newly staged items per feed during this pass.
    pub staged: BTreeMap<FeedKind, usize>,
    /// Items applied automatically on initial population.
    pub auto_applied: BTreeMap<FeedKind, usize>,
    /// Jobs removed from the queue at the end of the pass.
    pub pruned: usize,
}

/// Resets the running flag however the pass ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    state: Arc<SyncState>,
    limiter: Arc<RateLimiter>,
    merger: Arc<Merger>,
    source: Arc<dyn ItemSource>,
    persistence: Arc<Persistence>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    fetch_retries: u32,
    running: AtomicBool,
    events: Option<mpsc::Sender<SyncEvent>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<SyncState>,
        limiter: Arc<RateLimiter>,
        merger: Arc<Merger>,
        source: Arc<dyn ItemSource>,
        persistence: Arc<Persistence>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
        fetch_retries: u32,
    ) -> Self {
        Self {
            state,
            limiter,
            merger,
            source,
            persistence,
            clock,
            config,
            fetch_retries,
            running: AtomicBool::new(false),
            events: None,
        }
    }

    /// Deliver [`SyncEvent`]s to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SyncEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queue a fetch unless an equivalent job is still outstanding.
    pub async fn enqueue(&self, kind: JobKind, source: Option<&str>) -> Option<Job> {
        let now = self.clock.now_ms();
        let job = self
            .state
            .jobs
            .lock()
            .await
            .enqueue(kind, source, now, self.state.job_ids());
        match &job {
            Some(job) => {
                tracing::debug!(job_id = job.id, target = job.target(), "Enqueued fetch job");
                self.persistence.mark_dirty().await;
            }
            None => {
                tracing::debug!(
                    source = source.unwrap_or("popular"),
                    "Equivalent job already queued, not enqueuing"
                );
            }
        }
        job
    }

    /// Drain the queue. See the module docs.
    pub async fn run(&self) -> RunReport {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::debug!("Sync pass already running");
            return RunReport {
                skipped: true,
                ..RunReport::default()
            };
        }
        let _guard = RunGuard(&self.running);

        let mut report = RunReport::default();
        let mut last_errors: HashMap<u64, FetchError> = HashMap::new();

        loop {
            let next = self.state.jobs.lock().await.next_runnable();
            let Some(job) = next else { break };

            if job.retries >= self.config.max_retries {
                self.state
                    .jobs
                    .lock()
                    .await
                    .set_status(job.id, JobStatus::FailedPermanently);
                let last_error = last_errors.remove(&job.id).map(|e| e.to_string());
                tracing::warn!(
                    job_id = job.id,
                    target = job.target(),
                    retries = job.retries,
                    error = last_error.as_deref().unwrap_or("unknown"),
                    "Job failed permanently"
                );
                let job = Job {
                    status: JobStatus::FailedPermanently,
                    ..job
                };
                self.emit(SyncEvent::JobFailedPermanently {
                    job: job.clone(),
                    last_error,
                });
                report.failed_permanently.push(job);
                self.persistence.mark_dirty().await;
                continue;
            }

            if job.status == JobStatus::Failed && job.retries > 0 {
                let delay = backoff(self.config.retry_backoff(), job.retries - 1);
                tracing::debug!(
                    job_id = job.id,
                    retries = job.retries,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before retrying job"
                );
                self.clock.sleep(delay).await;
            }

            let now = self.clock.now_ms();
            self.state.jobs.lock().await.start(job.id, now);
            self.persistence.mark_dirty().await;

            match self.execute(&job).await {
                Ok(staged) => {
                    self.state
                        .jobs
                        .lock()
                        .await
                        .set_status(job.id, JobStatus::Completed);
                    *report.staged.entry(feed_for(job.kind)).or_default() += staged;
                    report.completed += 1;
                }
                Err(e) => {
                    tracing::warn!(job_id = job.id, target = job.target(), error = %e, "Job failed");
                    self.state
                        .jobs
                        .lock()
                        .await
                        .set_status(job.id, JobStatus::Failed);
                    last_errors.insert(job.id, e);
                    report.failed_attempts += 1;
                }
            }
            self.persistence.mark_dirty().await;
            self.checkpoint().await;
        }

        report.pruned = self.prune().await;
        self.settle_feeds(&mut report).await;
        self.persistence.mark_dirty().await;
        self.checkpoint().await;

        tracing::info!(
            completed = report.completed,
            failed_attempts = report.failed_attempts,
            failed_permanently = report.failed_permanently.len(),
            pruned = report.pruned,
            "Sync pass finished"
        );
        report
    }

    /// Fetch one listing (with in-job retries) and stage the result.
    async fn execute(&self, job: &Job) -> Result<usize, FetchError> {
        let source = match job.kind {
            JobKind::FetchSource => job.source_key.as_deref(),
            JobKind::FetchGlobal => None,
        };
        let mut attempt = 0u32;

        let items = loop {
            self.limiter.acquire().await;
            let report = self.source.fetch(source).await;
            if let Some(hint) = report.hint {
                self.limiter.observe(hint).await;
            }

            match report.result {
                Ok(items) => break items,
                Err(e) if e.is_retryable() => {
                    let budget = self.fetch_retries.min(self.limiter.remaining().await);
                    if attempt >= budget {
                        return Err(e);
                    }
                    let delay = backoff(self.config.retry_backoff(), attempt);
                    tracing::debug!(
                        error = %e,
                        target = job.target(),
                        retry = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying fetch after transient error"
                    );
                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let items = self.drop_blocked(items).await;
        let staged = self.merger.stage(feed_for(job.kind), items, source).await;
        if staged > 0 {
            self.persistence.mark_dirty().await;
            if let Err(e) = self.persistence.enforce_quota().await {
                tracing::warn!(error = %e, "Storage check failed");
            }
        }
        Ok(staged)
    }

    async fn drop_blocked(&self, mut items: Vec<Item>) -> Vec<Item> {
        let library = self.state.library.lock().await;
        let before = items.len();
        items.retain(|item| !library.is_blocked(item));
        if items.len() < before {
            tracing::debug!(blocked = before - items.len(), "Dropped items from blocked sources or authors");
        }
        items
    }

    /// Remove terminal jobs and jobs past their maximum age.
    async fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        let max_age_ms =
            i64::try_from(self.config.job_max_age_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let mut jobs = self.state.jobs.lock().await;
        let terminal = jobs.prune_terminal().len();
        let expired = jobs.prune_older_than(now, max_age_ms);
        if expired > 0 {
            tracing::info!(expired, "Pruned over-age jobs");
        }
        terminal + expired
    }

    /// Auto-apply initial populations and announce new staged items.
    async fn settle_feeds(&self, report: &mut RunReport) {
        let mut applied_any = false;
        for kind in FeedKind::ALL {
            let (applied, pending) = self.merger.counts(kind).await;
            if applied == 0 && pending > 0 && self.config.auto_apply_initial {
                let promoted = self.merger.apply(kind).await;
                report.auto_applied.insert(kind, promoted);
                applied_any = true;
                self.emit(SyncEvent::InitialPopulationApplied {
                    feed: kind,
                    applied: promoted,
                });
            } else if let Some(&staged) = report.staged.get(&kind).filter(|&&n| n > 0) {
                tracing::info!(feed = %kind, staged, "New items ready to apply");
                self.emit(SyncEvent::NewItems { feed: kind, staged });
            }
        }
        if applied_any {
            self.persistence
                .storage()
                .evict_by_age(&self.state, self.clock.now_secs())
                .await;
        }
    }

    async fn checkpoint(&self) {
        if let Err(e) = self.persistence.flush_if_due().await {
            tracing::error!(error = %e, "Failed to save state");
            self.emit(SyncEvent::SaveFailed {
                error: e.to_string(),
            });
        }
    }

    fn emit(&self, event: SyncEvent) {
        if let Some(tx) = &self.events {
            if let Err(e) = tx.try_send(event) {
                tracing::warn!(error = %e, "Sync event dropped");
            }
        }
    }
}

/// Feed that receives a job's items.
pub fn feed_for(kind: JobKind) -> FeedKind {
    match kind {
        JobKind::FetchSource => FeedKind::Subscribed,
        JobKind::FetchGlobal => FeedKind::Global,
    }
}

/// `base * 2^exponent`, saturating.
fn backoff(base: Duration, exponent: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(exponent))
}
