//! Job records and the ordered queue the scheduler drains.
//!
//! The queue itself is plain data: it is persisted verbatim inside the
//! snapshot and every lifecycle transition goes through a method here so
//! the scheduler never pokes at job fields directly.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Job Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fetch the listing of one followed source.
    FetchSource,
    /// Fetch the global "popular" listing.
    FetchGlobal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Failed,
    FailedPermanently,
    Completed,
}

impl JobStatus {
    /// Terminal jobs never block an equivalent enqueue and are pruned
    /// at the end of a scheduling pass.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::FailedPermanently)
    }

    /// Jobs the scheduler will pick up.
    pub fn is_runnable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub kind: JobKind,
    /// Present only for [`JobKind::FetchSource`].
    #[serde(default)]
    pub source_key: Option<String>,
    pub status: JobStatus,
    #[serde(default)]
    pub retries: u32,
    /// Milliseconds since the Unix epoch.
    pub enqueued_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
}

impl Job {
    /// Same kind and same source (source names compare case-insensitively).
    pub fn is_equivalent(&self, kind: JobKind, source_key: Option<&str>) -> bool {
        if self.kind != kind {
            return false;
        }
        match (self.source_key.as_deref(), source_key) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    /// Human-readable target, used in logs and reports.
    pub fn target(&self) -> &str {
        self.source_key.as_deref().unwrap_or("popular")
    }
}

// ============================================================================
// Id Generation
// ============================================================================

/// Source of job identifiers. Injectable so tests can assert exact ids.
pub trait JobIds: Send + Sync {
    fn next_id(&self) -> u64;

    /// The id the next call will return, persisted so ids stay unique
    /// across restarts.
    fn peek(&self) -> u64;
}

/// Monotonic counter starting at a given value.
#[derive(Debug)]
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    pub fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first.max(1)))
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl JobIds for SequentialIds {
    fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    fn peek(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Queue
// ============================================================================

/// Ordered collection of jobs, FIFO by insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        Self { jobs }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == id)
    }

    /// Append a pending job unless an equivalent non-terminal one exists.
    pub fn enqueue(
        &mut self,
        kind: JobKind,
        source_key: Option<&str>,
        now_ms: i64,
        ids: &dyn JobIds,
    ) -> Option<Job> {
        let source_key = match kind {
            JobKind::FetchGlobal => None,
            JobKind::FetchSource => source_key,
        };

        if self
            .jobs
            .iter()
            .any(|j| !j.status.is_terminal() && j.is_equivalent(kind, source_key))
        {
            return None;
        }

        let job = Job {
            id: ids.next_id(),
            kind,
            source_key: source_key.map(str::to_string),
            status: JobStatus::Pending,
            retries: 0,
            enqueued_at: now_ms,
            started_at: None,
        };
        self.jobs.push(job.clone());
        Some(job)
    }

    /// First pending or failed job in insertion order.
    pub fn next_runnable(&self) -> Option<Job> {
        self.jobs.iter().find(|j| j.status.is_runnable()).cloned()
    }

    /// `pending|failed -> processing`, counting the attempt.
    pub fn start(&mut self, id: u64, now_ms: i64) -> Option<&Job> {
        let job = self.jobs.iter_mut().find(|j| j.id == id)?;
        job.status = JobStatus::Processing;
        job.retries = job.retries.saturating_add(1);
        job.started_at = Some(now_ms);
        Some(job)
    }

    pub fn set_status(&mut self, id: u64, status: JobStatus) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
            job.status = status;
        }
    }

    /// Crash recovery: a job left `processing` by a previous process
    /// restarts from scratch. Returns how many jobs were reset.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut reset = 0;
        for job in self
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Processing)
        {
            job.status = JobStatus::Pending;
            job.retries = 0;
            job.started_at = None;
            reset += 1;
        }
        reset
    }

    /// Drop completed and permanently failed jobs.
    pub fn prune_terminal(&mut self) -> Vec<Job> {
        let (removed, kept): (Vec<Job>, Vec<Job>) = std::mem::take(&mut self.jobs)
            .into_iter()
            .partition(|j| j.status.is_terminal());
        self.jobs = kept;
        removed
    }

    /// Drop jobs enqueued more than `max_age_ms` ago, whatever their status.
    pub fn prune_older_than(&mut self, now_ms: i64, max_age_ms: i64) -> usize {
        let before = self.jobs.len();
        self.jobs
            .retain(|j| now_ms.saturating_sub(j.enqueued_at) <= max_age_ms);
        before - self.jobs.len()
    }
}
