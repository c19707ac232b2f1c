//! Job scheduling and request pacing.
//!
//! - [`jobs`] - job records and the persisted FIFO queue
//! - [`rate_limit`] - rolling request budget corrected by server headers
//! - [`scheduler`] - the sequential drain loop tying fetch, merge and storage together

pub mod jobs;
pub mod rate_limit;
pub mod scheduler;

pub use jobs::{Job, JobIds, JobKind, JobQueue, JobStatus, SequentialIds};
pub use rate_limit::{RateLimitHint, RateLimitState, RateLimiter};
pub use scheduler::{feed_for, RunReport, Scheduler, SyncEvent};
