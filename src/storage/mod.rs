//! Durable state: the snapshot format, debounced writes and the storage budget.

mod persist;
pub mod quota;
mod snapshot;
mod types;

pub use persist::{FlushState, Persistence};
pub use quota::{DiskProbe, FixedProbe, QuotaProbe, StorageManager, StorageQuota};
pub(crate) use snapshot::write_atomic;
pub use snapshot::{PersistentStore, Snapshot, SNAPSHOT_VERSION};
pub(crate) use types::contains_ignore_case;
pub use types::{Feed, FeedKind, Item, Library, Media, MediaRef, StoreError};
