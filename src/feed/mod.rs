//! Remote listings: fetching, normalization and merging into feeds.
//!
//! - [`fetcher`] - bounded-time HTTP retrieval behind the [`ItemSource`] seam
//! - [`normalize`] - listing JSON to [`Item`](crate::storage::Item) conversion
//! - [`merge`] - staging and applying fetched items without duplicates

pub mod fetcher;
pub mod merge;
pub mod normalize;

pub use fetcher::{
    parse_rate_limit_headers, FetchClient, FetchError, FetchReport, ItemSource, GLOBAL_SOURCE,
};
pub use merge::{apply_staged, stage_into, Merger};
pub use normalize::{parse_listing, MediaPrefs, ParseResult};
