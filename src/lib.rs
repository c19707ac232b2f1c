//! Offline-first feed cache.
//!
//! Listings from a rate-limited remote API are fetched by a sequential job
//! scheduler, merged into local feeds without duplicates and kept within a
//! storage budget in one snapshot file. [`engine::Engine`] wires it all
//! together.

pub mod clock;
pub mod config;
pub mod engine;
pub mod feed;
pub mod state;
pub mod storage;
pub mod sync;
pub mod transfer;
pub mod util;
