//! Small shared helpers.
//!
//! - **Source keys**: validation of listing names before they reach a URL

mod source_key;

pub use source_key::{validate_source_key, SourceKeyError, MAX_SOURCE_KEY_LEN};
