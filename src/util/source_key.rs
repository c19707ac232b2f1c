use thiserror::Error;

/// Longest source key the listing API accepts.
pub const MAX_SOURCE_KEY_LEN: usize = 64;

/// Errors that can occur during source key validation.
///
/// Source keys are interpolated into request paths, so anything beyond
/// the listing name alphabet is rejected before a request is built.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SourceKeyError {
    #[error("Source name is empty")]
    Empty,
    #[error("Source name is longer than {max} characters", max = MAX_SOURCE_KEY_LEN)]
    TooLong,
    #[error("Source name contains invalid character {0:?} (only letters, digits and '_' allowed)")]
    InvalidChar(char),
}

/// Validates a source key and returns it trimmed.
///
/// A leading `r/` or `/r/` is accepted and stripped, since that is how
/// sources are usually written.
///
/// # Examples
///
/// ```
/// use feedstash::util::validate_source_key;
///
/// assert_eq!(validate_source_key("r/rust").unwrap(), "rust");
/// assert!(validate_source_key("../etc").is_err());
/// ```
pub fn validate_source_key(key: &str) -> Result<&str, SourceKeyError> {
    let key = key.trim();
    let key = key
        .strip_prefix("/r/")
        .or_else(|| key.strip_prefix("r/"))
        .unwrap_or(key);

    if key.is_empty() {
        return Err(SourceKeyError::Empty);
    }
    if key.len() > MAX_SOURCE_KEY_LEN {
        return Err(SourceKeyError::TooLong);
    }
    if let Some(c) = key.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '_')) {
        return Err(SourceKeyError::InvalidChar(c));
    }
    Ok(key)
}
