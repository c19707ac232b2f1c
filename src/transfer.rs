//! Export and import of the user library as a self-describing JSON document.
//!
//! Only user-curated data travels: subscriptions, block-lists and pinned
//! items. Feeds and jobs are rebuilt by syncing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::storage::{write_atomic, Item, Library};
use crate::util::validate_source_key;

pub const EXPORT_FORMAT: &str = "feedstash-export";
pub const EXPORT_VERSION: u32 = 1;

/// Maximum import file size (16 MB).
const MAX_IMPORT_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to access '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Import file too large ({0} bytes, max {max})", max = MAX_IMPORT_SIZE)]
    TooLarge(u64),

    #[error("Invalid export document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Not a feedstash export (format marker is '{0}')")]
    WrongFormat(String),

    #[error("Export version {0} is newer than supported version {supported}", supported = EXPORT_VERSION)]
    UnsupportedVersion(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub format: String,
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    #[serde(default)]
    pub blocked_sources: Vec<String>,
    #[serde(default)]
    pub blocked_authors: Vec<String>,
    #[serde(default)]
    pub pinned: Vec<Item>,
}

impl ExportDocument {
    pub fn from_library(library: &Library, exported_at: DateTime<Utc>) -> Self {
        Self {
            format: EXPORT_FORMAT.to_string(),
            version: EXPORT_VERSION,
            exported_at,
            subscriptions: library.subscriptions.clone(),
            blocked_sources: library.blocked_sources.clone(),
            blocked_authors: library.blocked_authors.clone(),
            pinned: library.pinned.clone(),
        }
    }

    /// Parse and check the format marker and version.
    pub fn parse(bytes: &[u8]) -> Result<Self, TransferError> {
        let doc: ExportDocument = serde_json::from_slice(bytes)?;
        if doc.format != EXPORT_FORMAT {
            return Err(TransferError::WrongFormat(doc.format));
        }
        if doc.version > EXPORT_VERSION {
            return Err(TransferError::UnsupportedVersion(doc.version));
        }
        Ok(doc)
    }

    pub fn to_json(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Entries added per section by an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub subscriptions: usize,
    pub blocked_sources: usize,
    pub blocked_authors: usize,
    pub pinned: usize,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.subscriptions + self.blocked_sources + self.blocked_authors + self.pinned
    }
}

/// Merge a document into `library` without removing anything.
///
/// Names match case-insensitively, pinned items by id. Subscriptions that
/// are not valid source keys are skipped.
pub fn merge_into(library: &mut Library, doc: ExportDocument) -> ImportSummary {
    let mut summary = ImportSummary::default();

    for name in doc.subscriptions {
        match validate_source_key(&name) {
            Ok(key) => {
                summary.subscriptions += add_name(&mut library.subscriptions, key);
            }
            Err(e) => tracing::warn!(source = %name, error = %e, "Skipping invalid subscription"),
        }
    }
    for name in doc.blocked_sources {
        summary.blocked_sources += add_name(&mut library.blocked_sources, name.trim());
    }
    for name in doc.blocked_authors {
        summary.blocked_authors += add_name(&mut library.blocked_authors, name.trim());
    }

    let mut pinned_ids = library.pinned_ids();
    for item in doc.pinned {
        if pinned_ids.insert(item.id.clone()) {
            library.pinned.push(item);
            summary.pinned += 1;
        }
    }
    summary
}

fn add_name(names: &mut Vec<String>, name: &str) -> usize {
    if name.is_empty() || names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
        return 0;
    }
    names.push(name.to_string());
    1
}

/// Write a document to `path` atomically.
pub fn write_document(doc: &ExportDocument, path: &Path) -> Result<(), TransferError> {
    let json = doc.to_json()?;
    write_atomic(path, json.as_bytes()).map_err(|source| TransferError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Read and validate a document from `path`.
pub fn read_document(path: &Path) -> Result<ExportDocument, TransferError> {
    let io_err = |source| TransferError::Io {
        path: path.display().to_string(),
        source,
    };
    let len = std::fs::metadata(path).map_err(io_err)?.len();
    if len > MAX_IMPORT_SIZE {
        return Err(TransferError::TooLarge(len));
    }
    let bytes = std::fs::read(path).map_err(io_err)?;
    ExportDocument::parse(&bytes)
}
