//! In-place rewriting of image references in manifest files.
//!
//! Each occurrence's recorded byte span is replaced with the pushed target
//! reference, highest offset first so earlier spans stay valid. Files are
//! replaced atomically; everything outside the spans is kept byte for byte.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Serialize, Serializer};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::{Outcome, RehomingResults};
use crate::reference::ImageReference;
use crate::references::{ReferenceOccurrence, ReferenceRegistry};

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} changed since it was scanned (offset {offset})", .path.display())]
    Stale { path: PathBuf, offset: usize },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Serialize for PatchError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// What happened to one manifest.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PatchOutcome {
    /// At least one occurrence was rewritten
    Patched { replaced: usize, skipped: usize },
    /// Nothing to rewrite; the file was not touched
    Skipped { skipped: usize },
    /// The file was left untouched because of an error
    Failed { error: PatchError },
}

/// Rewrite every manifest known to `registry` using the pushed `results`.
///
/// Occurrences whose reference was not pushed are left alone and counted as
/// skipped. A failure in one manifest does not affect the others.
pub fn patch(
    registry: &ReferenceRegistry,
    results: &RehomingResults,
) -> BTreeMap<PathBuf, PatchOutcome> {
    registry
        .by_manifest()
        .into_iter()
        .map(|(path, occurrences)| {
            let outcome = patch_file(path, &occurrences, results).unwrap_or_else(|error| {
                warn!("{}", error);
                PatchOutcome::Failed { error }
            });
            (path.to_path_buf(), outcome)
        })
        .collect()
}

fn patch_file(
    path: &Path,
    occurrences: &[(&ReferenceOccurrence, &ImageReference)],
    results: &RehomingResults,
) -> Result<PatchOutcome, PatchError> {
    let mut replacements: Vec<(&ReferenceOccurrence, &ImageReference, String)> = occurrences
        .iter()
        .filter_map(|&(occurrence, reference)| {
            results
                .get(reference)
                .filter(|result| result.outcome == Outcome::Pushed)
                .map(|result| (occurrence, reference, result.target.to_string()))
        })
        .collect();
    let skipped = occurrences.len() - replacements.len();

    if replacements.is_empty() {
        debug!(path = %path.display(), skipped, "Nothing to patch");
        return Ok(PatchOutcome::Skipped { skipped });
    }

    let mut data = fs::read(path).map_err(|source| PatchError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let original_len = data.len();

    replacements.sort_by(|a, b| b.0.byte_offset.cmp(&a.0.byte_offset));

    let mut changed = false;
    for (occurrence, reference, replacement) in &replacements {
        let span = occurrence.byte_offset..occurrence.byte_offset + occurrence.byte_length;
        let current = data
            .get(span.clone())
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
            .map(str::to_string);
        let still_matches = current
            .as_deref()
            .and_then(|token| ImageReference::parse(token).ok())
            .is_some_and(|parsed| &parsed == *reference);
        if !still_matches {
            return Err(PatchError::Stale {
                path: path.to_path_buf(),
                offset: occurrence.byte_offset,
            });
        }

        if current.as_deref() != Some(replacement.as_str()) {
            data.splice(span, replacement.bytes());
            changed = true;
        }
    }

    if changed {
        write_atomic(path, &data).map_err(|source| PatchError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            path = %path.display(),
            replaced = replacements.len(),
            bytes = data.len() as i64 - original_len as i64,
            "Patched manifest"
        );
    }

    Ok(PatchOutcome::Patched {
        replaced: replacements.len(),
        skipped,
    })
}

/// Replace `path` with `data` via a temp file in the same directory and a rename.
///
/// Keeps the permissions of an existing file.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        tmp.as_file().set_permissions(metadata.permissions())?;
    }
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}
