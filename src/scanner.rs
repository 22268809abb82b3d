//! Manifest discovery and `image:` token extraction.
//!
//! The scanner asks a [`FileLister`] for candidate paths, keeps regular files
//! named `*.yaml` / `*.yml`, and records every `image:` value together with
//! its exact byte span so the patcher can later replace it in place.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

const IMAGE_KEY: &[u8] = b"image:";

/// A manifest file that could not be listed or read.
#[derive(Debug, Error)]
#[error("failed to read {}: {cause}", .path.display())]
pub struct ScanError {
    pub path: PathBuf,
    #[source]
    pub cause: io::Error,
}

/// A path produced by a [`FileLister`].
#[derive(Debug, Clone)]
pub struct ListedEntry {
    pub path: PathBuf,
    /// False for directories, symlinks, sockets and other non-regular files
    pub is_file: bool,
}

/// Source of candidate manifest paths and their contents.
pub trait FileLister: Send + Sync {
    /// Every entry below `root`, recursively. Errors are per entry.
    fn list(&self, root: &Path) -> Vec<Result<ListedEntry, ScanError>>;

    /// Raw contents of a listed file.
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
}

/// Lists the real filesystem with `walkdir`, in file-name order.
pub struct WalkDirLister;

impl FileLister for WalkDirLister {
    fn list(&self, root: &Path) -> Vec<Result<ListedEntry, ScanError>> {
        WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .map(|entry| match entry {
                Ok(entry) => Ok(ListedEntry {
                    is_file: entry.file_type().is_file(),
                    path: entry.into_path(),
                }),
                Err(err) => Err(ScanError {
                    path: err.path().unwrap_or(root).to_path_buf(),
                    cause: err.into(),
                }),
            })
            .collect()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }
}

/// One `image:` value found in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMatch {
    pub manifest_path: PathBuf,
    pub token: String,
    pub byte_offset: usize,
    pub byte_length: usize,
}

/// Lazily scan `root` for image tokens.
///
/// Files are read one at a time as the iterator advances. Calling `scan`
/// again lists and reads the tree afresh.
pub fn scan<'a>(lister: &'a dyn FileLister, root: &Path) -> ManifestScan<'a> {
    ManifestScan {
        lister,
        entries: lister.list(root).into_iter(),
        pending: Vec::new().into_iter(),
    }
}

/// Iterator returned by [`scan`].
pub struct ManifestScan<'a> {
    lister: &'a dyn FileLister,
    entries: std::vec::IntoIter<Result<ListedEntry, ScanError>>,
    pending: std::vec::IntoIter<TokenMatch>,
}

impl Iterator for ManifestScan<'_> {
    type Item = Result<TokenMatch, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(found) = self.pending.next() {
                return Some(Ok(found));
            }

            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err)),
            };
            if !entry.is_file || !is_manifest(&entry.path) {
                continue;
            }

            let data = match self.lister.read(&entry.path) {
                Ok(data) => data,
                Err(cause) => {
                    return Some(Err(ScanError {
                        path: entry.path,
                        cause,
                    }));
                }
            };

            let matches: Vec<TokenMatch> = extract_tokens(&data)
                .into_iter()
                .map(|(byte_offset, byte_length)| TokenMatch {
                    manifest_path: entry.path.clone(),
                    token: String::from_utf8_lossy(&data[byte_offset..byte_offset + byte_length])
                        .into_owned(),
                    byte_offset,
                    byte_length,
                })
                .collect();
            debug!(path = %entry.path.display(), tokens = matches.len(), "Scanned manifest");
            self.pending = matches.into_iter();
        }
    }
}

/// Whether a file name looks like a YAML manifest (case-insensitive).
pub fn is_manifest(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy().to_ascii_lowercase();
            name.ends_with(".yaml") || name.ends_with(".yml")
        })
        .unwrap_or(false)
}

/// Byte spans `(offset, length)` of every `image:` value in `data`.
///
/// The key must start on a word boundary and be followed, on the same line,
/// by a value. Quoted values are returned without their quotes.
pub fn extract_tokens(data: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(found) = find(data, IMAGE_KEY, cursor) {
        cursor = found + IMAGE_KEY.len();
        if found > 0 && is_word_byte(data[found - 1]) {
            continue;
        }

        let mut start = cursor;
        while start < data.len() && (data[start] == b' ' || data[start] == b'\t') {
            start += 1;
        }
        if start >= data.len() {
            break;
        }

        let (value_start, value_end, resume) = match data[start] {
            quote @ (b'"' | b'\'') => {
                let body = start + 1;
                let close = data[body..]
                    .iter()
                    .position(|&b| b == quote || b == b'\n')
                    .map(|i| body + i);
                match close {
                    Some(close) if data[close] == quote => (body, close, close + 1),
                    _ => continue,
                }
            }
            _ => {
                let end = data[start..]
                    .iter()
                    .position(|b| b.is_ascii_whitespace())
                    .map(|i| start + i)
                    .unwrap_or(data.len());
                (start, end, end)
            }
        };

        cursor = resume;
        if value_end > value_start {
            spans.push((value_start, value_end - value_start));
        }
    }

    spans
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| from + i)
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// In-memory lister for tests. `None` contents simulate an unreadable file.
#[cfg(test)]
pub(crate) struct MemoryLister {
    pub files: std::collections::BTreeMap<PathBuf, Option<Vec<u8>>>,
    pub dirs: Vec<PathBuf>,
}

#[cfg(test)]
impl MemoryLister {
    pub fn new() -> Self {
        Self {
            files: Default::default(),
            dirs: Vec::new(),
        }
    }

    pub fn with_file(mut self, path: &str, contents: &str) -> Self {
        self.files
            .insert(PathBuf::from(path), Some(contents.as_bytes().to_vec()));
        self
    }

    pub fn with_unreadable(mut self, path: &str) -> Self {
        self.files.insert(PathBuf::from(path), None);
        self
    }
}

#[cfg(test)]
impl FileLister for MemoryLister {
    fn list(&self, root: &Path) -> Vec<Result<ListedEntry, ScanError>> {
        let dirs = self.dirs.iter().map(|path| (path, false));
        let files = self.files.keys().map(|path| (path, true));
        dirs.chain(files)
            .filter(|(path, _)| path.starts_with(root))
            .map(|(path, is_file)| {
                Ok(ListedEntry {
                    path: path.clone(),
                    is_file,
                })
            })
            .collect()
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        match self.files.get(path) {
            Some(Some(data)) => Ok(data.clone()),
            Some(None) => Err(io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }
}
