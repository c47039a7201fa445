//! Selection of the files to archive.
//!
//! Exclusion patterns use glob semantics where `*` never crosses a `/`:
//!
//! - A pattern without `/` is matched against every component of the
//!   relative path, so `*.log` excludes log files in any directory and
//!   `cache` prunes every directory named `cache`.
//! - A pattern containing `/` is matched against the whole relative path.
//!   `**` spans any number of directories (`wp-content/**/*.tmp`), a
//!   leading `/` anchors a plain name at the root (`/cache`).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use derive_more::{Display, Error};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

#[derive(Debug, Display, Error)]
#[display("Invalid exclusion pattern `{pattern}`: {source}")]
pub struct PatternError {
    pattern: String,
    source: globset::Error,
}

/// Compiled exclusion patterns.
#[derive(Clone, Debug)]
pub struct Exclusions {
    components: GlobSet,
    paths: GlobSet,
}

impl Exclusions {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let mut components = GlobSetBuilder::new();
        let mut paths = GlobSetBuilder::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().trim_end_matches('/');
            let glob = GlobBuilder::new(pattern.trim_start_matches('/'))
                .literal_separator(true)
                .build()
                .map_err(|source| PatternError {
                    pattern: pattern.to_string(),
                    source,
                })?;

            if pattern.contains('/') {
                paths.add(glob);
            } else {
                components.add(glob);
            }
        }

        let build = |builder: GlobSetBuilder| {
            builder.build().map_err(|source| PatternError {
                pattern: patterns
                    .iter()
                    .map(|p| p.as_ref())
                    .collect::<Vec<_>>()
                    .join(", "),
                source,
            })
        };

        Ok(Self {
            components: build(components)?,
            paths: build(paths)?,
        })
    }

    /// Nothing is excluded.
    pub fn none() -> Self {
        Self {
            components: GlobSet::empty(),
            paths: GlobSet::empty(),
        }
    }

    /// Whether the relative path `rel` is excluded.
    pub fn is_excluded(&self, rel: &Path) -> bool {
        if self.paths.is_match(rel) {
            return true;
        }
        rel.file_name()
            .is_some_and(|name| self.components.is_match(Path::new(name)))
    }
}

impl Default for Exclusions {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Carries only the metadata of a directory, never counted as a file.
    Dir,
    File,
    Symlink,
}

/// A file selected for the archive.
#[derive(Clone, Debug)]
pub struct SourceEntry {
    pub path: PathBuf,
    /// Path relative to the source root, `/` separated.
    pub rel_path: String,
    pub kind: EntryKind,
}

/// Files selected for one backup run.
#[derive(Clone, Debug, Default)]
pub struct SourceSet {
    pub entries: Vec<SourceEntry>,
    pub total_bytes: u64,
    /// Files skipped by an incremental run because they did not change.
    pub unchanged: usize,
}

impl SourceSet {
    /// Files and symlinks, directories don't count.
    pub fn file_count(&self) -> u64 {
        self.entries
            .iter()
            .filter(|entry| entry.kind != EntryKind::Dir)
            .count() as u64
    }
}

/// Collect the files under `root` not excluded by `exclusions`.
///
/// Entries are sorted by path so the archive order is deterministic.
/// With `modified_after` only files changed after that instant are kept,
/// directories are always kept for their metadata.
pub fn scan(
    root: &Path,
    exclusions: &Exclusions,
    modified_after: Option<SystemTime>,
) -> Result<SourceSet, walkdir::Error> {
    let mut set = SourceSet::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let Ok(rel) = entry.path().strip_prefix(root) else {
                return true;
            };
            // never exclude the root itself
            rel.as_os_str().is_empty() || !exclusions.is_excluded(rel)
        });

    for entry in walker {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }

        let file_type = entry.file_type();
        let kind = if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            log::warn!(target: "archive::scan", "Skipping special file {}", entry.path().display());
            continue;
        };

        let metadata = entry.metadata()?;
        if kind != EntryKind::Dir {
            if let (Some(after), Ok(modified)) = (modified_after, metadata.modified()) {
                if modified <= after {
                    set.unchanged += 1;
                    continue;
                }
            }
        }

        if kind == EntryKind::File {
            set.total_bytes += metadata.len();
        }
        set.entries.push(SourceEntry {
            path: entry.path().to_path_buf(),
            rel_path: relative_path(root, entry.path()),
            kind,
        });
    }

    log::debug!(target: "archive::scan", "Selected {} files ({} bytes) under {}", set.file_count(), set.total_bytes, root.display());
    Ok(set)
}

fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
