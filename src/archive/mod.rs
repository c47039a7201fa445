//! Backup artifacts and their on-disk layout.
//!
//! Every artifact lives in its own directory below the destination root:
//!
//! ```text
//! <destination>/<id>/files.tar.gz
//! <destination>/<id>/database.sql.gz
//! <destination>/<id>/manifest.json
//! ```
//!
//! There is no registry besides the filesystem: artifacts are discovered by
//! scanning the destination for manifests.

pub mod checksum;
pub mod producer;
pub mod scan;

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use clap::ValueEnum;
use derive_more::{Display, Error};

use crate::backends::CompressionTool;

pub use producer::{ArchiveProducer, ProductionError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DUMP_FILE: &str = "database.sql.gz";
const FILES_STEM: &str = "files";
const ID_FORMAT: &str = "%Y%m%dT%H%M%S%.3f";

/// Identifier of an artifact, derived from its creation time in milliseconds.
///
/// Ids of one destination are strictly increasing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactId(i64);

#[derive(Debug, Display, Error)]
#[display("Invalid artifact id: {_0}")]
pub struct InvalidArtifactId(#[error(ignore)] String);

impl ArtifactId {
    pub fn from_datetime(time: DateTime<Utc>) -> Self {
        Self(time.timestamp_millis())
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// The id for an artifact created at `now`, strictly greater than `latest`.
    pub fn next(now: DateTime<Utc>, latest: Option<ArtifactId>) -> Self {
        let candidate = Self::from_datetime(now);
        match latest {
            Some(latest) if latest >= candidate => Self(latest.0 + 1),
            _ => candidate,
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Z", self.datetime().format(ID_FORMAT))
    }
}

impl FromStr for ArtifactId {
    type Err = InvalidArtifactId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches('Z');
        NaiveDateTime::parse_from_str(trimmed, ID_FORMAT)
            .map(|naive| Self::from_datetime(naive.and_utc()))
            .map_err(|_| InvalidArtifactId(s.to_string()))
    }
}

impl serde::Serialize for ArtifactId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for ArtifactId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(
    Copy, Clone, Debug, Display, Default, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    /// Archive every selected file.
    #[default]
    #[display("full")]
    Full,
    /// Archive only files changed since the previous verified artifact.
    #[display("incremental")]
    Incremental,
}

/// Lifecycle of an artifact.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    #[display("in progress")]
    InProgress,
    #[display("verified")]
    Verified,
    #[display("failed")]
    Failed,
    #[display("purged")]
    Purged,
}

/// Metadata of an artifact, persisted as `manifest.json`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub id: ArtifactId,
    pub created_at: DateTime<Utc>,
    pub backup_type: BackupType,
    /// Previous artifact an incremental artifact builds upon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ArtifactId>,
    pub source_size_bytes: u64,
    pub file_count: u64,
    /// Digest of the archived content, see [`checksum::ContentDigest`].
    pub checksum: String,
    /// SHA-256 of the compressed archive file.
    pub archive_digest: String,
    pub compression: CompressionTool,
    pub files_archive: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_dump: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub status: ArtifactStatus,
    /// Reason of a failed verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Manifest {
    /// Age of the artifact at `now` in whole days.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}

/// Errors on reading artifacts from the destination.
#[derive(Debug, Display, Error)]
pub enum ArtifactError {
    #[display("Artifact {_0} not found")]
    NotFound(#[error(ignore)] ArtifactId),
    #[display("Accessing {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[display("Manifest {} is invalid: {source}", path.display())]
    Manifest {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Files selected by a dry run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    pub files: u64,
    pub bytes: u64,
}

/// An artifact of one backup run.
#[derive(Clone, Debug)]
pub struct BackupArtifact {
    dir: PathBuf,
    pub manifest: Manifest,
    /// Set for the synthetic artifact of a dry run, which must never be
    /// treated as a real artifact.
    pub dry_run_plan: Option<Plan>,
}

impl BackupArtifact {
    pub(crate) fn new(dir: PathBuf, manifest: Manifest) -> Self {
        Self {
            dir,
            manifest,
            dry_run_plan: None,
        }
    }

    /// Load the artifact stored in `dir`.
    pub fn load(dir: &Path) -> Result<Self, ArtifactError> {
        let path = dir.join(MANIFEST_FILE);
        let content = fs::read(&path).map_err(|source| ArtifactError::Io {
            path: path.clone(),
            source,
        })?;
        let manifest = serde_json::from_slice(&content)
            .map_err(|source| ArtifactError::Manifest { path, source })?;

        Ok(Self::new(dir.to_path_buf(), manifest))
    }

    pub fn id(&self) -> ArtifactId {
        self.manifest.id
    }

    pub fn status(&self) -> ArtifactStatus {
        self.manifest.status
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run_plan.is_some()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn files_archive_path(&self) -> PathBuf {
        self.dir.join(&self.manifest.files_archive)
    }

    pub fn database_dump_path(&self) -> Option<PathBuf> {
        self.manifest
            .database_dump
            .as_ref()
            .map(|dump| self.dir.join(dump))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Persist the manifest, replacing the previous one atomically.
    pub fn save(&self) -> io::Result<()> {
        let path = self.manifest_path();
        let tmp = self.dir.join(format!("{MANIFEST_FILE}.tmp"));

        let json = serde_json::to_vec_pretty(&self.manifest).map_err(io::Error::other)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    }

    /// Update the status and persist it.
    pub fn set_status(&mut self, status: ArtifactStatus, failure: Option<String>) -> io::Result<()> {
        log::debug!(target: "archive", "Artifact {} is now {status}", self.id());
        self.manifest.status = status;
        self.manifest.failure = failure;
        self.save()
    }
}

/// File name of the files archive for `tool`.
pub fn files_archive_name(tool: CompressionTool) -> String {
    format!("{FILES_STEM}.{}", tool.extension())
}

pub fn artifact_dir(root: &Path, id: ArtifactId) -> PathBuf {
    root.join(id.to_string())
}

/// All artifacts below `root`, newest first.
///
/// Directories without a readable manifest are skipped.
pub fn list(root: &Path) -> Result<Vec<BackupArtifact>, ArtifactError> {
    let mut artifacts = Vec::new();
    if !root.exists() {
        return Ok(artifacts);
    }

    let entries = fs::read_dir(root).map_err(|source| ArtifactError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ArtifactError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if !path.join(MANIFEST_FILE).is_file() {
            log::debug!(target: "archive", "Ignoring {} without manifest", path.display());
            continue;
        }

        match BackupArtifact::load(&path) {
            Ok(artifact) => artifacts.push(artifact),
            Err(e) => log::warn!(target: "archive", "Skipping artifact: {e}"),
        }
    }

    artifacts.sort_by(|a, b| {
        b.manifest
            .created_at
            .cmp(&a.manifest.created_at)
            .then(b.id().cmp(&a.id()))
    });
    Ok(artifacts)
}

/// Find the artifact `id` below `root`.
pub fn find(root: &Path, id: ArtifactId) -> Result<BackupArtifact, ArtifactError> {
    let dir = artifact_dir(root, id);
    if !dir.join(MANIFEST_FILE).is_file() {
        return Err(ArtifactError::NotFound(id));
    }

    BackupArtifact::load(&dir)
}

/// Newest verified artifact below `root`.
pub fn latest_verified(root: &Path) -> Result<Option<BackupArtifact>, ArtifactError> {
    Ok(list(root)?
        .into_iter()
        .find(|artifact| artifact.status() == ArtifactStatus::Verified))
}

/// Highest id present below `root`, whatever its status.
pub fn latest_id(root: &Path) -> Result<Option<ArtifactId>, ArtifactError> {
    Ok(list(root)?.iter().map(BackupArtifact::id).max())
}
