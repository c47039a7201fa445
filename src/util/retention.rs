use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

use crate::archive::{self, ArtifactError, ArtifactId, ArtifactStatus, BackupArtifact};

/// Configure retention of artifacts.
///
/// If both values are [None] every verified artifact will be kept.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RetentionPolicy {
    /// Artifacts older than this many days are purged, unless they are
    /// among the newest [`max_count`](Self::max_count).
    pub max_age_days: Option<u32>,

    /// Defines how many verified artifacts to keep.
    ///
    /// The newest `max_count` artifacts are kept regardless of their age.
    pub max_count: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: Some(30),
            max_count: Some(7),
        }
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum Decision {
    #[display("keep")]
    Keep,
    /// Kept because a kept incremental artifact builds upon it.
    #[display("keep (base of an incremental artifact)")]
    KeepAsBase,
    #[display("purge (beyond the newest {_0})")]
    PurgeCount(usize),
    #[display("purge (older than {_0} days)")]
    PurgeAge(u32),
    #[display("purge (not verified)")]
    PurgeUnverified,
}

impl Decision {
    pub fn is_purge(&self) -> bool {
        !matches!(self, Self::Keep | Self::KeepAsBase)
    }
}

#[derive(Debug, Display, Error, From)]
pub enum RetentionError {
    #[display("Enumerating artifacts failed: {_0}")]
    Enumerate(ArtifactError),
}

/// Result of applying a [RetentionPolicy].
#[derive(Debug, Default)]
pub struct RetentionReport {
    pub purged: Vec<ArtifactId>,
    pub kept: Vec<ArtifactId>,
    /// Artifacts which could not be deleted.
    pub failures: Vec<(ArtifactId, String)>,
}

/// Decide for every artifact whether it is kept.
///
/// `artifacts` must be sorted newest first.
pub fn plan(
    policy: &RetentionPolicy,
    artifacts: &[BackupArtifact],
    now: DateTime<Utc>,
) -> Vec<(ArtifactId, Decision)> {
    let mut decisions: Vec<(ArtifactId, Decision)> = Vec::with_capacity(artifacts.len());
    let mut verified_index = 0usize;

    for artifact in artifacts {
        let manifest = &artifact.manifest;
        if manifest.status != ArtifactStatus::Verified {
            decisions.push((manifest.id, Decision::PurgeUnverified));
            continue;
        }

        let index = verified_index;
        verified_index += 1;

        let decision = match (policy.max_count, policy.max_age_days) {
            (Some(count), _) if index < count => Decision::Keep,
            (Some(count), _) => Decision::PurgeCount(count),
            (None, Some(days)) if manifest.age_days(now) > i64::from(days) => Decision::PurgeAge(days),
            (None, _) => Decision::Keep,
        };
        decisions.push((manifest.id, decision));
    }

    // keep the complete chain of every kept incremental artifact
    let bases: HashMap<ArtifactId, ArtifactId> = artifacts
        .iter()
        .filter_map(|a| a.manifest.base.map(|base| (a.id(), base)))
        .collect();
    let mut pinned = HashSet::new();
    for (id, decision) in &decisions {
        if decision.is_purge() {
            continue;
        }
        let mut current = *id;
        while let Some(base) = bases.get(&current) {
            if !pinned.insert(*base) {
                break;
            }
            current = *base;
        }
    }

    for (id, decision) in &mut decisions {
        if pinned.contains(id) && *decision != Decision::PurgeUnverified && decision.is_purge() {
            *decision = Decision::KeepAsBase;
        }
    }

    decisions
}

/// Apply `policy` to all artifacts below `destination_root`.
///
/// Only manifests are read. With `dry_run` nothing is deleted, the
/// returned report lists what would have been purged.
pub fn enforce(
    policy: &RetentionPolicy,
    destination_root: &Path,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<RetentionReport, RetentionError> {
    let artifacts = archive::list(destination_root)?;
    let decisions = plan(policy, &artifacts, now);
    let mut report = RetentionReport::default();

    for (mut artifact, (id, decision)) in artifacts.into_iter().zip(decisions) {
        debug_assert_eq!(artifact.id(), id);
        if !decision.is_purge() {
            log::trace!(target: "retention", "{id}: {decision}");
            report.kept.push(id);
            continue;
        }

        log::info!(target: "retention", "{id}: {decision}");
        if dry_run {
            report.purged.push(id);
            continue;
        }

        match purge(&mut artifact) {
            Ok(()) => report.purged.push(id),
            Err(e) => {
                log::warn!(target: "retention", "Purging artifact {id} failed: {e}");
                report.failures.push((id, e.to_string()));
            }
        }
    }

    Ok(report)
}

/// Delete an artifact.
///
/// The manifest is marked as purged first and deleted last, so an
/// interrupted purge never leaves a verified manifest without its data.
fn purge(artifact: &mut BackupArtifact) -> io::Result<()> {
    artifact.set_status(ArtifactStatus::Purged, None)?;

    remove_if_exists(&artifact.files_archive_path())?;
    if let Some(dump) = artifact.database_dump_path() {
        remove_if_exists(&dump)?;
    }
    remove_if_exists(&artifact.manifest_path())?;
    fs::remove_dir_all(artifact.dir())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{manifest, write_artifact};
    use crate::archive::BackupType;

    fn id_days_ago(now: DateTime<Utc>, days: i64) -> ArtifactId {
        ArtifactId::from_datetime(now - chrono::Duration::days(days))
    }

    #[test]
    fn count_overrides_age_for_newest() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let ids: Vec<_> = [1, 5, 10, 40]
            .into_iter()
            .map(|days| {
                let id = id_days_ago(now, days);
                write_artifact(root.path(), manifest(id, ArtifactStatus::Verified));
                id
            })
            .collect();

        let policy = RetentionPolicy {
            max_age_days: Some(30),
            max_count: Some(2),
        };
        let report = enforce(&policy, root.path(), now, false).unwrap();

        assert_eq!(report.kept, [ids[0], ids[1]]);
        assert_eq!(report.purged, [ids[2], ids[3]]);
        assert!(report.failures.is_empty());
        let left: Vec<_> = archive::list(root.path()).unwrap().iter().map(|a| a.id()).collect();
        assert_eq!(left, [ids[0], ids[1]]);
    }

    #[test]
    fn old_artifacts_kept_within_count() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        for days in [100, 200] {
            write_artifact(root.path(), manifest(id_days_ago(now, days), ArtifactStatus::Verified));
        }

        let policy = RetentionPolicy {
            max_age_days: Some(30),
            max_count: Some(5),
        };
        let report = enforce(&policy, root.path(), now, false).unwrap();
        assert_eq!(report.kept.len(), 2);
        assert!(report.purged.is_empty());
    }

    #[test]
    fn age_only_policy() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let young = id_days_ago(now, 3);
        let old = id_days_ago(now, 31);
        write_artifact(root.path(), manifest(young, ArtifactStatus::Verified));
        write_artifact(root.path(), manifest(old, ArtifactStatus::Verified));

        let policy = RetentionPolicy {
            max_age_days: Some(30),
            max_count: None,
        };
        let report = enforce(&policy, root.path(), now, false).unwrap();
        assert_eq!(report.kept, [young]);
        assert_eq!(report.purged, [old]);
    }

    #[test]
    fn failed_artifacts_do_not_count() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let failed = id_days_ago(now, 0);
        let verified = id_days_ago(now, 1);
        write_artifact(root.path(), manifest(failed, ArtifactStatus::Failed));
        write_artifact(root.path(), manifest(verified, ArtifactStatus::Verified));

        let policy = RetentionPolicy {
            max_age_days: None,
            max_count: Some(1),
        };
        let report = enforce(&policy, root.path(), now, false).unwrap();
        assert_eq!(report.kept, [verified]);
        assert_eq!(report.purged, [failed]);
    }

    #[test]
    fn base_of_kept_incremental_is_kept() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let full = id_days_ago(now, 3);
        let inc = id_days_ago(now, 1);
        write_artifact(root.path(), manifest(full, ArtifactStatus::Verified));
        let mut incremental = manifest(inc, ArtifactStatus::Verified);
        incremental.backup_type = BackupType::Incremental;
        incremental.base = Some(full);
        write_artifact(root.path(), incremental);

        let policy = RetentionPolicy {
            max_age_days: None,
            max_count: Some(1),
        };
        let artifacts = archive::list(root.path()).unwrap();
        let decisions = plan(&policy, &artifacts, now);
        assert_eq!(decisions, [(inc, Decision::Keep), (full, Decision::KeepAsBase)]);
    }

    #[test]
    fn dry_run_deletes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let now = Utc::now();
        for days in [1, 2, 3] {
            write_artifact(root.path(), manifest(id_days_ago(now, days), ArtifactStatus::Verified));
        }

        let policy = RetentionPolicy {
            max_age_days: None,
            max_count: Some(1),
        };
        let report = enforce(&policy, root.path(), now, true).unwrap();
        assert_eq!(report.purged.len(), 2);
        assert_eq!(archive::list(root.path()).unwrap().len(), 3);
    }
}
