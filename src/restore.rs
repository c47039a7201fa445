//! Restore of the web root and the database from an artifact.
//!
//! The archive is extracted into `<www>.restore-tmp` next to the web root.
//! Only a complete extraction replaces the web root, which is moved aside
//! to `<www>.restore-old` and deleted after the swap. Files of the web root
//! which are not part of the artifact are therefore gone after a restore.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};
use flate2::read::MultiGzDecoder;

use crate::archive::scan::{self, Exclusions};
use crate::archive::{self, ArtifactError, ArtifactId, ArtifactStatus, BackupArtifact};
use crate::backends::compression::{self, CompressionConfig};
use crate::backends::{DatabaseDumper, DumpError};
use crate::config::EffectiveConfig;
use crate::report::{Phase, Progress, Reporter, RunStats};
use crate::services::StoppedServices;
use crate::util::signal::CancelToken;
use crate::verify::{self, VerificationFailure};

const STAGING_SUFFIX: &str = ".restore-tmp";
const OLD_SUFFIX: &str = ".restore-old";

#[derive(Debug, Display, Error, From)]
pub enum RestoreError {
    #[display("Artifact {_0} not found")]
    ArtifactNotFound(#[error(ignore)] ArtifactId),
    #[display("Artifact {id} is {status}, only verified artifacts can be restored")]
    NotVerified {
        #[error(ignore)]
        id: ArtifactId,
        #[error(ignore)]
        status: ArtifactStatus,
    },
    #[display("Artifact {id} does not match its checksum: {failure}")]
    ChecksumMismatch {
        #[error(ignore)]
        id: ArtifactId,
        #[error(ignore)]
        failure: VerificationFailure,
    },
    #[display("Artifact {id} is damaged: {failure}")]
    Damaged {
        #[error(ignore)]
        id: ArtifactId,
        #[error(ignore)]
        failure: VerificationFailure,
    },
    #[display("Artifact {_0} contains a database dump but no database is configured")]
    DatabaseNotConfigured(#[error(ignore)] ArtifactId),
    #[from]
    #[display("Reading artifacts failed: {_0}")]
    Artifacts(ArtifactError),
    #[display("Extracting into {} failed: {source}", path.display())]
    ExtractionFailed { path: PathBuf, source: io::Error },
    #[display("Importing the database failed: {_0}")]
    DatabaseImportFailed(DumpError),
    #[display("Restored web root holds {actual} files instead of {expected}")]
    FileCount {
        #[error(ignore)]
        expected: u64,
        #[error(ignore)]
        actual: u64,
    },
    #[display("Restore interrupted")]
    Interrupted,
}

/// A verified chain of artifacts to restore, oldest first.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    chain: Vec<BackupArtifact>,
}

impl RestorePlan {
    /// The artifact the web root is restored to.
    pub fn target(&self) -> &BackupArtifact {
        // the chain always holds the target
        &self.chain[self.chain.len() - 1]
    }

    pub fn chain(&self) -> &[BackupArtifact] {
        &self.chain
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub artifact: ArtifactId,
    /// Files and symlinks present in the restored web root.
    pub files: u64,
    pub database_imported: bool,
}

/// Removes a directory on drop unless disarmed.
struct Cleanup {
    dir: PathBuf,
    armed: bool,
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if self.armed && self.dir.exists() {
            log::warn!(target: "restore", "Removing {}", self.dir.display());
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                log::error!(target: "restore", "Removing {} failed: {e}", self.dir.display());
            }
        }
    }
}

pub struct RestoreEngine<'a> {
    config: &'a EffectiveConfig,
    dumper: Option<&'a dyn DatabaseDumper>,
    reporter: &'a dyn Reporter,
    cancel: &'a CancelToken,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(
        config: &'a EffectiveConfig,
        dumper: Option<&'a dyn DatabaseDumper>,
        reporter: &'a dyn Reporter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            config,
            dumper,
            reporter,
            cancel,
        }
    }

    /// Find artifact `id` with its base chain and verify all of them.
    ///
    /// Nothing on the host is changed.
    pub fn locate(&self, id: ArtifactId) -> Result<RestorePlan, RestoreError> {
        let root = &self.config.destination_path;
        let mut chain = Vec::new();
        let mut next = Some(id);
        let mut seen = HashSet::new();

        while let Some(current) = next {
            if !seen.insert(current) {
                return Err(RestoreError::Damaged {
                    id: current,
                    failure: VerificationFailure::Structure("cyclic base chain".into()),
                });
            }
            let artifact = match archive::find(root, current) {
                Ok(artifact) => artifact,
                Err(ArtifactError::NotFound(missing)) => {
                    return Err(RestoreError::ArtifactNotFound(missing))
                }
                Err(e) => return Err(e.into()),
            };
            next = artifact.manifest.base;
            chain.push(artifact);
        }
        chain.reverse();

        for artifact in &chain {
            self.check(artifact)?;
        }

        let plan = RestorePlan { chain };
        let target = plan.target();
        if target.manifest.database_dump.is_some() && self.dumper.is_none() {
            return Err(RestoreError::DatabaseNotConfigured(target.id()));
        }
        if plan.chain.len() > 1 {
            log::info!(target: "restore", "Artifact {id} builds upon {} earlier artifacts", plan.chain.len() - 1);
        }
        Ok(plan)
    }

    fn check(&self, artifact: &BackupArtifact) -> Result<(), RestoreError> {
        let id = artifact.id();
        if artifact.status() != ArtifactStatus::Verified {
            return Err(RestoreError::NotVerified {
                id,
                status: artifact.status(),
            });
        }

        self.reporter.info(&format!("Verifying artifact {id}"));
        match verify::check(artifact, self.reporter).reason {
            None => Ok(()),
            Some(failure) => {
                self.mark_failed(artifact, &failure);
                if failure.is_checksum_mismatch() {
                    Err(RestoreError::ChecksumMismatch { id, failure })
                } else {
                    Err(RestoreError::Damaged { id, failure })
                }
            }
        }
    }

    /// An artifact failing verification is never eligible again.
    fn mark_failed(&self, artifact: &BackupArtifact, failure: &VerificationFailure) {
        if self.config.dry_run {
            return;
        }
        let mut artifact = artifact.clone();
        if let Err(e) = artifact.set_status(ArtifactStatus::Failed, Some(failure.to_string())) {
            log::warn!(target: "restore", "Marking artifact {} as failed: {e}", artifact.id());
        }
    }

    /// Replace the web root and the database with the content of `plan`.
    ///
    /// `services` must have been acquired by the caller; they are released
    /// after the import, before the restored files are counted.
    pub fn apply(
        &self,
        plan: &RestorePlan,
        services: &mut StoppedServices<'_>,
        stats: &mut RunStats,
    ) -> Result<RestoreReport, RestoreError> {
        let www = &self.config.www_source_path;
        let staging = sibling(www, STAGING_SUFFIX);

        let expected = self
            .extract(plan, &staging, stats)
            .map_err(|e| self.interrupted_or(e))?;
        self.swap(&staging, www)?;
        let database_imported = self
            .import(plan.target())
            .map_err(|e| self.interrupted_or(e))?;

        services.release();

        let actual = count_files(www)?;
        if actual != expected {
            return Err(RestoreError::FileCount { expected, actual });
        }

        self.reporter.success(&format!(
            "Restored artifact {} ({actual} files)",
            plan.target().id()
        ));
        Ok(RestoreReport {
            artifact: plan.target().id(),
            files: actual,
            database_imported,
        })
    }

    /// Extract the whole chain into `staging`, returning the entry count.
    fn extract(
        &self,
        plan: &RestorePlan,
        staging: &Path,
        stats: &mut RunStats,
    ) -> Result<u64, RestoreError> {
        let failed = |source| RestoreError::ExtractionFailed {
            path: staging.to_path_buf(),
            source,
        };

        if staging.exists() {
            log::warn!(target: "restore", "Removing leftover {}", staging.display());
            fs::remove_dir_all(staging).map_err(failed)?;
        }
        fs::create_dir_all(staging).map_err(failed)?;
        let mut cleanup = Cleanup {
            dir: staging.to_path_buf(),
            armed: true,
        };

        let total: u64 = plan
            .chain
            .iter()
            .map(|a| a.manifest.source_size_bytes)
            .sum();
        let mut done = 0u64;
        let mut paths = HashSet::new();
        self.reporter.progress(Progress {
            phase: Phase::Extracting,
            current: 0,
            total,
        });

        for artifact in &plan.chain {
            log::debug!(target: "restore", "Extracting {}", artifact.id());
            let decompressor = compression::compressor(&CompressionConfig {
                tool: artifact.manifest.compression,
                ..Default::default()
            });
            let file = File::open(artifact.files_archive_path()).map_err(failed)?;
            let mut tarball = tar::Archive::new(decompressor.decompress(file).map_err(failed)?);
            tarball.set_preserve_permissions(true);
            tarball.set_preserve_ownerships(true);
            tarball.set_preserve_mtime(true);
            tarball.set_overwrite(true);

            // directories are applied last so their mode and mtime stick
            let mut directories = Vec::new();
            for entry in tarball.entries().map_err(failed)? {
                if self.cancel.is_cancelled() {
                    return Err(RestoreError::Interrupted);
                }
                let entry = entry.map_err(failed)?;
                let path = entry.path().map_err(failed)?.into_owned();

                // incremental entries replace what an older artifact put there
                let target = staging.join(&path);
                if target.is_symlink() {
                    fs::remove_file(&target).map_err(failed)?;
                }
                if entry.header().entry_type() == tar::EntryType::Directory {
                    directories.push(entry);
                    continue;
                }

                let size = entry.size();
                unpack(entry, &path, staging).map_err(failed)?;
                paths.insert(path);
                done += size;
                stats.files_processed += 1;
                stats.bytes_processed += size;
                self.reporter.progress(Progress {
                    phase: Phase::Extracting,
                    current: done,
                    total: total.max(done),
                });
            }

            directories.sort_by(|a, b| b.path_bytes().cmp(&a.path_bytes()));
            for dir in directories {
                let path = dir.path().map_err(failed)?.into_owned();
                unpack(dir, &path, staging).map_err(failed)?;
            }
        }

        copy_root_permissions(&self.config.www_source_path, staging);
        cleanup.armed = false;
        Ok(paths.len() as u64)
    }

    /// Replace `www` by `staging`, rolling back if the second rename fails.
    fn swap(&self, staging: &Path, www: &Path) -> Result<(), RestoreError> {
        let old = sibling(www, OLD_SUFFIX);
        let mut cleanup = Cleanup {
            dir: staging.to_path_buf(),
            armed: true,
        };
        let failed = |path: &Path, source| RestoreError::ExtractionFailed {
            path: path.to_path_buf(),
            source,
        };

        if old.exists() {
            fs::remove_dir_all(&old).map_err(|e| failed(&old, e))?;
        }
        let had_root = www.exists();
        if had_root {
            fs::rename(www, &old).map_err(|e| failed(www, e))?;
        }
        if let Err(e) = fs::rename(staging, www) {
            if had_root {
                if let Err(rollback) = fs::rename(&old, www) {
                    log::error!(target: "restore", "Rolling back {} failed, the web root is at {}: {rollback}", www.display(), old.display());
                }
            }
            return Err(failed(www, e));
        }
        cleanup.armed = false;

        if had_root {
            if let Err(e) = fs::remove_dir_all(&old) {
                log::warn!(target: "restore", "Removing the previous web root {} failed: {e}", old.display());
            }
        }
        log::info!(target: "restore", "Web root {} replaced", www.display());
        Ok(())
    }

    /// A step failing after an interrupt failed because of the interrupt.
    fn interrupted_or(&self, error: RestoreError) -> RestoreError {
        if self.cancel.is_cancelled() {
            log::debug!(target: "restore", "Failed after interrupt: {error}");
            return RestoreError::Interrupted;
        }
        error
    }

    fn import(&self, artifact: &BackupArtifact) -> Result<bool, RestoreError> {
        let (Some(dump), Some(dumper)) = (artifact.database_dump_path(), self.dumper) else {
            return Ok(false);
        };
        if self.cancel.is_cancelled() {
            return Err(RestoreError::Interrupted);
        }

        self.reporter
            .info(&format!("Importing database {}", dumper.database()));
        let file = File::open(&dump)
            .map_err(|e| RestoreError::DatabaseImportFailed(DumpError::Io(e)))?;
        let mut reader = MultiGzDecoder::new(io::BufReader::new(file));
        dumper
            .import(&mut reader)
            .map_err(RestoreError::DatabaseImportFailed)?;
        Ok(true)
    }
}

fn unpack<R: Read>(mut entry: tar::Entry<'_, R>, path: &Path, staging: &Path) -> io::Result<()> {
    if entry.unpack_in(staging)? {
        return Ok(());
    }
    Err(io::Error::other(format!(
        "entry {} escapes the web root",
        path.display()
    )))
}

fn sibling(www: &Path, suffix: &str) -> PathBuf {
    let mut name = www
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("www"));
    name.push(suffix);
    www.with_file_name(name)
}

fn copy_root_permissions(www: &Path, staging: &Path) {
    if let Ok(metadata) = fs::metadata(www) {
        if let Err(e) = fs::set_permissions(staging, metadata.permissions()) {
            log::debug!(target: "restore", "Keeping default permissions of the web root: {e}");
        }
    }
}

fn count_files(www: &Path) -> Result<u64, RestoreError> {
    let restored = scan::scan(www, &Exclusions::none(), None).map_err(|e| {
        RestoreError::ExtractionFailed {
            path: www.to_path_buf(),
            source: e.into(),
        }
    })?;
    Ok(restored.file_count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::archive::producer::tests::{FakeDumper, FAKE_DUMP};
    use crate::archive::{ArchiveProducer, BackupType};
    use crate::backends::compression::Gzip;
    use crate::config::tests::config_for;
    use crate::report::tests::RecordingReporter;
    use crate::services::tests::FakeManager;
    use crate::services::ServiceSet;

    struct Site {
        _root: tempfile::TempDir,
        www: PathBuf,
        dest: PathBuf,
    }

    fn site() -> Site {
        let root = tempfile::tempdir().unwrap();
        let www = root.path().join("www");
        let dest = root.path().join("backups");
        fs::create_dir_all(www.join("blog")).unwrap();
        fs::write(www.join("index.php"), b"<?php require 'blog/post.php';").unwrap();
        fs::write(www.join("blog/post.php"), b"<?php echo 'post';").unwrap();
        Site {
            _root: root,
            www,
            dest,
        }
    }

    fn backup(config: &EffectiveConfig, dumper: &FakeDumper) -> BackupArtifact {
        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let gzip = Gzip::new(6);
        let producer = ArchiveProducer::new(config, &gzip, Some(dumper), &reporter, &cancel);
        let mut artifact = producer
            .produce(&config.destination_path, &mut RunStats::start())
            .unwrap();
        assert!(verify::verify(&mut artifact, &reporter).unwrap().ok);
        artifact
    }

    #[test]
    fn round_trip_replaces_web_root_and_imports_dump() {
        let site = site();
        let config = config_for(&site.www, &site.dest);
        let dumper = FakeDumper::default();
        let artifact = backup(&config, &dumper);

        fs::write(site.www.join("index.php"), b"defaced").unwrap();
        fs::write(site.www.join("shell.php"), b"<?php system($_GET['c']);").unwrap();

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, Some(&dumper), &reporter, &cancel);
        let plan = engine.locate(artifact.id()).unwrap();

        let manager = FakeManager::with_running(&["nginx"]);
        let mut services = StoppedServices::acquire(&manager, ServiceSet::new(["nginx"]));
        let report = engine
            .apply(&plan, &mut services, &mut RunStats::start())
            .unwrap();

        assert_eq!(report.files, 2);
        assert!(report.database_imported);
        assert_eq!(
            fs::read(site.www.join("index.php")).unwrap(),
            b"<?php require 'blog/post.php';"
        );
        assert!(!site.www.join("shell.php").exists());
        assert!(!sibling(&site.www, STAGING_SUFFIX).exists());
        assert!(!sibling(&site.www, OLD_SUFFIX).exists());
        assert_eq!(*dumper.imported.lock().unwrap(), FAKE_DUMP.as_bytes());
        assert_eq!(services.restored(), Some(true));
    }

    #[test]
    fn tampered_artifact_is_refused_before_services_are_touched() {
        let site = site();
        let config = config_for(&site.www, &site.dest);
        let dumper = FakeDumper::default();
        let artifact = backup(&config, &dumper);

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(artifact.files_archive_path())
            .unwrap();
        file.write_all(b"garbage").unwrap();
        drop(file);

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, Some(&dumper), &reporter, &cancel);
        let err = engine.locate(artifact.id()).unwrap_err();
        assert!(matches!(err, RestoreError::ChecksumMismatch { .. }));
        assert_eq!(
            archive::find(&site.dest, artifact.id()).unwrap().status(),
            ArtifactStatus::Failed
        );

        let err = engine.locate(artifact.id()).unwrap_err();
        assert!(matches!(err, RestoreError::NotVerified { .. }));
    }

    #[test]
    fn unknown_artifact_is_not_found() {
        let site = site();
        let config = config_for(&site.www, &site.dest);
        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, None, &reporter, &cancel);

        let id = ArtifactId::from_datetime(chrono::Utc::now());
        assert!(matches!(engine.locate(id), Err(RestoreError::ArtifactNotFound(missing)) if missing == id));
    }

    #[test]
    fn incremental_chain_is_restored_in_order() {
        let site = site();
        let mut config = config_for(&site.www, &site.dest);
        let dumper = FakeDumper::default();
        let full = backup(&config, &dumper);

        // mtime granularity of some filesystems is one second
        std::thread::sleep(std::time::Duration::from_millis(1100));
        fs::write(site.www.join("blog/post.php"), b"<?php echo 'edited';").unwrap();
        config.backup_type = BackupType::Incremental;
        let incremental = backup(&config, &dumper);
        assert_eq!(incremental.manifest.base, Some(full.id()));
        assert_eq!(incremental.manifest.file_count, 1);

        fs::remove_dir_all(&site.www).unwrap();
        fs::create_dir(&site.www).unwrap();

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, Some(&dumper), &reporter, &cancel);
        let plan = engine.locate(incremental.id()).unwrap();
        assert_eq!(plan.chain().len(), 2);

        let manager = FakeManager::default();
        let mut services = StoppedServices::acquire(&manager, ServiceSet::default());
        let report = engine
            .apply(&plan, &mut services, &mut RunStats::start())
            .unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(
            fs::read(site.www.join("blog/post.php")).unwrap(),
            b"<?php echo 'edited';"
        );
    }

    #[test]
    fn interrupted_extraction_keeps_web_root() {
        let site = site();
        let config = config_for(&site.www, &site.dest);
        let dumper = FakeDumper::default();
        let artifact = backup(&config, &dumper);
        fs::write(site.www.join("index.php"), b"current").unwrap();

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, Some(&dumper), &reporter, &cancel);
        let plan = engine.locate(artifact.id()).unwrap();
        cancel.cancel();

        let manager = FakeManager::with_running(&["nginx"]);
        let mut services = StoppedServices::acquire(&manager, ServiceSet::new(["nginx"]));
        let err = engine
            .apply(&plan, &mut services, &mut RunStats::start())
            .unwrap_err();
        assert!(matches!(err, RestoreError::Interrupted));
        assert_eq!(fs::read(site.www.join("index.php")).unwrap(), b"current");
        assert!(!sibling(&site.www, STAGING_SUFFIX).exists());

        drop(services);
        assert!(manager.running.lock().unwrap().contains("nginx"));
    }

    /// Import killed by the interrupt, like `mysql` on SIGINT.
    struct InterruptedImport<'c> {
        cancel: &'c CancelToken,
    }

    impl DatabaseDumper for InterruptedImport<'_> {
        fn database(&self) -> &str {
            "wordpress"
        }

        fn dump(&self, out: &mut dyn Write) -> Result<(), DumpError> {
            out.write_all(FAKE_DUMP.as_bytes())?;
            Ok(())
        }

        fn import(&self, _input: &mut dyn Read) -> Result<(), DumpError> {
            self.cancel.cancel();
            Err(DumpError::Io(io::Error::from(io::ErrorKind::BrokenPipe)))
        }
    }

    #[test]
    fn import_failing_after_interrupt_is_interrupted() {
        let site = site();
        let config = config_for(&site.www, &site.dest);
        let artifact = backup(&config, &FakeDumper::default());

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let dumper = InterruptedImport { cancel: &cancel };
        let engine = RestoreEngine::new(&config, Some(&dumper), &reporter, &cancel);
        let plan = engine.locate(artifact.id()).unwrap();

        let manager = FakeManager::with_running(&["nginx"]);
        let mut services = StoppedServices::acquire(&manager, ServiceSet::new(["nginx"]));
        let err = engine
            .apply(&plan, &mut services, &mut RunStats::start())
            .unwrap_err();
        assert!(matches!(err, RestoreError::Interrupted), "{err}");
    }

    #[test]
    fn import_failure_without_interrupt_is_reported() {
        struct Refused;
        impl DatabaseDumper for Refused {
            fn database(&self) -> &str {
                "wordpress"
            }
            fn dump(&self, _out: &mut dyn Write) -> Result<(), DumpError> {
                Ok(())
            }
            fn import(&self, _input: &mut dyn Read) -> Result<(), DumpError> {
                Err(DumpError::Io(io::Error::other("access denied")))
            }
        }

        let site = site();
        let config = config_for(&site.www, &site.dest);
        let artifact = backup(&config, &FakeDumper::default());

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, Some(&Refused), &reporter, &cancel);
        let plan = engine.locate(artifact.id()).unwrap();
        let manager = FakeManager::default();
        let mut services = StoppedServices::acquire(&manager, ServiceSet::default());
        let err = engine
            .apply(&plan, &mut services, &mut RunStats::start())
            .unwrap_err();
        assert!(matches!(err, RestoreError::DatabaseImportFailed(_)));
    }

    #[cfg(unix)]
    #[test]
    fn directory_metadata_is_restored() {
        use std::os::unix::fs::PermissionsExt;

        let site = site();
        let config = config_for(&site.www, &site.dest);
        fs::set_permissions(site.www.join("blog"), fs::Permissions::from_mode(0o770)).unwrap();
        fs::create_dir(site.www.join("upgrade")).unwrap();
        let dumper = FakeDumper::default();
        let artifact = backup(&config, &dumper);

        fs::remove_dir_all(&site.www).unwrap();
        fs::create_dir(&site.www).unwrap();

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, Some(&dumper), &reporter, &cancel);
        let plan = engine.locate(artifact.id()).unwrap();
        let manager = FakeManager::default();
        let mut services = StoppedServices::acquire(&manager, ServiceSet::default());
        let report = engine
            .apply(&plan, &mut services, &mut RunStats::start())
            .unwrap();

        assert_eq!(report.files, 2);
        let mode = fs::metadata(site.www.join("blog")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770);
        assert!(site.www.join("upgrade").is_dir());
    }

    #[test]
    fn dump_without_database_config_is_refused() {
        let site = site();
        let config = config_for(&site.www, &site.dest);
        let artifact = backup(&config, &FakeDumper::default());

        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let engine = RestoreEngine::new(&config, None, &reporter, &cancel);
        assert!(matches!(
            engine.locate(artifact.id()),
            Err(RestoreError::DatabaseNotConfigured(_))
        ));
    }
}
