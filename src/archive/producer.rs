//! Production of a [BackupArtifact] from the web root and the database.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::SystemTime;

use chrono::Utc;
use derive_more::{Display, Error, From};
use flate2::write::GzEncoder;
use flate2::Compression;

use super::checksum::{file_digest, ContentDigest, DigestReader};
use super::scan::{self, EntryKind, Exclusions, PatternError, SourceSet};
use super::{
    artifact_dir, files_archive_name, latest_id, latest_verified, ArtifactError, ArtifactId,
    ArtifactStatus, BackupArtifact, BackupType, Manifest, Plan, DUMP_FILE,
};
use crate::backends::{Compressor, DatabaseDumper, DumpError};
use crate::config::EffectiveConfig;
use crate::report::{Phase, Progress, Reporter, RunStats};
use crate::util::signal::CancelToken;

/// Errors on producing an artifact.
#[derive(Debug, Display, Error, From)]
pub enum ProductionError {
    #[display("Source {} is unreadable: {source}", path.display())]
    SourceUnreadable { path: PathBuf, source: io::Error },
    #[display("Destination {} is unwritable: {source}", path.display())]
    DestinationUnwritable { path: PathBuf, source: io::Error },
    #[from]
    #[display("Database dump failed: {_0}")]
    DatabaseDumpFailed(DumpError),
    #[display("Compressing the archive failed: {_0}")]
    CompressionFailed(io::Error),
    #[from]
    #[display("{_0}")]
    InvalidExclusion(PatternError),
    #[from]
    #[display("Reading existing artifacts failed: {_0}")]
    Artifacts(ArtifactError),
    #[display("Backup interrupted")]
    Interrupted,
}

/// Builds the files archive and the database dump of one run.
pub struct ArchiveProducer<'a> {
    config: &'a EffectiveConfig,
    compressor: &'a dyn Compressor,
    dumper: Option<&'a dyn DatabaseDumper>,
    reporter: &'a dyn Reporter,
    cancel: &'a CancelToken,
}

/// Removes the directory of an unfinished artifact unless kept.
struct PartialArtifact<'p> {
    dir: &'p Path,
    keep: bool,
}

impl Drop for PartialArtifact<'_> {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        log::warn!(target: "archive::producer", "Removing partial artifact {}", self.dir.display());
        if let Err(e) = fs::remove_dir_all(self.dir) {
            log::error!(target: "archive::producer", "Removing partial artifact {} failed: {e}", self.dir.display());
        }
    }
}

struct ArchiveSummary {
    checksum: String,
    file_count: u64,
    bytes: u64,
}

impl<'a> ArchiveProducer<'a> {
    pub fn new(
        config: &'a EffectiveConfig,
        compressor: &'a dyn Compressor,
        dumper: Option<&'a dyn DatabaseDumper>,
        reporter: &'a dyn Reporter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            config,
            compressor,
            dumper,
            reporter,
            cancel,
        }
    }

    /// Produce a new artifact below `destination_root`.
    ///
    /// # Dry Run
    ///
    /// With `dry_run` the selection of files is reported and a synthetic
    /// [`ArtifactStatus::InProgress`] artifact without any bytes is returned.
    /// Nothing is written.
    pub fn produce(
        &self,
        destination_root: &Path,
        stats: &mut RunStats,
    ) -> Result<BackupArtifact, ProductionError> {
        let source_root = &self.config.www_source_path;
        let exclusions = Exclusions::new(&self.config.exclusion_patterns)?;

        let (backup_type, base) = self.resolve_base(destination_root)?;
        let modified_after = base
            .as_ref()
            .map(|base| SystemTime::from(base.manifest.created_at));

        // files changed while scanning belong to the next incremental run
        let now = Utc::now();
        self.reporter.info(&format!(
            "Scanning {} ({backup_type} backup)",
            source_root.display()
        ));
        let source = scan::scan(source_root, &exclusions, modified_after).map_err(|e| {
            ProductionError::SourceUnreadable {
                path: source_root.clone(),
                source: e.into(),
            }
        })?;

        if base.is_some() {
            self.reporter.info(&format!(
                "{} files changed, {} unchanged since the base artifact",
                source.file_count(),
                source.unchanged
            ));
        }

        let id = ArtifactId::next(now, latest_id(destination_root)?);
        let dir = artifact_dir(destination_root, id);
        let compression = self.compressor.tool();
        let dump_name = self.dumper.map(|_| DUMP_FILE.to_string());

        let mut manifest = Manifest {
            id,
            created_at: now,
            backup_type,
            base: base.as_ref().map(BackupArtifact::id),
            source_size_bytes: 0,
            file_count: 0,
            checksum: String::new(),
            archive_digest: String::new(),
            compression,
            files_archive: files_archive_name(compression),
            database_dump: dump_name,
            database: self.dumper.map(|dumper| dumper.database().to_string()),
            status: ArtifactStatus::InProgress,
            failure: None,
        };

        if self.config.dry_run {
            return Ok(self.dry_run(dir, manifest, &source));
        }

        fs::create_dir_all(destination_root).map_err(|source| {
            ProductionError::DestinationUnwritable {
                path: destination_root.to_path_buf(),
                source,
            }
        })?;
        fs::create_dir(&dir).map_err(|source| ProductionError::DestinationUnwritable {
            path: dir.clone(),
            source,
        })?;
        let mut partial = PartialArtifact {
            dir: &dir,
            keep: false,
        };

        let archive_path = dir.join(&manifest.files_archive);
        let dump_path = dir.join(DUMP_FILE);
        log::debug!(target: "archive::producer", "Writing artifact {id} to {}", dir.display());

        // archive and dump are independent, both have to succeed
        let dump_target = dump_path.as_path();
        let (archive, dump) = thread::scope(|s| {
            let dump = self
                .dumper
                .map(|dumper| s.spawn(move || dump_database(dumper, dump_target)));
            let archive = self.write_archive(&source, &archive_path, stats);
            let dump = dump.map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(ProductionError::DatabaseDumpFailed(DumpError::Io(
                        io::Error::other("database dump thread panicked"),
                    )))
                })
            });
            (archive, dump)
        });

        if self.cancel.is_cancelled() {
            return Err(ProductionError::Interrupted);
        }
        let archive = archive?;
        if let Some(dump) = dump {
            dump?;
        }

        manifest.checksum = archive.checksum;
        manifest.file_count = archive.file_count;
        manifest.source_size_bytes = archive.bytes;
        manifest.archive_digest =
            file_digest(&archive_path).map_err(ProductionError::CompressionFailed)?;

        let artifact = BackupArtifact::new(dir.clone(), manifest);
        artifact
            .save()
            .map_err(|source| ProductionError::DestinationUnwritable {
                path: artifact.manifest_path(),
                source,
            })?;
        partial.keep = true;

        self.reporter.info(&format!(
            "Created artifact {id}: {} files, {} bytes",
            artifact.manifest.file_count, artifact.manifest.source_size_bytes
        ));
        Ok(artifact)
    }

    fn resolve_base(
        &self,
        destination_root: &Path,
    ) -> Result<(BackupType, Option<BackupArtifact>), ProductionError> {
        if self.config.backup_type == BackupType::Full {
            return Ok((BackupType::Full, None));
        }

        match latest_verified(destination_root)? {
            Some(base) => {
                log::debug!(target: "archive::producer", "Incremental backup based on {}", base.id());
                Ok((BackupType::Incremental, Some(base)))
            }
            None => {
                self.reporter
                    .warn("No verified artifact to base an incremental backup on, creating a full backup");
                Ok((BackupType::Full, None))
            }
        }
    }

    fn dry_run(&self, dir: PathBuf, manifest: Manifest, source: &SourceSet) -> BackupArtifact {
        for entry in &source.entries {
            log::debug!(target: "archive::producer", "Would archive {}", entry.rel_path);
        }
        if let Some(dumper) = self.dumper {
            self.reporter
                .info(&format!("Would dump database {}", dumper.database()));
        }
        self.reporter.info(&format!(
            "Dry run: would archive {} files ({} bytes) into {}",
            source.file_count(),
            source.total_bytes,
            dir.display()
        ));

        let mut artifact = BackupArtifact::new(dir, manifest);
        artifact.dry_run_plan = Some(Plan {
            files: source.file_count(),
            bytes: source.total_bytes,
        });
        artifact
    }

    fn write_archive(
        &self,
        source: &SourceSet,
        archive_path: &Path,
        stats: &mut RunStats,
    ) -> Result<ArchiveSummary, ProductionError> {
        let file = File::create_new(archive_path).map_err(|source| {
            ProductionError::DestinationUnwritable {
                path: archive_path.to_path_buf(),
                source,
            }
        })?;
        let writer = self
            .compressor
            .compress(file)
            .map_err(ProductionError::CompressionFailed)?;
        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(false);

        let mut digest = ContentDigest::new();
        let mut total = source.total_bytes;
        let mut done = 0u64;
        self.reporter.progress(Progress {
            phase: Phase::Archiving,
            current: 0,
            total,
        });

        for entry in &source.entries {
            if self.cancel.is_cancelled() {
                return Err(ProductionError::Interrupted);
            }

            let unreadable = |e: io::Error| ProductionError::SourceUnreadable {
                path: entry.path.clone(),
                source: e,
            };
            let size = match entry.kind {
                EntryKind::Dir => {
                    builder
                        .append_dir(&entry.rel_path, &entry.path)
                        .map_err(|e| match e.kind() {
                            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => unreadable(e),
                            _ => ProductionError::CompressionFailed(e),
                        })?;
                    continue;
                }
                EntryKind::File => {
                    let file = File::open(&entry.path).map_err(unreadable)?;
                    let metadata = file.metadata().map_err(unreadable)?;
                    let size = metadata.len();

                    let mut header = tar::Header::new_gnu();
                    header.set_metadata(&metadata);
                    digest.file(&entry.rel_path, size);
                    let reader = DigestReader::new(
                        SizedReader::new(file.take(size), size, &entry.path),
                        &mut digest,
                    );
                    builder
                        .append_data(&mut header, &entry.rel_path, reader)
                        .map_err(|e| match e.kind() {
                            io::ErrorKind::UnexpectedEof => unreadable(e),
                            _ => ProductionError::CompressionFailed(e),
                        })?;
                    size
                }
                EntryKind::Symlink => {
                    let target = fs::read_link(&entry.path).map_err(unreadable)?;
                    let metadata = fs::symlink_metadata(&entry.path).map_err(unreadable)?;

                    let mut header = tar::Header::new_gnu();
                    header.set_metadata(&metadata);
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    digest.symlink(&entry.rel_path, &target.to_string_lossy());
                    builder
                        .append_link(&mut header, &entry.rel_path, &target)
                        .map_err(ProductionError::CompressionFailed)?;
                    0
                }
            };

            done += size;
            total = total.max(done);
            stats.files_processed += 1;
            stats.bytes_processed += size;
            self.reporter.progress(Progress {
                phase: Phase::Archiving,
                current: done,
                total,
            });
        }

        let file_count = digest.entries();
        let writer = builder
            .into_inner()
            .map_err(ProductionError::CompressionFailed)?;
        writer.finish().map_err(ProductionError::CompressionFailed)?;

        Ok(ArchiveSummary {
            checksum: digest.finalize(),
            file_count,
            bytes: done,
        })
    }
}

/// Fails if the source yields fewer bytes than announced in the tar header.
struct SizedReader<'p, R> {
    inner: R,
    remaining: u64,
    path: &'p Path,
}

impl<'p, R> SizedReader<'p, R> {
    fn new(inner: R, size: u64, path: &'p Path) -> Self {
        Self {
            inner,
            remaining: size,
            path,
        }
    }
}

impl<R: Read> Read for SizedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() && self.remaining > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{} shrank by {} bytes while being archived",
                    self.path.display(),
                    self.remaining
                ),
            ));
        }
        self.remaining = self.remaining.saturating_sub(n as u64);
        Ok(n)
    }
}

fn dump_database(dumper: &dyn DatabaseDumper, dump_path: &Path) -> Result<(), ProductionError> {
    let file = File::create_new(dump_path).map_err(|source| {
        ProductionError::DestinationUnwritable {
            path: dump_path.to_path_buf(),
            source,
        }
    })?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    dumper.dump(&mut encoder)?;

    let finish = || -> io::Result<()> {
        let writer = encoder.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    };
    finish().map_err(|e| ProductionError::DatabaseDumpFailed(DumpError::Io(e)))?;

    log::debug!(target: "archive::producer", "Database dump written to {}", dump_path.display());
    Ok(())
}
