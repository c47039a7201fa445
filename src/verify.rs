//! Integrity verification of produced artifacts.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};

use derive_more::{Display, Error};
use flate2::read::MultiGzDecoder;

use crate::archive::checksum::{file_digest, ContentDigest, DigestReader};
use crate::archive::{ArtifactId, ArtifactStatus, BackupArtifact};
use crate::backends::compression::{self, CompressionConfig};
use crate::report::{Phase, Progress, Reporter};

/// Lines of the dump searched for the header.
const DUMP_HEADER_LINES: usize = 5;
const DUMP_HEADERS: [&str; 2] = ["-- MySQL dump", "-- MariaDB dump"];

/// Why an artifact failed verification.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum VerificationFailure {
    #[display("files archive is missing")]
    ArchiveMissing,
    #[display("archive digest mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[display("archive is not readable: {_0}")]
    Structure(String),
    #[display("content checksum mismatch: expected {expected}, got {actual}")]
    ContentMismatch { expected: String, actual: String },
    #[display("archive holds {actual} entries, manifest lists {expected}")]
    FileCount { expected: u64, actual: u64 },
    #[display("database dump is missing")]
    DumpMissing,
    #[display("database dump is empty")]
    DumpEmpty,
    #[display("database dump has no MySQL/MariaDB header")]
    DumpHeader,
    #[display("database dump is not readable: {_0}")]
    DumpUnreadable(String),
}

impl VerificationFailure {
    /// Whether the stored bytes differ from what was produced.
    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. } | Self::ContentMismatch { .. }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub ok: bool,
    pub reason: Option<VerificationFailure>,
}

impl VerificationResult {
    fn passed() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    fn failed(reason: VerificationFailure) -> Self {
        Self {
            ok: false,
            reason: Some(reason),
        }
    }

    /// Turn a failed result of artifact `id` into an error.
    pub fn into_result(self, id: ArtifactId) -> Result<(), VerificationError> {
        match self.reason {
            None => Ok(()),
            Some(failure) => Err(VerificationError::Failed { id, failure }),
        }
    }
}

#[derive(Debug, Display, Error)]
pub enum VerificationError {
    #[display("Artifact {id} failed verification: {failure}")]
    Failed {
        #[error(ignore)]
        id: ArtifactId,
        #[error(ignore)]
        failure: VerificationFailure,
    },
    #[display("Recording the verification of {id} failed: {source}")]
    Persist {
        id: ArtifactId,
        #[error(source)]
        source: io::Error,
    },
    #[display("The artifact of a dry run can't be verified")]
    DryRun,
}

/// Verify `artifact` and record the result in its manifest.
pub fn verify(
    artifact: &mut BackupArtifact,
    reporter: &dyn Reporter,
) -> Result<VerificationResult, VerificationError> {
    if artifact.is_dry_run() {
        return Err(VerificationError::DryRun);
    }

    let result = check(artifact, reporter);
    let (status, failure) = match &result.reason {
        None => (ArtifactStatus::Verified, None),
        Some(reason) => (ArtifactStatus::Failed, Some(reason.to_string())),
    };
    artifact
        .set_status(status, failure)
        .map_err(|source| VerificationError::Persist {
            id: artifact.id(),
            source,
        })?;

    match &result.reason {
        None => log::info!(target: "verify", "Artifact {} verified", artifact.id()),
        Some(reason) => log::error!(target: "verify", "Artifact {} failed verification: {reason}", artifact.id()),
    }
    Ok(result)
}

/// Verify `artifact` without touching its manifest.
pub fn check(artifact: &BackupArtifact, reporter: &dyn Reporter) -> VerificationResult {
    match check_archive(artifact, reporter).and_then(|()| check_dump(artifact)) {
        Ok(()) => VerificationResult::passed(),
        Err(reason) => VerificationResult::failed(reason),
    }
}

fn check_archive(
    artifact: &BackupArtifact,
    reporter: &dyn Reporter,
) -> Result<(), VerificationFailure> {
    let manifest = &artifact.manifest;
    let path = artifact.files_archive_path();
    if !path.is_file() {
        return Err(VerificationFailure::ArchiveMissing);
    }

    let actual = file_digest(&path).map_err(|e| VerificationFailure::Structure(e.to_string()))?;
    if actual != manifest.archive_digest {
        return Err(VerificationFailure::ChecksumMismatch {
            expected: manifest.archive_digest.clone(),
            actual,
        });
    }

    let structure = |e: io::Error| VerificationFailure::Structure(e.to_string());
    let decompressor = compression::compressor(&CompressionConfig {
        tool: manifest.compression,
        ..Default::default()
    });
    let file = File::open(&path).map_err(structure)?;
    let reader = decompressor.decompress(file).map_err(structure)?;
    let mut archive = tar::Archive::new(reader);

    let mut digest = ContentDigest::new();
    let total = manifest.source_size_bytes;
    let mut done = 0u64;
    for entry in archive.entries().map_err(structure)? {
        let mut entry = entry.map_err(structure)?;
        let rel_path = entry.path().map_err(structure)?.to_string_lossy().into_owned();

        let kind = entry.header().entry_type();
        match kind {
            tar::EntryType::Regular => {
                let size = entry.size();
                digest.file(&rel_path, size);
                io::copy(&mut DigestReader::new(&mut entry, &mut digest), &mut io::sink())
                    .map_err(structure)?;
                done += size;
            }
            tar::EntryType::Directory => continue,
            tar::EntryType::Symlink => {
                let target = entry
                    .link_name()
                    .map_err(structure)?
                    .ok_or_else(|| VerificationFailure::Structure(format!("symlink {rel_path} without target")))?;
                digest.symlink(&rel_path, &target.to_string_lossy());
            }
            other => {
                return Err(VerificationFailure::Structure(format!(
                    "unexpected entry {rel_path} of type {other:?}"
                )));
            }
        }
        reporter.progress(Progress {
            phase: Phase::Verifying,
            current: done,
            total: total.max(done),
        });
    }

    let entries = digest.entries();
    if entries != manifest.file_count {
        return Err(VerificationFailure::FileCount {
            expected: manifest.file_count,
            actual: entries,
        });
    }
    let actual = digest.finalize();
    if actual != manifest.checksum {
        return Err(VerificationFailure::ContentMismatch {
            expected: manifest.checksum.clone(),
            actual,
        });
    }

    Ok(())
}

fn check_dump(artifact: &BackupArtifact) -> Result<(), VerificationFailure> {
    let Some(path) = artifact.database_dump_path() else {
        log::debug!(target: "verify", "Artifact {} has no database dump", artifact.id());
        return Ok(());
    };
    let file = File::open(&path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => VerificationFailure::DumpMissing,
        _ => VerificationFailure::DumpUnreadable(e.to_string()),
    })?;

    let mut reader = BufReader::new(MultiGzDecoder::new(file));
    let mut seen_content = false;
    let mut line = String::new();
    for _ in 0..DUMP_HEADER_LINES {
        line.clear();
        let read = read_line_lossy(&mut reader, &mut line)
            .map_err(|e| VerificationFailure::DumpUnreadable(e.to_string()))?;
        if read == 0 {
            break;
        }
        seen_content = true;
        if DUMP_HEADERS.iter().any(|header| line.starts_with(header)) {
            return Ok(());
        }
    }

    if seen_content {
        Err(VerificationFailure::DumpHeader)
    } else {
        Err(VerificationFailure::DumpEmpty)
    }
}

fn read_line_lossy<R: BufRead>(reader: &mut R, line: &mut String) -> io::Result<usize> {
    let mut buf = Vec::new();
    let read = reader.by_ref().take(64 * 1024).read_until(b'\n', &mut buf)?;
    line.push_str(&String::from_utf8_lossy(&buf));
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};

    use flate2::write::GzEncoder;
    use flate2::Compression;

    use crate::archive::producer::tests::FakeDumper;
    use crate::archive::ArchiveProducer;
    use crate::backends::compression::Gzip;
    use crate::config::tests::config_for;
    use crate::report::tests::RecordingReporter;
    use crate::report::RunStats;
    use crate::util::signal::CancelToken;

    fn produce(dest: &std::path::Path) -> (tempfile::TempDir, BackupArtifact) {
        let www = tempfile::tempdir().unwrap();
        fs::create_dir(www.path().join("css")).unwrap();
        fs::write(www.path().join("index.html"), b"<h1>hello</h1>").unwrap();
        fs::write(www.path().join("css/site.css"), b"body { margin: 0 }").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("index.html", www.path().join("home.html")).unwrap();

        let config = config_for(www.path(), dest);
        let reporter = RecordingReporter::default();
        let cancel = CancelToken::new();
        let dumper = FakeDumper::default();
        let gzip = Gzip::new(6);
        let producer = ArchiveProducer::new(&config, &gzip, Some(&dumper), &reporter, &cancel);
        let artifact = producer.produce(dest, &mut RunStats::start()).unwrap();
        (www, artifact)
    }

    #[test]
    fn fresh_artifact_verifies() {
        let dest = tempfile::tempdir().unwrap();
        let (_www, mut artifact) = produce(dest.path());
        let reporter = RecordingReporter::default();

        let result = verify(&mut artifact, &reporter).unwrap();
        assert!(result.ok, "{:?}", result.reason);
        assert_eq!(artifact.status(), ArtifactStatus::Verified);
        let stored = BackupArtifact::load(artifact.dir()).unwrap();
        assert_eq!(stored.status(), ArtifactStatus::Verified);
        assert!(!reporter.progress_events().is_empty());
    }

    #[test]
    fn flipped_byte_is_a_checksum_mismatch() {
        let dest = tempfile::tempdir().unwrap();
        let (_www, mut artifact) = produce(dest.path());

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(artifact.files_archive_path())
            .unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        let mut byte = [0u8];
        file.read_exact(&mut byte).unwrap();
        file.seek(SeekFrom::Start(20)).unwrap();
        file.write_all(&[byte[0] ^ 0xff]).unwrap();
        drop(file);

        let result = verify(&mut artifact, &RecordingReporter::default()).unwrap();
        assert!(!result.ok);
        assert!(result.reason.as_ref().unwrap().is_checksum_mismatch());
        let stored = BackupArtifact::load(artifact.dir()).unwrap();
        assert_eq!(stored.status(), ArtifactStatus::Failed);
        assert!(stored.manifest.failure.unwrap().contains("digest mismatch"));
    }

    #[test]
    fn wrong_file_count_is_detected() {
        let dest = tempfile::tempdir().unwrap();
        let (_www, mut artifact) = produce(dest.path());
        artifact.manifest.file_count += 1;

        let result = check(&artifact, &RecordingReporter::default());
        assert!(matches!(result.reason, Some(VerificationFailure::FileCount { .. })));
    }

    #[test]
    fn dump_without_header_fails() {
        let dest = tempfile::tempdir().unwrap();
        let (_www, artifact) = produce(dest.path());

        let dump = artifact.database_dump_path().unwrap();
        let mut encoder = GzEncoder::new(File::create(&dump).unwrap(), Compression::default());
        encoder.write_all(b"SELECT 1;\n").unwrap();
        encoder.finish().unwrap();
        assert_eq!(
            check(&artifact, &RecordingReporter::default()).reason,
            Some(VerificationFailure::DumpHeader)
        );

        let encoder = GzEncoder::new(File::create(&dump).unwrap(), Compression::default());
        encoder.finish().unwrap();
        assert_eq!(
            check(&artifact, &RecordingReporter::default()).reason,
            Some(VerificationFailure::DumpEmpty)
        );

        fs::remove_file(&dump).unwrap();
        assert_eq!(
            check(&artifact, &RecordingReporter::default()).reason,
            Some(VerificationFailure::DumpMissing)
        );
    }

    #[test]
    fn dry_run_artifact_is_refused() {
        let dest = tempfile::tempdir().unwrap();
        let (_www, mut artifact) = produce(dest.path());
        artifact.dry_run_plan = Some(Default::default());
        assert!(matches!(
            verify(&mut artifact, &RecordingReporter::default()),
            Err(VerificationError::DryRun)
        ));
    }
}
