use std::io;
use std::process::Command;

use derive_more::{Display, Error};

use super::{RunStatus, RunSummary};

#[derive(Debug, Display, Error)]
pub enum NotifyError {
    #[display("Running notify command failed: {_0}")]
    NotRun(io::Error),
    #[display("Notify command exited with {status}")]
    Failed {
        #[error(ignore)]
        status: String,
    },
}

/// Sink for the summary of a finished run.
pub trait Notifier: Send + Sync {
    fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError>;
}

/// Writes the summary to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError> {
        let stats = &summary.stats;
        let artifact = summary
            .artifact
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".into());
        log::info!(
            target: "notify",
            "{} finished with status {} after {:.1}s: artifact {artifact}, {} files, {} bytes",
            summary.operation,
            stats.final_status,
            stats.elapsed_seconds,
            stats.files_processed,
            stats.bytes_processed
        );
        if !summary.purged.is_empty() {
            log::info!(target: "notify", "Purged {} artifacts", summary.purged.len());
        }
        for warning in &summary.warnings {
            log::warn!(target: "notify", "{warning}");
        }
        if let Some(error) = &summary.error {
            log::error!(target: "notify", "{error}");
        }
        Ok(())
    }
}

/// Runs a shell command with the summary in its environment.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn message(summary: &RunSummary) -> String {
        match (&summary.error, summary.stats.final_status) {
            (Some(error), _) => error.clone(),
            (None, RunStatus::DryRun) => "dry run, nothing written".into(),
            (None, _) => format!(
                "{} files, {} bytes",
                summary.stats.files_processed, summary.stats.bytes_processed
            ),
        }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), NotifyError> {
        let artifact = summary.artifact.map(|id| id.to_string()).unwrap_or_default();
        log::debug!(target: "notify", "Running {}", self.command);

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("WWW_BACKUP_STATUS", summary.stats.final_status.to_string())
            .env("WWW_BACKUP_OPERATION", summary.operation.to_string())
            .env("WWW_BACKUP_ARTIFACT", artifact)
            .env("WWW_BACKUP_MESSAGE", Self::message(summary))
            .output()
            .map_err(NotifyError::NotRun)?;

        if !output.status.success() {
            return Err(NotifyError::Failed {
                status: output.status.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::report::Operation;

    #[test]
    fn command_sees_summary_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env.txt");
        let notifier = CommandNotifier::new(format!(
            "echo \"$WWW_BACKUP_OPERATION $WWW_BACKUP_STATUS $WWW_BACKUP_MESSAGE\" > '{}'",
            out.display()
        ));

        let mut summary = RunSummary::new(Operation::Backup);
        summary.stats.files_processed = 3;
        summary.stats.bytes_processed = 12;
        summary.stats.finish(RunStatus::Success);
        notifier.notify(&summary).unwrap();

        let content = std::fs::read_to_string(out).unwrap();
        assert_eq!(content.trim(), "backup success 3 files, 12 bytes");
    }

    #[test]
    fn failing_command_is_reported() {
        let notifier = CommandNotifier::new("exit 3");
        let summary = RunSummary::new(Operation::Restore);
        assert!(matches!(notifier.notify(&summary), Err(NotifyError::Failed { .. })));
    }
}
