//! Reporting of a run: progress, statistics and the final notification.

pub mod logging;
pub mod notify;

use std::sync::Mutex;

use chrono::{DateTime, Local};
use derive_more::Display;

use crate::archive::ArtifactId;

pub use notify::{CommandNotifier, LogNotifier, Notifier, NotifyError};

/// Log target of success messages, rendered as `SUCCESS`.
pub const SUCCESS_TARGET: &str = "success";

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum Phase {
    #[display("Archiving")]
    Archiving,
    #[display("Verifying")]
    Verifying,
    #[display("Extracting")]
    Extracting,
}

/// Progress of a long running step, `current` never decreases within a phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub current: u64,
    pub total: u64,
}

impl Progress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.current.saturating_mul(100) / self.total
        }
    }
}

/// Receiver of the events of a pipeline run.
pub trait Reporter: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    fn success(&self, message: &str);
    fn progress(&self, progress: Progress);
}

/// [Reporter] writing everything to the [log] facade.
///
/// Progress is logged in steps of ten percent.
#[derive(Debug, Default)]
pub struct LogReporter {
    last: Mutex<Option<(Phase, u64)>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reporter for LogReporter {
    fn info(&self, message: &str) {
        log::info!(target: "pipeline", "{message}");
    }

    fn warn(&self, message: &str) {
        log::warn!(target: "pipeline", "{message}");
    }

    fn error(&self, message: &str) {
        log::error!(target: "pipeline", "{message}");
    }

    fn success(&self, message: &str) {
        log::info!(target: SUCCESS_TARGET, "{message}");
    }

    fn progress(&self, progress: Progress) {
        let step = progress.percent() / 10 * 10;
        let Ok(mut last) = self.last.lock() else {
            return;
        };
        if *last == Some((progress.phase, step)) {
            return;
        }
        *last = Some((progress.phase, step));
        log::info!(target: "progress", "{}: {step}% ({}/{})", progress.phase, progress.current, progress.total);
    }
}

/// Final status of a run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum RunStatus {
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("dry-run")]
    DryRun,
    #[display("failed")]
    Failed,
    #[display("interrupted")]
    Interrupted,
}

/// Counters of one pipeline execution.
#[derive(Clone, Debug)]
pub struct RunStats {
    pub start_time: DateTime<Local>,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub elapsed_seconds: f64,
    pub final_status: RunStatus,
}

impl RunStats {
    pub fn start() -> Self {
        Self {
            start_time: Local::now(),
            files_processed: 0,
            bytes_processed: 0,
            elapsed_seconds: 0.0,
            final_status: RunStatus::Running,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        let elapsed = Local::now() - self.start_time;
        self.elapsed_seconds = elapsed.num_milliseconds() as f64 / 1000.0;
        self.final_status = status;
    }
}

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum Operation {
    #[display("backup")]
    Backup,
    #[display("restore")]
    Restore,
}

/// Everything the [Notifier] learns about a finished run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub operation: Operation,
    pub stats: RunStats,
    pub artifact: Option<ArtifactId>,
    pub purged: Vec<ArtifactId>,
    /// Non-fatal problems of the run.
    pub warnings: Vec<String>,
    pub error: Option<String>,
    /// `None` if no service had to be touched.
    pub services_restored: Option<bool>,
}

impl RunSummary {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            stats: RunStats::start(),
            artifact: None,
            purged: Vec::new(),
            warnings: Vec::new(),
            error: None,
            services_restored: None,
        }
    }

    /// One line describing the state the web services are left in.
    pub fn services_line(&self) -> &'static str {
        match self.services_restored {
            Some(true) => "Web services restored: yes",
            Some(false) => "Web services restored: NO, manual action required",
            None => "Web services restored: not touched",
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Reporter keeping every event in memory.
    #[derive(Default)]
    pub(crate) struct RecordingReporter {
        pub(crate) messages: Mutex<Vec<String>>,
        pub(crate) progress: Mutex<Vec<Progress>>,
    }

    impl RecordingReporter {
        pub(crate) fn progress_events(&self) -> Vec<Progress> {
            self.progress.lock().unwrap().clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn info(&self, message: &str) {
            self.messages.lock().unwrap().push(format!("INFO {message}"));
        }

        fn warn(&self, message: &str) {
            self.messages.lock().unwrap().push(format!("WARNING {message}"));
        }

        fn error(&self, message: &str) {
            self.messages.lock().unwrap().push(format!("ERROR {message}"));
        }

        fn success(&self, message: &str) {
            self.messages.lock().unwrap().push(format!("SUCCESS {message}"));
        }

        fn progress(&self, progress: Progress) {
            self.progress.lock().unwrap().push(progress);
        }
    }

    #[test]
    fn percent_of_empty_total_is_complete() {
        let progress = Progress {
            phase: Phase::Archiving,
            current: 0,
            total: 0,
        };
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn stats_finish_sets_status() {
        let mut stats = RunStats::start();
        stats.finish(RunStatus::Success);
        assert_eq!(stats.final_status, RunStatus::Success);
        assert!(stats.elapsed_seconds >= 0.0);
    }

    #[test]
    fn services_line_is_explicit() {
        let mut summary = RunSummary::new(Operation::Backup);
        assert_eq!(summary.services_line(), "Web services restored: not touched");
        summary.services_restored = Some(false);
        assert!(summary.services_line().contains("NO"));
    }
}
