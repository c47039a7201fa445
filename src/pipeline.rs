//! The backup and restore pipelines.
//!
//! A run walks through the states
//!
//! ```text
//! Idle -> Detecting -> Preparing -> Executing -> Verifying -> Restarting -> Cleanup -> Notifying -> Done
//! ```
//!
//! and ends in [`PipelineState::Failed`] on error. Services stopped while
//! preparing are restarted before the run ends, whatever happens afterwards.

use derive_more::{Display, Error, From};

use crate::archive::{self, ArchiveProducer, ArtifactError, ArtifactId, ArtifactStatus, BackupArtifact, ProductionError};
use crate::backends::compression::{self, Compressor};
use crate::backends::DatabaseDumper;
use crate::config::{ConfigurationError, EffectiveConfig};
use crate::environment::{self, EnvironmentDescriptor, EnvironmentError};
use crate::report::{
    CommandNotifier, LogNotifier, Notifier, Operation, Reporter, RunStatus, RunSummary,
};
use crate::restore::{RestoreEngine, RestoreError};
use crate::services::{ServiceManager, StartResults, StoppedServices};
use crate::util::lock::{DestinationLock, LockError};
use crate::util::retention;
use crate::util::signal::CancelToken;
use crate::verify::{self, VerificationError, VerificationResult};

#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Detecting,
    Preparing,
    Executing,
    Verifying,
    Restarting,
    Cleanup,
    Notifying,
    Done,
    Failed,
}

/// Category of a [PipelineError], each with a stable exit code.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("generic")]
    Generic,
    #[display("configuration")]
    Configuration,
    #[display("environment")]
    Environment,
    #[display("lock busy")]
    LockBusy,
    #[display("production")]
    Production,
    #[display("verification")]
    Verification,
    #[display("restore")]
    Restore,
    #[display("interrupted")]
    Interrupted,
}

impl ErrorKind {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Generic => 1,
            Self::Configuration => 2,
            Self::Environment => 3,
            Self::LockBusy => 4,
            Self::Production => 5,
            Self::Verification => 6,
            Self::Restore => 7,
            Self::Interrupted => 130,
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum PipelineError {
    #[from]
    #[display("{_0}")]
    Configuration(ConfigurationError),
    #[from]
    #[display("{_0}")]
    Environment(EnvironmentError),
    #[from]
    #[display("{_0}")]
    Lock(LockError),
    #[from]
    #[display("{_0}")]
    Production(ProductionError),
    #[from]
    #[display("{_0}")]
    Verification(VerificationError),
    #[from]
    #[display("{_0}")]
    Restore(RestoreError),
    #[from]
    #[display("{_0}")]
    Artifacts(ArtifactError),
    #[display("Run interrupted")]
    Interrupted,
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Environment(_) => ErrorKind::Environment,
            Self::Lock(LockError::Busy { .. }) => ErrorKind::LockBusy,
            Self::Lock(LockError::Io { .. }) => ErrorKind::Generic,
            Self::Production(ProductionError::Interrupted) => ErrorKind::Interrupted,
            Self::Production(_) => ErrorKind::Production,
            Self::Verification(_) => ErrorKind::Verification,
            Self::Restore(RestoreError::Interrupted) => ErrorKind::Interrupted,
            Self::Restore(_) => ErrorKind::Restore,
            Self::Artifacts(_) => ErrorKind::Generic,
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }
}

/// Result of a backup or restore run.
#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, PipelineError::exit_code)
    }
}

/// Drives one backup or restore run with the collaborators it is given.
pub struct Pipeline<'a> {
    config: &'a EffectiveConfig,
    environment: &'a EnvironmentDescriptor,
    manager: &'a dyn ServiceManager,
    dumper: Option<&'a dyn DatabaseDumper>,
    reporter: &'a dyn Reporter,
    cancel: &'a CancelToken,
    compressor: Box<dyn Compressor>,
    notifiers: Vec<Box<dyn Notifier + 'a>>,
    history: Vec<PipelineState>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: &'a EffectiveConfig,
        environment: &'a EnvironmentDescriptor,
        manager: &'a dyn ServiceManager,
        dumper: Option<&'a dyn DatabaseDumper>,
        reporter: &'a dyn Reporter,
        cancel: &'a CancelToken,
    ) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier + 'a>> = vec![Box::new(LogNotifier)];
        if let Some(command) = &config.notify_command {
            notifiers.push(Box::new(CommandNotifier::new(command.clone())));
        }

        Self {
            config,
            environment,
            manager,
            dumper,
            reporter,
            cancel,
            compressor: compression::compressor(&config.compression),
            notifiers,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.history.last().copied().unwrap_or(PipelineState::Idle)
    }

    /// Every state entered so far, starting with [`PipelineState::Idle`].
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn enter(&mut self, state: PipelineState) -> Result<(), PipelineError> {
        log::debug!(target: "pipeline", "{} -> {state}", self.state());
        self.history.push(state);
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Interrupted);
        }
        Ok(())
    }

    /// Entering `state` is not interruptible.
    fn force(&mut self, state: PipelineState) {
        log::debug!(target: "pipeline", "{} -> {state}", self.state());
        self.history.push(state);
    }

    /// Back up the web root and the database.
    pub fn run_backup(&mut self) -> RunOutcome {
        let mut summary = RunSummary::new(Operation::Backup);
        let result = self.backup(&mut summary);
        self.finish(summary, result)
    }

    /// Restore the web root and the database from artifact `id`.
    pub fn run_restore(&mut self, id: ArtifactId) -> RunOutcome {
        let mut summary = RunSummary::new(Operation::Restore);
        summary.artifact = Some(id);
        let result = self.restore(id, &mut summary);
        self.finish(summary, result)
    }

    /// Artifacts of the destination, newest first.
    pub fn list(&self) -> Result<Vec<BackupArtifact>, PipelineError> {
        Ok(archive::list(&self.config.destination_path)?)
    }

    /// Verify artifact `id` again; the result is recorded unless in dry run.
    pub fn verify(&self, id: ArtifactId) -> Result<VerificationResult, PipelineError> {
        let root = &self.config.destination_path;
        let mut artifact = archive::find(root, id)?;
        if self.config.dry_run {
            return Ok(verify::check(&artifact, self.reporter));
        }

        let mut lock = DestinationLock::open(root)?;
        let _guard = lock.try_acquire()?;
        Ok(verify::verify(&mut artifact, self.reporter)?)
    }

    /// A dry run only warns about missing tools.
    fn detect(&mut self, summary: &mut RunSummary) -> Result<(), PipelineError> {
        self.enter(PipelineState::Detecting)?;
        let env = self.environment;
        log::info!(
            target: "pipeline",
            "Running on {} ({}), services managed by {}",
            env.os_family,
            env.distro,
            env.service_manager
        );

        let mut tools: Vec<String> = self
            .compressor
            .tool()
            .program()
            .map(String::from)
            .into_iter()
            .collect();
        if let Some(dumper) = self.dumper {
            tools.extend(dumper.required_tools());
        }
        for tool in tools {
            if let Err(e) = environment::require_tool(&tool) {
                if self.config.dry_run {
                    let warning = format!("{e}, a real run would fail");
                    self.reporter.warn(&warning);
                    summary.warnings.push(warning);
                    continue;
                }
                if let Some(install) = env.package_manager.install_command() {
                    self.reporter
                        .error(&format!("{tool} is missing, install it with `{install} <package>`"));
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn backup(&mut self, summary: &mut RunSummary) -> Result<(), PipelineError> {
        self.detect(summary)?;
        self.enter(PipelineState::Preparing)?;
        let config = self.config;
        if config.dry_run {
            self.reporter.warn("Running in dry-run mode, nothing is written and no service is touched");
        }
        if config.database.is_none() && self.dumper.is_none() {
            let warning = "No database configured, backing up files only".to_string();
            self.reporter.warn(&warning);
            summary.warnings.push(warning);
        }

        // a dry run must not even create the lock file
        let mut lock = (!config.dry_run)
            .then(|| DestinationLock::open(&config.destination_path))
            .transpose()?;
        let _guard = lock.as_mut().map(DestinationLock::try_acquire).transpose()?;

        let mut services = self.stop_services(summary);
        let artifact = self.produce(summary);
        self.restart_services(services.as_mut(), summary);
        drop(services);
        artifact?;

        self.enter(PipelineState::Cleanup)?;
        self.enforce_retention(summary)
    }

    fn produce(&mut self, summary: &mut RunSummary) -> Result<Option<BackupArtifact>, PipelineError> {
        self.enter(PipelineState::Executing)?;
        let producer = ArchiveProducer::new(
            self.config,
            self.compressor.as_ref(),
            self.dumper,
            self.reporter,
            self.cancel,
        );
        let mut artifact = producer.produce(&self.config.destination_path, &mut summary.stats)?;
        if let Some(plan) = artifact.dry_run_plan {
            self.reporter.info(&format!(
                "Dry run: {} files ({} bytes) selected",
                plan.files, plan.bytes
            ));
            return Ok(None);
        }
        summary.artifact = Some(artifact.id());

        if let Err(e) = self.enter(PipelineState::Verifying) {
            if let Err(io) = artifact.set_status(ArtifactStatus::Failed, Some("interrupted".into())) {
                log::warn!(target: "pipeline", "Marking artifact {} as failed: {io}", artifact.id());
            }
            return Err(e);
        }
        let result = verify::verify(&mut artifact, self.reporter)?;
        result.into_result(artifact.id())?;
        self.reporter
            .success(&format!("Artifact {} created and verified", artifact.id()));
        Ok(Some(artifact))
    }

    fn enforce_retention(&mut self, summary: &mut RunSummary) -> Result<(), PipelineError> {
        let policy = &self.config.retention;
        let now = chrono::Utc::now();
        match retention::enforce(policy, &self.config.destination_path, now, self.config.dry_run) {
            Ok(report) => {
                for (id, reason) in report.failures {
                    summary
                        .warnings
                        .push(format!("Purging artifact {id} failed: {reason}"));
                }
                if !report.purged.is_empty() {
                    let verb = if self.config.dry_run { "Would purge" } else { "Purged" };
                    self.reporter
                        .info(&format!("{verb} {} artifacts", report.purged.len()));
                }
                summary.purged = report.purged;
            }
            Err(e) => {
                let warning = format!("Retention was not applied: {e}");
                self.reporter.warn(&warning);
                summary.warnings.push(warning);
            }
        }
        Ok(())
    }

    fn restore(&mut self, id: ArtifactId, summary: &mut RunSummary) -> Result<(), PipelineError> {
        self.detect(summary)?;
        self.enter(PipelineState::Preparing)?;
        let config = self.config;

        // a dry run must not even create the lock file
        let mut lock = (!config.dry_run)
            .then(|| DestinationLock::open(&config.destination_path))
            .transpose()?;
        let _guard = lock.as_mut().map(DestinationLock::try_acquire).transpose()?;

        let engine = RestoreEngine::new(config, self.dumper, self.reporter, self.cancel);
        let plan = engine.locate(id)?;
        if config.dry_run {
            self.reporter.info(&format!(
                "Dry run: artifact {id} is intact, would restore {} into {}",
                plan.chain()
                    .iter()
                    .map(|a| a.id().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                config.www_source_path.display()
            ));
            return Ok(());
        }

        let mut services = self.acquire_services(summary);
        let result = self.enter(PipelineState::Executing).and_then(|()| {
            engine
                .apply(&plan, &mut services, &mut summary.stats)
                .map_err(PipelineError::from)
        });
        self.restart_services(Some(&mut services), summary);
        drop(services);
        let report = result?;
        self.reporter.success(&format!(
            "Restored {} files from artifact {}",
            report.files, report.artifact
        ));

        self.enter(PipelineState::Cleanup)?;
        Ok(())
    }

    /// Stop the web services unless in dry run.
    fn stop_services(&mut self, summary: &mut RunSummary) -> Option<StoppedServices<'a>> {
        if self.config.dry_run {
            return None;
        }
        Some(self.acquire_services(summary))
    }

    fn acquire_services(&mut self, summary: &mut RunSummary) -> StoppedServices<'a> {
        let set = self.config.service_set(self.environment);
        if set.is_empty() {
            return StoppedServices::acquire(self.manager, set);
        }

        self.reporter.info(&format!(
            "Stopping {}",
            set.names().collect::<Vec<_>>().join(", ")
        ));
        let services = StoppedServices::acquire(self.manager, set);
        for (name, error) in &services.prior().stop_failures {
            let warning = format!("Stopping {name} failed: {error}");
            self.reporter.warn(&warning);
            summary.warnings.push(warning);
        }
        services
    }

    fn restart_services(
        &mut self,
        services: Option<&mut StoppedServices<'a>>,
        summary: &mut RunSummary,
    ) {
        self.force(PipelineState::Restarting);
        let Some(services) = services else {
            return;
        };
        if services.set().is_empty() {
            services.release();
            return;
        }

        let results: &StartResults = services.release();
        for (name, result) in results {
            match result {
                Ok(outcome) => log::debug!(target: "pipeline", "{name}: {outcome}"),
                Err(e) => {
                    let warning = format!("Restarting {name} failed: {e}");
                    self.reporter.error(&warning);
                    summary.warnings.push(warning);
                }
            }
        }
        summary.services_restored = services.restored();
    }

    fn finish(&mut self, mut summary: RunSummary, result: Result<(), PipelineError>) -> RunOutcome {
        self.force(PipelineState::Notifying);
        let status = match &result {
            Ok(()) if self.config.dry_run => RunStatus::DryRun,
            Ok(()) => RunStatus::Success,
            Err(e) if e.kind() == ErrorKind::Interrupted => RunStatus::Interrupted,
            Err(_) => RunStatus::Failed,
        };
        summary.stats.finish(status);
        if let Err(e) = &result {
            self.reporter
                .error(&format!("{} failed ({}): {e}", summary.operation, e.kind()));
            summary.error = Some(e.to_string());
        }

        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(&summary) {
                let warning = format!("Notification failed: {e}");
                self.reporter.warn(&warning);
                summary.warnings.push(warning);
            }
        }

        match &result {
            Ok(()) => self.force(PipelineState::Done),
            Err(_) => self.force(PipelineState::Failed),
        }
        match summary.services_restored {
            Some(false) => self.reporter.error(summary.services_line()),
            _ => self.reporter.info(summary.services_line()),
        }

        RunOutcome {
            summary,
            error: result.err(),
        }
    }
}
