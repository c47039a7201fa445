use std::process::ExitCode;

use clap::Parser;
use www_backup_lib::archive::ArtifactStatus;
use www_backup_lib::backends::{DatabaseDumper, MariaDb};
use www_backup_lib::cli::{Action, Cli};
use www_backup_lib::config::{
    ConfigFile, ConfigurationError, EffectiveConfig, Prompter, StdinPrompter,
};
use www_backup_lib::environment;
use www_backup_lib::pipeline::{ErrorKind, Pipeline, PipelineError};
use www_backup_lib::report::{logging, LogReporter};
use www_backup_lib::services::manager;
use www_backup_lib::util::signal::{self, CancelToken};

fn main() -> ExitCode {
    let cli = Cli::parse();

    // the config may name the log file, so it is read before the logger exists
    let file = ConfigFile::load(&cli.config, !cli.dry_run);
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| file.as_ref().ok().and_then(|f| f.log_file.clone()));
    if let Err(e) = logging::init(cli.verbose, cli.quiet, log_file.as_deref()) {
        eprintln!("Initializing the log failed: {e}");
        return ExitCode::from(1);
    }

    let code = match run(cli, file) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            e.exit_code()
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run(cli: Cli, file: Result<ConfigFile, ConfigurationError>) -> Result<i32, PipelineError> {
    let file = file?;
    let environment = environment::detect()?;

    let mut stdin = (!cli.auto && StdinPrompter::is_interactive()).then_some(StdinPrompter);
    let prompter = stdin.as_mut().map(|p| p as &mut dyn Prompter);
    let config = EffectiveConfig::resolve(file, cli.overrides(), &environment, prompter)?;

    let dumper = config
        .database
        .clone()
        .map(MariaDb::with_config)
        .transpose()
        .map_err(ConfigurationError::from)?;
    let manager = manager::for_kind(environment.service_manager);
    let reporter = LogReporter::new();

    let cancel = CancelToken::new();
    if let Err(e) = signal::watch_signals(cancel.clone()) {
        log::warn!("Watching for SIGINT/SIGTERM failed, an interrupt will kill the run: {e}");
    }

    let mut pipeline = Pipeline::new(
        &config,
        &environment,
        manager.as_ref(),
        dumper.as_ref().map(|d| d as &dyn DatabaseDumper),
        &reporter,
        &cancel,
    );

    match cli.action.unwrap_or_default() {
        Action::Backup(_) => Ok(pipeline.run_backup().exit_code()),
        Action::Restore(args) => Ok(pipeline.run_restore(args.id).exit_code()),
        Action::List(_) => {
            for artifact in pipeline.list()? {
                let manifest = &artifact.manifest;
                let failure = manifest.failure.as_deref().unwrap_or_default();
                println!(
                    "{}\t{}\t{}\t{} files\t{} bytes\t{failure}",
                    manifest.id,
                    manifest.backup_type,
                    manifest.status,
                    manifest.file_count,
                    manifest.source_size_bytes
                );
            }
            Ok(0)
        }
        Action::Verify(args) => {
            let result = pipeline.verify(args.id)?;
            match result.reason {
                None => {
                    println!("{}\t{}", args.id, ArtifactStatus::Verified);
                    Ok(0)
                }
                Some(reason) => {
                    println!("{}\t{}\t{reason}", args.id, ArtifactStatus::Failed);
                    Ok(ErrorKind::Verification.exit_code())
                }
            }
        }
    }
}
