use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use crate::archive::{ArtifactId, BackupType};
use crate::config::{Overrides, WebRootUse, DEFAULT_CONFIG_PATH};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Path of the config file, created with defaults if missing.
    #[arg(long, short = 'c', global = true, env = "WWW_BACKUP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Simulative run: nothing is written and no service is touched.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Unattended run, never prompt for missing configuration.
    #[arg(long, global = true)]
    pub auto: bool,

    /// Don't echo the log on the console.
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,

    /// Append the log to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub action: Option<Action>,
}

impl Cli {
    /// The values of the command line overriding the config file.
    pub fn overrides(&self) -> Overrides {
        let location = match &self.action {
            Some(Action::Backup(args)) => Some(&args.location),
            Some(Action::Restore(args)) => Some(&args.location),
            Some(Action::List(location)) => Some(location),
            Some(Action::Verify(args)) => Some(&args.location),
            None => None,
        };
        let backup_type = match &self.action {
            Some(Action::Backup(args)) => args.backup_type,
            _ => None,
        };
        let web_root = match &self.action {
            Some(Action::Restore(_)) => WebRootUse::Replace,
            _ => WebRootUse::Read,
        };

        Overrides {
            www_source_path: location.and_then(|l| l.source.clone()),
            destination_path: location.and_then(|l| l.destination.clone()),
            backup_type,
            log_file: self.log_file.clone(),
            dry_run: self.dry_run,
            automatic_mode: self.auto,
            quiet: self.quiet,
            web_root,
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
pub struct LocationArgs {
    /// Web root, overrides `www_source_path` of the config file.
    #[arg(long, short = 's')]
    pub source: Option<PathBuf>,

    /// Folder of the artifacts, overrides `destination_path` of the config file.
    #[arg(long, short = 'd')]
    pub destination: Option<PathBuf>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct BackupArgs {
    /// Kind of artifact to create.
    #[arg(long = "type", value_enum)]
    pub backup_type: Option<BackupType>,

    #[command(flatten)]
    pub location: LocationArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Artifact to restore, as printed by `list`.
    pub id: ArtifactId,

    #[command(flatten)]
    pub location: LocationArgs,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Artifact to verify, as printed by `list`.
    pub id: ArtifactId,

    #[command(flatten)]
    pub location: LocationArgs,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Action {
    /// Backup the web root and the database. (Default)
    Backup(BackupArgs),
    /// Replace the web root and the database with an artifact.
    Restore(RestoreArgs),
    /// List all artifacts of the destination.
    List(LocationArgs),
    /// Verify an artifact again.
    Verify(VerifyArgs),
}

impl Default for Action {
    fn default() -> Self {
        Self::Backup(BackupArgs::default())
    }
}
