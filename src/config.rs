//! Configuration file and the [EffectiveConfig] of one run.

use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::archive::scan::{Exclusions, PatternError};
use crate::archive::BackupType;
use crate::backends::mariadb::{DatabaseConfig, PasswordError};
use crate::backends::CompressionConfig;
use crate::environment::EnvironmentDescriptor;
use crate::services::ServiceSet;
use crate::util::retention::RetentionPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/www-backup.toml";
const DEFAULT_DESTINATION: &str = "/var/backups/www";

#[derive(Debug, Display, Error, From)]
pub enum ConfigurationError {
    #[display("Reading the config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("Parsing the config file {} failed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[display("Missing configuration value `{_0}`")]
    Missing(#[error(ignore)] &'static str),
    #[display("Invalid path {}: {reason}", path.display())]
    InvalidPath {
        #[error(ignore)]
        path: PathBuf,
        #[error(ignore)]
        reason: String,
    },
    #[display("Invalid value of `{key}`: {reason}")]
    InvalidValue {
        #[error(ignore)]
        key: &'static str,
        #[error(ignore)]
        reason: String,
    },
    #[from]
    #[display("{_0}")]
    Pattern(PatternError),
    #[from]
    #[display("Database credentials unavailable: {_0}")]
    Password(PasswordError),
    #[display("Reading the answer failed: {_0}")]
    Prompt(io::Error),
}

/// Content of the TOML config file.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Web root to back up, defaults to the root of the detected platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub www_source_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_path: Option<PathBuf>,
    pub backup_type: BackupType,
    pub exclusion_patterns: Vec<String>,
    /// Overrides the web services derived from the platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    /// Shell command run after every backup or restore.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    pub compression: CompressionConfig,
    pub retention: RetentionPolicy,
    /// Without a database only files are backed up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            www_source_path: None,
            destination_path: Some(PathBuf::from(DEFAULT_DESTINATION)),
            backup_type: BackupType::Full,
            exclusion_patterns: vec!["*.log".into(), "*.tmp".into(), "wp-content/cache".into()],
            services: None,
            notify_command: None,
            log_file: None,
            compression: CompressionConfig::default(),
            retention: RetentionPolicy::default(),
            database: None,
        }
    }
}

impl ConfigFile {
    /// Read the config file at `path`.
    ///
    /// A missing file yields the defaults, which are written to `path`
    /// if `write_default` is set.
    pub fn load(path: &Path, write_default: bool) -> Result<Self, ConfigurationError> {
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let default_config = Self::default();
                if write_default {
                    log::debug!(target: "config", "Writing default config to {} because it doesn't exist yet", path.display());
                    if let Err(e) = default_config.write(path) {
                        log::warn!(target: "config", "Writing default config to {} failed: {e}", path.display());
                    }
                }
                Ok(default_config)
            }
            Err(source) => Err(ConfigurationError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn write(&self, path: &Path) -> io::Result<()> {
        let content = toml::to_string_pretty(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }
}

/// What a run needs of the web root.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum WebRootUse {
    /// The web root is read and has to exist.
    #[default]
    Read,
    /// A restore replaces the web root, it may be gone but its parent has to exist.
    Replace,
}

/// Values given on the command line, taking precedence over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub www_source_path: Option<PathBuf>,
    pub destination_path: Option<PathBuf>,
    pub backup_type: Option<BackupType>,
    pub log_file: Option<PathBuf>,
    pub dry_run: bool,
    pub automatic_mode: bool,
    pub quiet: bool,
    pub web_root: WebRootUse,
}

/// Asks the operator for missing values.
pub trait Prompter {
    /// `Ok(None)` if the operator accepted the default or gave no answer.
    fn ask(&mut self, question: &str, default: Option<&str>) -> io::Result<Option<String>>;
}

/// [Prompter] on stdin/stderr.
#[derive(Debug, Default)]
pub struct StdinPrompter;

impl StdinPrompter {
    /// Whether prompting is possible at all.
    pub fn is_interactive() -> bool {
        io::stdin().is_terminal()
    }
}

impl Prompter for StdinPrompter {
    fn ask(&mut self, question: &str, default: Option<&str>) -> io::Result<Option<String>> {
        let mut stderr = io::stderr();
        match default {
            Some(default) => write!(stderr, "{question} [{default}]: ")?,
            None => write!(stderr, "{question}: ")?,
        }
        stderr.flush()?;

        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        let answer = answer.trim();
        Ok((!answer.is_empty()).then(|| answer.to_string()))
    }
}

/// The validated configuration of one run, immutable once built.
#[derive(Clone, Debug)]
pub struct EffectiveConfig {
    pub www_source_path: PathBuf,
    pub database: Option<DatabaseConfig>,
    pub destination_path: PathBuf,
    pub backup_type: BackupType,
    pub compression: CompressionConfig,
    pub exclusion_patterns: Vec<String>,
    pub retention: RetentionPolicy,
    pub services: Option<Vec<String>>,
    pub notify_command: Option<String>,
    pub log_file: Option<PathBuf>,
    pub dry_run: bool,
    pub automatic_mode: bool,
    pub quiet: bool,
}

impl EffectiveConfig {
    /// Merge `file` and `overrides` and validate the result.
    ///
    /// `prompter` is only consulted for values that are still missing.
    pub fn resolve(
        file: ConfigFile,
        overrides: Overrides,
        environment: &EnvironmentDescriptor,
        mut prompter: Option<&mut dyn Prompter>,
    ) -> Result<Self, ConfigurationError> {
        if overrides.automatic_mode {
            prompter = None;
        }

        let www_source_path = match overrides.www_source_path.or(file.www_source_path) {
            Some(path) => path,
            None => {
                let default = environment.default_web_root.to_string_lossy().into_owned();
                ask_path(&mut prompter, "Web root to back up", Some(&default))?
                    .unwrap_or_else(|| environment.default_web_root.clone())
            }
        };

        let destination_path = match overrides.destination_path.or(file.destination_path) {
            Some(path) => path,
            None => ask_path(&mut prompter, "Backup destination", None)?
                .ok_or(ConfigurationError::Missing("destination_path"))?,
        };

        let database = match file.database {
            Some(database) => Some(database),
            None => ask_database(&mut prompter)?,
        };

        let config = Self {
            www_source_path,
            database,
            destination_path,
            backup_type: overrides.backup_type.unwrap_or(file.backup_type),
            compression: file.compression,
            exclusion_patterns: file.exclusion_patterns,
            retention: file.retention,
            services: file.services,
            notify_command: file.notify_command,
            log_file: overrides.log_file.or(file.log_file),
            dry_run: overrides.dry_run,
            automatic_mode: overrides.automatic_mode,
            quiet: overrides.quiet,
        };
        config.validate(overrides.web_root)?;
        Ok(config)
    }

    /// Check every invariant of the configuration.
    pub fn validate(&self, web_root: WebRootUse) -> Result<(), ConfigurationError> {
        let source = &self.www_source_path;
        match web_root {
            WebRootUse::Read if !source.is_dir() => {
                return Err(ConfigurationError::InvalidPath {
                    path: source.clone(),
                    reason: "web root is not a directory".into(),
                });
            }
            WebRootUse::Replace if source.exists() && !source.is_dir() => {
                return Err(ConfigurationError::InvalidPath {
                    path: source.clone(),
                    reason: "web root is not a directory".into(),
                });
            }
            WebRootUse::Replace if !source.parent().is_some_and(Path::is_dir) => {
                return Err(ConfigurationError::InvalidPath {
                    path: source.clone(),
                    reason: "parent of the web root does not exist".into(),
                });
            }
            _ => {}
        }

        let source = normalize(source);
        let destination = normalize(&self.destination_path);
        if destination == source {
            return Err(ConfigurationError::InvalidPath {
                path: self.destination_path.clone(),
                reason: "destination is the web root".into(),
            });
        }
        if destination.starts_with(&source) {
            return Err(ConfigurationError::InvalidPath {
                path: self.destination_path.clone(),
                reason: "destination lies inside the web root".into(),
            });
        }
        check_writable(&self.destination_path)?;

        Exclusions::new(&self.exclusion_patterns)?;

        if !(1..=9).contains(&self.compression.level) {
            return Err(ConfigurationError::InvalidValue {
                key: "compression.level",
                reason: format!("{} is not within 1..=9", self.compression.level),
            });
        }
        if self.retention.max_count == Some(0) {
            return Err(ConfigurationError::InvalidValue {
                key: "retention.max_count",
                reason: "at least one artifact has to be kept".into(),
            });
        }

        if let Some(database) = &self.database {
            if database.name.is_empty() {
                return Err(ConfigurationError::Missing("database.name"));
            }
            if database.user.is_empty() {
                return Err(ConfigurationError::Missing("database.user"));
            }
            if let Some(password) = &database.password {
                password.resolve()?;
            }
        }

        Ok(())
    }

    /// Web services to quiesce during the run.
    pub fn service_set(&self, environment: &EnvironmentDescriptor) -> ServiceSet {
        match &self.services {
            Some(services) => ServiceSet::new(services),
            None => ServiceSet::new(environment.web_services()),
        }
    }
}

fn ask_path(
    prompter: &mut Option<&mut dyn Prompter>,
    question: &str,
    default: Option<&str>,
) -> Result<Option<PathBuf>, ConfigurationError> {
    let Some(prompter) = prompter else {
        return Ok(None);
    };
    let answer = prompter
        .ask(question, default)
        .map_err(ConfigurationError::Prompt)?;
    Ok(answer.map(PathBuf::from))
}

fn ask_database(
    prompter: &mut Option<&mut dyn Prompter>,
) -> Result<Option<DatabaseConfig>, ConfigurationError> {
    let Some(prompter) = prompter else {
        return Ok(None);
    };
    let Some(name) = prompter
        .ask("Database to back up (empty for files only)", None)
        .map_err(ConfigurationError::Prompt)?
    else {
        return Ok(None);
    };
    let user = prompter
        .ask("Database user", Some("root"))
        .map_err(ConfigurationError::Prompt)?
        .unwrap_or_else(|| "root".into());
    let password = prompter
        .ask("Environment variable holding the password (empty for none)", None)
        .map_err(ConfigurationError::Prompt)?
        .map(crate::backends::mariadb::PasswordRef::Env);

    Ok(Some(DatabaseConfig {
        name,
        user,
        password,
        host: "localhost".into(),
        port: 3306,
    }))
}

/// Absolute form of `path` with symlinks of its existing part resolved.
fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return rest.iter().rev().fold(canonical, |acc, part| acc.join(part));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

fn check_writable(destination: &Path) -> Result<(), ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidPath {
        path: destination.to_path_buf(),
        reason: reason.into(),
    };

    let mut existing = destination;
    while !existing.exists() {
        match existing.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => existing = parent,
            _ => return Ok(()),
        }
    }
    let metadata = existing
        .metadata()
        .map_err(|e| invalid(&e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory"));
    }
    if metadata.permissions().readonly() {
        return Err(invalid("not writable"));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::environment::{OsFamily, PackageManager, ServiceManagerKind};
    use std::collections::VecDeque;

    /// A plain full backup of `www` into `destination`.
    pub(crate) fn config_for(www: &Path, destination: &Path) -> EffectiveConfig {
        EffectiveConfig {
            www_source_path: www.to_path_buf(),
            database: None,
            destination_path: destination.to_path_buf(),
            backup_type: BackupType::Full,
            compression: CompressionConfig::default(),
            exclusion_patterns: Vec::new(),
            retention: RetentionPolicy::default(),
            services: None,
            notify_command: None,
            log_file: None,
            dry_run: false,
            automatic_mode: true,
            quiet: false,
        }
    }

    fn environment(web_root: &Path) -> EnvironmentDescriptor {
        EnvironmentDescriptor {
            os_family: OsFamily::Linux,
            distro: "debian".into(),
            distro_like: String::new(),
            package_manager: PackageManager::Apt,
            service_manager: ServiceManagerKind::Systemd,
            default_web_root: web_root.to_path_buf(),
        }
    }

    struct Scripted(VecDeque<Option<String>>);

    impl Scripted {
        fn new(answers: &[Option<&str>]) -> Self {
            Self(answers.iter().map(|a| a.map(String::from)).collect())
        }
    }

    impl Prompter for Scripted {
        fn ask(&mut self, _question: &str, _default: Option<&str>) -> io::Result<Option<String>> {
            Ok(self.0.pop_front().flatten())
        }
    }

    #[test]
    fn missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("www-backup.toml");

        let config = ConfigFile::load(&path, true).unwrap();
        assert_eq!(config, ConfigFile::default());
        assert_eq!(ConfigFile::load(&path, false).unwrap(), config);
    }

    #[test]
    fn parses_database_and_retention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("www-backup.toml");
        fs::write(
            &path,
            r#"
www_source_path = "/srv/www"
exclusion_patterns = ["*.log"]

[retention]
max_count = 3

[database]
name = "wordpress"
user = "backup"
password = { env = "WP_DB_PASSWORD" }
"#,
        )
        .unwrap();

        let config = ConfigFile::load(&path, false).unwrap();
        assert_eq!(config.www_source_path, Some(PathBuf::from("/srv/www")));
        assert_eq!(config.retention.max_count, Some(3));
        assert_eq!(config.retention.max_age_days, None);
        let database = config.database.unwrap();
        assert_eq!(database.port, 3306);
        assert_eq!(
            database.password,
            Some(crate::backends::mariadb::PasswordRef::Env("WP_DB_PASSWORD".into()))
        );
    }

    #[test]
    fn overrides_take_precedence() {
        let www = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let file = ConfigFile {
            www_source_path: Some("/does/not/matter".into()),
            ..Default::default()
        };
        let overrides = Overrides {
            www_source_path: Some(www.path().to_path_buf()),
            destination_path: Some(dest.path().to_path_buf()),
            backup_type: Some(BackupType::Incremental),
            dry_run: true,
            automatic_mode: true,
            ..Default::default()
        };

        let config =
            EffectiveConfig::resolve(file, overrides, &environment(www.path()), None).unwrap();
        assert_eq!(config.www_source_path, www.path());
        assert_eq!(config.backup_type, BackupType::Incremental);
        assert!(config.dry_run);
        assert!(config.database.is_none());
    }

    #[test]
    fn prompts_for_missing_values() {
        let www = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let dest_answer = dest.path().display().to_string();
        let file = ConfigFile {
            destination_path: None,
            ..Default::default()
        };
        let mut prompter = Scripted::new(&[None, Some(dest_answer.as_str()), Some("shop"), None, None]);

        let config = EffectiveConfig::resolve(
            file,
            Overrides::default(),
            &environment(www.path()),
            Some(&mut prompter),
        )
        .unwrap();
        assert_eq!(config.www_source_path, www.path());
        assert_eq!(config.destination_path, dest.path());
        let database = config.database.unwrap();
        assert_eq!((database.name.as_str(), database.user.as_str()), ("shop", "root"));
    }

    #[test]
    fn automatic_mode_never_prompts() {
        let www = tempfile::tempdir().unwrap();
        let file = ConfigFile {
            destination_path: None,
            ..Default::default()
        };
        let overrides = Overrides {
            automatic_mode: true,
            ..Default::default()
        };
        let mut prompter = Scripted::new(&[Some("/tmp/should-not-be-used")]);

        let err = EffectiveConfig::resolve(file, overrides, &environment(www.path()), Some(&mut prompter))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::Missing("destination_path")));
    }

    #[test]
    fn destination_inside_source_is_rejected() {
        let www = tempfile::tempdir().unwrap();
        let config = config_for(www.path(), &www.path().join("backups"));
        assert!(matches!(config.validate(WebRootUse::Read), Err(ConfigurationError::InvalidPath { .. })));

        let config = config_for(www.path(), www.path());
        assert!(matches!(config.validate(WebRootUse::Read), Err(ConfigurationError::InvalidPath { .. })));
    }

    #[test]
    fn restore_accepts_a_lost_web_root() {
        let root = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let www = root.path().join("www");
        let config = config_for(&www, dest.path());

        assert!(matches!(
            config.validate(WebRootUse::Read),
            Err(ConfigurationError::InvalidPath { .. })
        ));
        assert!(config.validate(WebRootUse::Replace).is_ok());

        let orphan = config_for(&root.path().join("gone/www"), dest.path());
        assert!(matches!(
            orphan.validate(WebRootUse::Replace),
            Err(ConfigurationError::InvalidPath { .. })
        ));

        fs::write(&www, b"not a directory").unwrap();
        assert!(config.validate(WebRootUse::Replace).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let www = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();

        let mut config = config_for(www.path(), dest.path());
        config.exclusion_patterns = vec!["[unclosed".into()];
        assert!(matches!(config.validate(WebRootUse::Read), Err(ConfigurationError::Pattern(_))));

        let mut config = config_for(www.path(), dest.path());
        config.compression.level = 12;
        assert!(matches!(config.validate(WebRootUse::Read), Err(ConfigurationError::InvalidValue { .. })));

        let mut config = config_for(www.path(), dest.path());
        config.retention.max_count = Some(0);
        assert!(config.validate(WebRootUse::Read).is_err());

        assert!(config_for(www.path(), dest.path()).validate(WebRootUse::Read).is_ok());
    }

    #[test]
    fn configured_services_replace_platform_defaults() {
        let www = tempfile::tempdir().unwrap();
        let mut config = config_for(www.path(), Path::new("/var/backups/www"));
        config.services = Some(vec!["caddy".into()]);

        let set = config.service_set(&environment(www.path()));
        assert_eq!(set.names().collect::<Vec<_>>(), ["caddy"]);
    }
}
