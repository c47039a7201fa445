//! Implements dump and import of MySQL/MariaDB databases using [MariaDb].

use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use derive_more::{Display, Error};

use crate::backends::{drain_stderr, DatabaseDumper, DumpError};

const DUMP_TOOLS: [&str; 2] = ["mariadb-dump", "mysqldump"];
const CLIENT_TOOLS: [&str; 2] = ["mariadb", "mysql"];

/// Reference to the database password.
///
/// The password itself never ends up in the configuration file.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasswordRef {
    /// Name of an environment variable holding the password.
    Env(String),
    /// File containing the password.
    File(PathBuf),
}

/// The password behind a [PasswordRef] can't be obtained.
#[derive(Debug, Display, Error)]
pub enum PasswordError {
    #[display("Environment variable {_0} with the database password is not set")]
    EnvMissing(#[error(ignore)] String),
    #[display("Reading database password from {} failed: {source}", path.display())]
    File { path: PathBuf, source: io::Error },
}

impl PasswordRef {
    /// Resolve the reference to the actual password.
    pub fn resolve(&self) -> Result<String, PasswordError> {
        match self {
            Self::Env(var) => {
                std::env::var(var).map_err(|_| PasswordError::EnvMissing(var.clone()))
            }
            Self::File(path) => std::fs::read_to_string(path)
                .map(|password| password.trim_end_matches(['\r', '\n']).to_string())
                .map_err(|source| PasswordError::File {
                    path: path.clone(),
                    source,
                }),
        }
    }
}

/// Connection settings of the database to back up.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    /// Name of the database.
    pub name: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<PasswordRef>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    3306
}

/// The [MariaDb] backend dumps and imports a MySQL/MariaDB database
/// with the command line clients of the server.
pub struct MariaDb {
    config: DatabaseConfig,
    password: Option<String>,
    dump_tool: &'static str,
    client_tool: &'static str,
}

impl MariaDb {
    /// Create a new [MariaDb] instance, resolving the password reference.
    pub fn with_config(config: DatabaseConfig) -> Result<Self, PasswordError> {
        let password = config.password.as_ref().map(PasswordRef::resolve).transpose()?;

        // prefer the mariadb names, fall back to the mysql compat names
        let dump_tool = DUMP_TOOLS
            .into_iter()
            .find(|tool| which::which(tool).is_ok())
            .unwrap_or(DUMP_TOOLS[1]);
        let client_tool = CLIENT_TOOLS
            .into_iter()
            .find(|tool| which::which(tool).is_ok())
            .unwrap_or(CLIENT_TOOLS[1]);

        Ok(Self {
            config,
            password,
            dump_tool,
            client_tool,
        })
    }

    fn command(&self, tool: &str) -> Command {
        let mut command = Command::new(tool);
        command
            .arg(format!("--user={}", self.config.user))
            .arg(format!("--host={}", self.config.host))
            .arg(format!("--port={}", self.config.port));
        if let Some(password) = &self.password {
            command.env("MYSQL_PWD", password);
        }

        command
    }

    fn dump_command(&self) -> Command {
        let mut command = self.command(self.dump_tool);
        command
            .arg("--opt") // sensible dump defaults
            .arg("--single-transaction")
            .arg("--routines")
            .arg("--triggers")
            .arg(&self.config.name);
        command
    }

    fn import_command(&self) -> Command {
        let mut command = self.command(self.client_tool);
        command.arg(&self.config.name);
        command
    }
}

impl DatabaseDumper for MariaDb {
    fn database(&self) -> &str {
        &self.config.name
    }

    fn dump(&self, out: &mut dyn Write) -> Result<(), DumpError> {
        let tool = self.dump_tool.to_string();
        log::info!(target: "backend::mariadb", "Create database dump of: {}", self.config.name);
        log::trace!(target: "backend::mariadb", "Using dbuser '{}' for backup", self.config.user);

        let mut dump_process = self
            .dump_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DumpError::NotRun {
                tool: tool.clone(),
                source,
            })?;
        log::trace!(target: "backend::mariadb", "Started {tool} process.");

        let stderr = drain_stderr("backend::mariadb", dump_process.stderr.take());
        let copied = match dump_process.stdout.take() {
            Some(stdout) => io::copy(&mut BufReader::new(stdout), out).map(|_| ()),
            None => Err(io::Error::other("dump process has no stdout")),
        };

        let status = dump_process.wait().map_err(|source| DumpError::NotRun {
            tool: tool.clone(),
            source,
        })?;
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(DumpError::Failed {
                tool,
                status,
                stderr: stderr.trim_end().to_string(),
            });
        }
        copied?;

        log::info!(target: "backend::mariadb", "Finished database dump of {}.", self.config.name);
        Ok(())
    }

    fn import(&self, input: &mut dyn Read) -> Result<(), DumpError> {
        let tool = self.client_tool.to_string();
        log::info!(target: "backend::mariadb", "Import database dump into: {}", self.config.name);

        let mut import_process = self
            .import_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DumpError::NotRun {
                tool: tool.clone(),
                source,
            })?;

        let stderr = drain_stderr("backend::mariadb", import_process.stderr.take());
        let copied = match import_process.stdin.take() {
            // stdin is dropped after copying, closing the pipe
            Some(mut stdin) => io::copy(input, &mut stdin).map(|_| ()),
            None => Err(io::Error::other("import process has no stdin")),
        };

        let status = import_process.wait().map_err(|source| DumpError::NotRun {
            tool: tool.clone(),
            source,
        })?;
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(DumpError::Failed {
                tool,
                status,
                stderr: stderr.trim_end().to_string(),
            });
        }
        copied?;

        log::info!(target: "backend::mariadb", "Finished import into {}.", self.config.name);
        Ok(())
    }

    fn required_tools(&self) -> Vec<String> {
        vec![self.dump_tool.to_string(), self.client_tool.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DatabaseConfig {
        DatabaseConfig {
            name: "wordpress".into(),
            user: "backup".into(),
            password: None,
            host: "db.local".into(),
            port: 3307,
        }
    }

    #[test]
    fn dump_command_arguments() {
        let db = MariaDb::with_config(config()).unwrap();
        let command = db.dump_command();
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        assert!(args.contains(&"--user=backup".to_string()));
        assert!(args.contains(&"--host=db.local".to_string()));
        assert!(args.contains(&"--port=3307".to_string()));
        assert!(args.contains(&"--single-transaction".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("wordpress"));
    }

    #[test]
    fn password_from_file_is_passed_by_env() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("pw");
        std::fs::write(&file, "s3cret\n").unwrap();

        let mut cfg = config();
        cfg.password = Some(PasswordRef::File(file));
        let db = MariaDb::with_config(cfg).unwrap();
        let command = db.import_command();

        let pwd = command
            .get_envs()
            .find(|(k, _)| *k == "MYSQL_PWD")
            .and_then(|(_, v)| v);
        assert_eq!(pwd.map(|v| v.to_string_lossy().into_owned()), Some("s3cret".into()));
        assert!(command.get_args().all(|a| !a.to_string_lossy().contains("s3cret")));
    }

    #[test]
    fn missing_password_env_is_reported() {
        let mut cfg = config();
        cfg.password = Some(PasswordRef::Env("WWW_BACKUP_TEST_UNSET_PASSWORD".into()));
        assert!(matches!(
            MariaDb::with_config(cfg),
            Err(PasswordError::EnvMissing(var)) if var == "WWW_BACKUP_TEST_UNSET_PASSWORD"
        ));
    }

    #[test]
    fn database_config_from_toml() {
        let cfg: DatabaseConfig = toml::from_str(
            r#"
            name = "shop"
            user = "root"
            password = { env = "DB_PASSWORD" }
            "#,
        )
        .unwrap();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 3306);
        assert_eq!(cfg.password, Some(PasswordRef::Env("DB_PASSWORD".into())));
    }
}
