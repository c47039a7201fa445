//! Backend modules for the external tools a backup depends on.
//!
//! Currently the following backends are implemented:
//!
//! - [compression]: Compressors for the files archive, either in-process
//!   (gzip) or by piping through an external tool (pigz, bzip2, pbzip2, xz).
//! - [MariaDb]: Dump and import of a MySQL/MariaDB database.

pub mod compression;
pub mod mariadb;

use std::io::{self, Read, Write};
use std::thread;

use derive_more::{Display, Error, From};

pub use compression::{CompressionConfig, CompressionTool, Compressor};
pub use mariadb::MariaDb;

/// Errors of a [DatabaseDumper].
#[derive(Debug, Display, Error, From)]
pub enum DumpError {
    /// The dump or import client could not be run.
    #[display("Running {tool} failed: {source}")]
    NotRun {
        tool: String,
        source: io::Error,
    },
    /// The client exited unsuccessfully.
    #[display("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: std::process::ExitStatus,
        #[error(ignore)]
        stderr: String,
    },
    /// Writing the dump or reading the import stream failed.
    #[from]
    #[display("Streaming the database failed: {_0}")]
    Io(io::Error),
}

/// Generic database dump backend.
pub trait DatabaseDumper: Send + Sync {
    /// Name of the database, used for log messages.
    fn database(&self) -> &str;

    /// Write a complete SQL dump of the database to `out`.
    fn dump(&self, out: &mut dyn Write) -> Result<(), DumpError>;

    /// Import the SQL dump read from `input` into the database.
    fn import(&self, input: &mut dyn Read) -> Result<(), DumpError>;

    /// External tools the backend needs.
    fn required_tools(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Collect stderr of a child on a separate thread so it can't block the child.
pub(crate) fn drain_stderr(
    target: &'static str,
    stderr: Option<impl Read + Send + 'static>,
) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            if let Err(e) = stderr.read_to_string(&mut buf) {
                log::debug!(target: target, "Reading stderr of child process failed: {e}");
            }
        }
        buf
    })
}
