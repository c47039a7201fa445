//! Logger setup: timestamped lines on the console and in an optional log file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use chrono::Local;
use env_logger::{Env, Target};
use log::{Level, LevelFilter, Record};

use super::SUCCESS_TARGET;

/// Category printed for a record.
pub fn category(record: &Record<'_>) -> &'static str {
    if record.target() == SUCCESS_TARGET {
        return "SUCCESS";
    }
    match record.level() {
        Level::Error => "ERROR",
        Level::Warn => "WARNING",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Writes to the console (unless quiet) and appends to the log file.
struct Tee {
    console: bool,
    file: Option<File>,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.console {
            io::stderr().write_all(buf)?;
        }
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.console {
            io::stderr().flush()?;
        }
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        Ok(())
    }
}

/// Install the global logger.
///
/// `quiet` only silences the console, the log file always receives every line.
pub fn init(level: Option<LevelFilter>, quiet: bool, log_file: Option<&Path>) -> io::Result<()> {
    let file = log_file
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()?;

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }

    builder
        .format(|buf, record| {
            let target = record.target();
            let category = category(record);
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
            if target == SUCCESS_TARGET {
                writeln!(buf, "[{timestamp}] {category}: {}", record.args())
            } else {
                writeln!(buf, "[{timestamp}] {category} {target}: {}", record.args())
            }
        })
        .target(Target::Pipe(Box::new(Tee {
            console: !quiet,
            file,
        })));

    builder.try_init().map_err(io::Error::other)
}
