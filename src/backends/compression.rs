//! Compression of the files archive.
//!
//! Gzip is done in-process using [flate2]. All other tools are external
//! processes the archive is piped through.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread::JoinHandle;

use clap::ValueEnum;
use derive_more::Display;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::backends::drain_stderr;

const DEFAULT_LEVEL: u32 = 6;

/// Supported compression tools.
#[derive(
    Copy, Clone, Debug, Display, Default, PartialEq, Eq, ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CompressionTool {
    /// In-process gzip.
    #[default]
    #[display("gzip")]
    Gzip,
    /// Parallel gzip.
    #[display("pigz")]
    Pigz,
    #[display("bzip2")]
    Bzip2,
    /// Parallel bzip2.
    #[display("pbzip2")]
    Pbzip2,
    /// xz, multi-threaded with `parallel_jobs`.
    #[display("xz")]
    Xz,
}

impl CompressionTool {
    /// File extension of an archive compressed by this tool.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Gzip | Self::Pigz => "tar.gz",
            Self::Bzip2 | Self::Pbzip2 => "tar.bz2",
            Self::Xz => "tar.xz",
        }
    }

    /// The external program needed, if any.
    pub fn program(&self) -> Option<&'static str> {
        match self {
            Self::Gzip => None,
            Self::Pigz => Some("pigz"),
            Self::Bzip2 => Some("bzip2"),
            Self::Pbzip2 => Some("pbzip2"),
            Self::Xz => Some("xz"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
/// Configuration of the archive compression.
pub struct CompressionConfig {
    #[serde(default)]
    pub tool: CompressionTool,

    /// Compression level from 1 (fast) to 9 (small).
    #[serde(default = "default_level")]
    pub level: u32,

    /// Worker count of parallel tools. `0` leaves the choice to the tool.
    #[serde(default)]
    pub parallel_jobs: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            tool: CompressionTool::default(),
            level: default_level(),
            parallel_jobs: 0,
        }
    }
}

fn default_level() -> u32 {
    DEFAULT_LEVEL
}

/// A compressing writer which has to be finished explicitly.
pub trait FinishWrite: Write + Send {
    /// Flush all pending data and make sure the output is complete.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Compression capability used by the archive producer and the restore.
pub trait Compressor: Send + Sync {
    fn tool(&self) -> CompressionTool;

    /// Wrap `out` into a compressing writer.
    fn compress(&self, out: File) -> io::Result<Box<dyn FinishWrite>>;

    /// Wrap `input` into a decompressing reader.
    fn decompress(&self, input: File) -> io::Result<Box<dyn Read + Send>>;
}

/// Create the [Compressor] configured by `cfg`.
pub fn compressor(cfg: &CompressionConfig) -> Box<dyn Compressor> {
    let level = cfg.level.clamp(1, 9);
    if level != cfg.level {
        log::warn!(target: "backend::compression", "Compression level {} out of range, using {level}", cfg.level);
    }

    match cfg.tool {
        CompressionTool::Gzip => {
            if cfg.parallel_jobs > 1 {
                log::debug!(target: "backend::compression", "gzip is single threaded, ignoring parallel_jobs");
            }
            Box::new(Gzip { level })
        }
        tool => Box::new(External {
            tool,
            level,
            jobs: cfg.parallel_jobs,
        }),
    }
}

/// In-process gzip compression.
#[derive(Debug, Clone, Copy)]
pub struct Gzip {
    level: u32,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.clamp(1, 9),
        }
    }
}

impl FinishWrite for GzEncoder<BufWriter<File>> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let writer = GzEncoder::finish(*self)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }
}

impl Compressor for Gzip {
    fn tool(&self) -> CompressionTool {
        CompressionTool::Gzip
    }

    fn compress(&self, out: File) -> io::Result<Box<dyn FinishWrite>> {
        let encoder = GzEncoder::new(BufWriter::new(out), Compression::new(self.level));
        Ok(Box::new(encoder))
    }

    fn decompress(&self, input: File) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(input))))
    }
}

/// Compression by piping through an external program.
#[derive(Debug, Clone, Copy)]
pub struct External {
    tool: CompressionTool,
    level: u32,
    jobs: usize,
}

impl External {
    fn program(&self) -> &'static str {
        // only constructed for tools with a program
        self.tool.program().unwrap_or("gzip")
    }

    fn compress_args(&self) -> Vec<String> {
        let mut args = vec!["-c".to_string(), format!("-{}", self.level)];
        if self.jobs > 0 {
            match self.tool {
                CompressionTool::Pigz => args.extend(["-p".to_string(), self.jobs.to_string()]),
                CompressionTool::Pbzip2 => args.push(format!("-p{}", self.jobs)),
                CompressionTool::Xz => args.push(format!("-T{}", self.jobs)),
                CompressionTool::Gzip | CompressionTool::Bzip2 => {}
            }
        }
        args
    }
}

impl Compressor for External {
    fn tool(&self) -> CompressionTool {
        self.tool
    }

    fn compress(&self, out: File) -> io::Result<Box<dyn FinishWrite>> {
        let program = self.program();
        let args = self.compress_args();
        log::trace!(target: "backend::compression", "Running: {program} {}", args.join(" "));

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(out))
            .stderr(Stdio::piped())
            .spawn()?;
        let stderr = drain_stderr("backend::compression", child.stderr.take());
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other(format!("{program} has no stdin")))?;

        Ok(Box::new(ExternalWriter {
            program,
            child,
            stdin: Some(stdin),
            stderr: Some(stderr),
        }))
    }

    fn decompress(&self, input: File) -> io::Result<Box<dyn Read + Send>> {
        let program = self.program();
        log::trace!(target: "backend::compression", "Running: {program} -d -c");

        let mut child = Command::new(program)
            .args(["-d", "-c"])
            .stdin(Stdio::from(input))
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other(format!("{program} has no stdout")))?;

        Ok(Box::new(ExternalReader {
            program,
            child,
            stdout,
            finished: false,
        }))
    }
}

struct ExternalWriter {
    program: &'static str,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
}

impl ExternalWriter {
    fn stdin(&mut self) -> io::Result<&mut ChildStdin> {
        self.stdin
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl Write for ExternalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdin()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdin()?.flush()
    }
}

impl FinishWrite for ExternalWriter {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        // closing stdin signals EOF to the compressor
        drop(self.stdin.take());

        let status = self.child.wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {status}: {}",
                self.program,
                stderr.trim_end()
            )));
        }

        Ok(())
    }
}

struct ExternalReader {
    program: &'static str,
    child: Child,
    stdout: ChildStdout,
    finished: bool,
}

impl Read for ExternalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stdout.read(buf)?;
        if n == 0 && !buf.is_empty() && !self.finished {
            self.finished = true;
            let status = self.child.wait()?;
            if !status.success() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{} exited with {status}", self.program),
                ));
            }
        }

        Ok(n)
    }
}

impl Drop for ExternalReader {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
