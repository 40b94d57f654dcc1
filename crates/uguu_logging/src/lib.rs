//! Shared logging setup for uguu binaries.
//!
//! Every event goes to stderr and to a size-rotated log file under
//! `$UGUU_HOME/logs` (default `~/.uguu/logs`). `RUST_LOG` overrides the
//! default filter.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "uguu_spider=info,uguu_db=info";
const VERBOSE_LOG_FILTER: &str = "uguu_spider=debug,uguu_db=debug";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Logging configuration shared by uguu binaries.
pub struct LogConfig<'a> {
    /// Base name of the log file (`<app_name>.log`)
    pub app_name: &'a str,
    pub verbose: bool,
    /// Directory for log files; defaults to [`logs_dir`]
    pub log_dir: Option<PathBuf>,
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir(),
    };
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create logs directory: {}", log_dir.display()))?;

    let file_writer =
        RotatingWriter::open(&log_dir, config.app_name, MAX_LOG_FILES, MAX_LOG_FILE_SIZE)
            .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let default_filter = if config.verbose {
        VERBOSE_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(filter()),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// The uguu home directory: `$UGUU_HOME`, else `~/.uguu`.
pub fn uguu_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("UGUU_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".uguu")
}

/// The logs directory: `<uguu home>/logs`
pub fn logs_dir() -> PathBuf {
    uguu_home().join("logs")
}

/// Log file that starts over once it reaches a size limit, keeping
/// `<name>.log.1` .. `<name>.log.<max_files - 1>` as older generations.
struct RotatingFile {
    dir: PathBuf,
    name: String,
    max_files: usize,
    max_size: u64,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(dir: &Path, app_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        let name = file_stem(app_name);
        let path = dir.join(format!("{}.log", name));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        let mut rotating = Self {
            dir: dir.to_path_buf(),
            name,
            max_files: max_files.max(1),
            max_size,
            file,
            written,
        };
        if rotating.written > rotating.max_size {
            rotating.rotate()?;
        }
        Ok(rotating)
    }

    fn generation(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.name))
        } else {
            self.dir.join(format!("{}.log.{}", self.name, index))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        let last = self.max_files - 1;
        if last == 0 {
            self.file = File::create(self.generation(0))?;
            self.written = 0;
            return Ok(());
        }

        let oldest = self.generation(last);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (0..last).rev() {
            let from = self.generation(index);
            if from.exists() {
                fs::rename(&from, self.generation(index + 1))?;
            }
        }

        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.generation(0))?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// `MakeWriter` handing out guards over one shared rotating file.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingWriter {
    fn open(dir: &Path, app_name: &str, max_files: usize, max_size: u64) -> io::Result<Self> {
        let file = RotatingFile::open(dir, app_name, max_files, max_size)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct RotatingGuard {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingGuard {
    fn with<T>(&self, f: impl FnOnce(&mut RotatingFile) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        f(&mut file)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for RotatingGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with(|file| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with(|file| file.flush())
    }
}

fn file_stem(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
