//! `tracing` subscriber setup for embedders of the image cache.
//!
//! The crate itself only emits events (targets under `imgcache::`); installing a subscriber is
//! the embedder's choice. [`init`] wires an env-driven filter, a stderr console layer, an optional
//! rolling file sink and a bridge for `log` records. The first successful call wins; later calls
//! return the installed handle unchanged.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use anyhow::{Context, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, filter::LevelFilter, util::SubscriberInitExt};

use crate::Result;

/// Environment variables consulted, in order, for a filter directive.
pub const FILTER_ENV_VARS: [&str; 2] = ["IMGCACHE_LOG", "RUST_LOG"];

static LOG_HANDLE: OnceLock<LogHandle> = OnceLock::new();

pub use tracing_subscriber::filter::LevelFilter as LogLevel;

/// Rolled log file sink.
#[derive(Debug, Clone)]
pub struct FileSink {
    pub directory: PathBuf,
    /// File name prefix; files are named `<prefix>.<date>.log`.
    pub prefix: String,
    /// Rolled files kept on startup. `None` keeps everything.
    pub retention: Option<usize>,
    pub rotation: LogRotation,
    pub level: LevelFilter,
}

impl Default for FileSink {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            prefix: "imgcache".to_string(),
            retention: Some(7),
            rotation: LogRotation::Daily,
            level: LevelFilter::DEBUG,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(value: LogRotation) -> Self {
        match value {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub console_level: LevelFilter,
    pub file: Option<FileSink>,
    /// Forward `log` crate records into `tracing`.
    pub capture_log: bool,
    /// Explicit filter directive such as `imgcache::decode=trace`. Falls back to
    /// [`FILTER_ENV_VARS`].
    pub directive: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        let console_level =
            if cfg!(debug_assertions) { LevelFilter::INFO } else { LevelFilter::WARN };
        Self { console_level, file: Some(FileSink::default()), capture_log: true, directive: None }
    }
}

impl LogConfig {
    /// Console output only, no files on disk.
    pub fn console_only() -> Self {
        Self { file: None, ..Self::default() }
    }

    pub fn with_log_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        let sink = self.file.get_or_insert_with(FileSink::default);
        sink.directory = path.into();
        self
    }
}

/// Keeps the non-blocking file writer alive for the life of the process.
#[derive(Debug)]
pub struct LogHandle {
    _guard: Option<WorkerGuard>,
    directory: Option<PathBuf>,
}

impl LogHandle {
    /// Directory of the file sink, if one was configured.
    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }
}

/// Install the global subscriber, or return the one installed earlier.
pub fn init(config: LogConfig) -> Result<&'static LogHandle> {
    if let Some(handle) = LOG_HANDLE.get() {
        return Ok(handle);
    }
    let handle = install(config)?;
    // A racing initialiser may have won; either handle is equivalent to callers.
    let _ = LOG_HANDLE.set(handle);
    LOG_HANDLE.get().ok_or_else(|| anyhow!("log handle missing after initialisation"))
}

fn install(config: LogConfig) -> Result<LogHandle> {
    let mut max_level = config.console_level;
    if let Some(sink) = &config.file {
        max_level = max_level.max(sink.level);
    }
    if config.capture_log {
        let _ = tracing_log::LogTracer::builder().with_max_level(to_log_level(max_level)).init();
    }

    let directive = config
        .directive
        .or_else(|| FILTER_ENV_VARS.iter().find_map(|var| std::env::var(var).ok()))
        .filter(|directive| !directive.trim().is_empty())
        .unwrap_or_else(|| "imgcache_core=info".to_string());
    let env_filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("parsing log filter directive `{directive}`"))?;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(config.console_level);

    let (file_layer, guard, directory) = match config.file {
        Some(sink) => {
            let (writer, guard) = open_file_sink(&sink)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_thread_names(true)
                .with_filter(sink.level);
            (Some(layer), Some(guard), Some(sink.directory))
        }
        None => (None, None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("installing tracing subscriber")?;

    Ok(LogHandle { _guard: guard, directory })
}

fn open_file_sink(
    sink: &FileSink,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    fs::create_dir_all(&sink.directory)
        .with_context(|| format!("creating log directory {}", sink.directory.display()))?;

    if let Some(keep) = sink.retention.filter(|keep| *keep > 0) {
        prune_rolled_files(&sink.directory, &sink.prefix, keep)
            .context("pruning rolled log files")?;
    }

    let appender = tracing_appender::rolling::Builder::new()
        .rotation(sink.rotation.into())
        .filename_prefix(&sink.prefix)
        .filename_suffix("log")
        .build(&sink.directory)
        .context("creating rolling log appender")?;
    Ok(tracing_appender::non_blocking(appender))
}

fn to_log_level(level: LevelFilter) -> log::LevelFilter {
    match level {
        LevelFilter::OFF => log::LevelFilter::Off,
        LevelFilter::ERROR => log::LevelFilter::Error,
        LevelFilter::WARN => log::LevelFilter::Warn,
        LevelFilter::INFO => log::LevelFilter::Info,
        LevelFilter::DEBUG => log::LevelFilter::Debug,
        LevelFilter::TRACE => log::LevelFilter::Trace,
    }
}

/// Delete the oldest files named `<prefix>*` until at most `keep` remain.
fn prune_rolled_files(dir: &Path, prefix: &str, keep: usize) -> Result<usize> {
    let mut rolled: Vec<(PathBuf, SystemTime)> = fs::read_dir(dir)
        .with_context(|| format!("reading log directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let meta = entry.metadata().ok().filter(|meta| meta.is_file())?;
            let path = entry.path();
            let stem = path.file_name().and_then(OsStr::to_str)?;
            if !stem.starts_with(prefix) {
                return None;
            }
            Some((path, meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)))
        })
        .collect();

    if rolled.len() <= keep {
        return Ok(0);
    }
    rolled.sort_by_key(|(_, modified)| *modified);
    let excess = rolled.len() - keep;
    let mut removed = 0;
    for (path, _) in rolled.into_iter().take(excess) {
        if fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

fn default_log_directory() -> PathBuf {
    match directories::ProjectDirs::from("org", "imgcache", "imgcache") {
        Some(dirs) => dirs.cache_dir().join("logs"),
        None => std::env::temp_dir().join("imgcache-logs"),
    }
}
