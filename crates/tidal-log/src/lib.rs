//! Structured logging and tracing for Tidal.
//!
//! Provides leveled, filterable logging via the `tracing` ecosystem. Console
//! output carries uptime timestamps and module paths; an optional JSON log file
//! persists records for post-mortem analysis and can be flushed on demand
//! through the returned [`LogHandle`].

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tidal_config::Config;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name of the persisted JSON log inside the log directory.
pub const LOG_FILE_NAME: &str = "tidal.log";

const DEFAULT_FILTER: &str = "info";

/// Errors raised while installing the logging stack.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The log directory or file could not be created.
    #[error("failed to open log file: {0}")]
    Io(#[from] io::Error),

    /// A global subscriber was already installed.
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Buffered, shareable writer behind the persisted JSON log.
#[derive(Clone)]
pub struct PersistedLog {
    file: Arc<Mutex<BufWriter<File>>>,
}

impl PersistedLog {
    /// Create (or truncate) `<log_dir>/tidal.log`.
    pub fn create(log_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let file = File::create(log_dir.join(LOG_FILE_NAME))?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }
}

impl Write for PersistedLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("persisted log lock poisoned"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .lock()
            .map_err(|_| io::Error::other("persisted log lock poisoned"))?
            .flush()
    }
}

/// Handle returned by [`init_logging`]; owns the persisted log, if any.
pub struct LogHandle {
    persisted: Option<PersistedLog>,
}

impl LogHandle {
    /// Whether records are also written to disk.
    pub fn is_persisted(&self) -> bool {
        self.persisted.is_some()
    }

    /// Push buffered persisted-log lines to disk. No-op without a log file.
    pub fn flush(&mut self) -> io::Result<()> {
        match self.persisted.as_mut() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Build the filter from the configured level; `RUST_LOG` wins when set.
pub fn env_filter_for(config: &Config) -> EnvFilter {
    let level = if config.debug.log_level.is_empty() {
        DEFAULT_FILTER
    } else {
        config.debug.log_level.as_str()
    };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global tracing subscriber.
///
/// When `config.debug.persist_logs` is set and `log_dir` is given, records are
/// also written as JSON lines to `<log_dir>/tidal.log`.
pub fn init_logging(config: &Config, log_dir: Option<&Path>) -> Result<LogHandle, LogError> {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let persisted = match log_dir {
        Some(dir) if config.debug.persist_logs => Some(PersistedLog::create(dir)?),
        _ => None,
    };

    let file_layer = persisted.clone().map(|log| {
        fmt::layer()
            .with_writer(move || log.clone())
            .with_ansi(false)
            .with_target(true)
            .with_timer(fmt::time::uptime())
            .json()
    });

    tracing_subscriber::registry()
        .with(env_filter_for(config))
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(LogHandle { persisted })
}
