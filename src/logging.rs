use crate::config::SyncConfig;
use anyhow::{anyhow, Result};
use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

/// Maximum size per log file before rotation (~5 MB)
const MAX_LOG_FILE_SIZE: u64 = 5 * 1024 * 1024;
/// Number of rotated log files to keep
const MAX_LOG_FILES: usize = 5;
const LOG_FILE_STEM: &str = "ipod_sync";
pub const LOG_ENV_VAR: &str = "PODSYNC_LOG";

/// Append-only log file that rotates `ipod_sync.log` → `ipod_sync.1.log` → …
/// once it grows past the size limit.
pub struct RotatingFile {
    dir: PathBuf,
    max_size: u64,
}

impl RotatingFile {
    pub fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            max_size: MAX_LOG_FILE_SIZE,
        })
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", LOG_FILE_STEM))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.{}.log", LOG_FILE_STEM, index))
    }

    fn rotate_if_needed(&self) {
        let current = self.current_path();
        let file_size = fs::metadata(&current).map(|m| m.len()).unwrap_or(0);
        if file_size < self.max_size {
            return;
        }

        // Shift existing rotated files
        for i in (1..MAX_LOG_FILES).rev() {
            let _ = fs::rename(self.rotated_path(i), self.rotated_path(i + 1));
        }
        let _ = fs::rename(&current, self.rotated_path(1));
    }

    /// Writes a session marker line.
    pub fn mark_session_start(&mut self) -> io::Result<()> {
        let marker = format!(
            "=== podsync session started at {} ===\n",
            Local::now().format("%Y-%m-%d %H:%M:%S %Z")
        );
        self.write_all(marker.as_bytes())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotate_if_needed();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `<data dir>/podsync/logs`, unless the config names a directory.
pub fn log_dir(config: &SyncConfig) -> Option<PathBuf> {
    config
        .log_dir
        .clone()
        .or_else(|| dirs::data_local_dir().map(|d| d.join("podsync").join("logs")))
}

/// Installs the global subscriber: warnings and errors on stderr (everything
/// with `verbose`), plus the rotating log file when enabled. Returns the log
/// file path if file logging is active.
pub fn init_logging(config: &SyncConfig, verbose: bool) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let stderr_level = if verbose {
        LevelFilter::TRACE
    } else {
        LevelFilter::WARN
    };
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(stderr_level);

    let mut file_error = None;
    let file = if config.log_to_file {
        match log_dir(config).map(|dir| RotatingFile::new(&dir)) {
            Some(Ok(mut file)) => {
                let _ = file.mark_session_start();
                Some(file)
            }
            Some(Err(e)) => {
                file_error = Some(e.to_string());
                None
            }
            None => None,
        }
    } else {
        None
    };
    let file_path = file.as_ref().map(RotatingFile::current_path);

    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {}", e))?;

    if let Some(e) = file_error {
        warn!("File logging disabled: {}", e);
    }
    Ok(file_path)
}
