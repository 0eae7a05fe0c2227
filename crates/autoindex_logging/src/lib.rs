//! Shared logging setup for autoindex binaries.
//!
//! Every binary logs to stderr and to a size-rotated file under
//! `$AUTOINDEX_HOME/logs/<app>.log`. `RUST_LOG` overrides the default filter.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "autoindex_executor=info,autoindex_scheduler=info,autoindex_policies=info";
const KEEP_ROTATED_FILES: usize = 4;
const ROTATE_AT_BYTES: u64 = 16 * 1024 * 1024;

/// Logging configuration shared by autoindex binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warnings only.
    pub verbose: bool,
    /// Overrides `$AUTOINDEX_HOME/logs`.
    pub log_dir: Option<PathBuf>,
}

/// Install the global tracing subscriber.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir(),
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

    let writer = RotatingWriter::open(&dir, config.app_name)
        .with_context(|| format!("Failed to open log file for {}", config.app_name))?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let stderr_filter = if config.verbose {
        file_filter.to_string()
    } else {
        "warn".to_string()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::new(stderr_filter)),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(())
}

/// autoindex home directory.
///
/// Priority:
/// 1) AUTOINDEX_HOME
/// 2) ~/.autoindex
/// 3) ./.autoindex
pub fn autoindex_home() -> PathBuf {
    if let Ok(path) = std::env::var("AUTOINDEX_HOME") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .map(|home| home.join(".autoindex"))
        .unwrap_or_else(|| PathBuf::from(".autoindex"))
}

pub fn logs_dir() -> PathBuf {
    autoindex_home().join("logs")
}

struct LogFile {
    path: PathBuf,
    file: File,
    written: u64,
}

impl LogFile {
    fn open(path: PathBuf) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            written,
        })
    }

    /// Shift `<app>.log.N` up by one, dropping the oldest, and start a fresh file.
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for idx in (1..KEEP_ROTATED_FILES).rev() {
            let from = rotated(&self.path, idx);
            if from.exists() {
                fs::rename(&from, rotated(&self.path, idx + 1))?;
            }
        }
        fs::rename(&self.path, rotated(&self.path, 1))?;
        *self = LogFile::open(self.path.clone())?;
        Ok(())
    }
}

fn rotated(path: &Path, idx: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}", idx));
    PathBuf::from(name)
}

/// Size-rotated file writer shared between tracing's per-event writers.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<LogFile>>,
}

impl RotatingWriter {
    fn open(dir: &Path, app_name: &str) -> io::Result<Self> {
        let file = LogFile::open(dir.join(format!("{}.log", sanitize_name(app_name))))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        if log.written + buf.len() as u64 > ROTATE_AT_BYTES {
            log.rotate()?;
        }
        let n = log.file.write(buf)?;
        log.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut log = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        log.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn sanitize_name(name: &str) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("autoindex-executor"), "autoindex-executor");
        assert_eq!(sanitize_name("exec/1 two"), "exec_1_two");
    }

    #[test]
    fn test_rotation_keeps_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("app.log");
        let mut log = LogFile::open(path.clone()).unwrap();
        log.file.write_all(b"first").unwrap();
        log.rotate().unwrap();

        assert_eq!(log.written, 0);
        assert_eq!(fs::read_to_string(rotated(&path, 1)).unwrap(), "first");
        assert!(path.exists());
    }

    #[test]
    fn test_writer_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = RotatingWriter::open(tmp.path(), "worker").unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();
        let text = fs::read_to_string(tmp.path().join("worker.log")).unwrap();
        assert_eq!(text, "hello\n");
    }
}
