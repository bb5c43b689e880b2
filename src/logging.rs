use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer, filter::Targets, fmt::time::ChronoLocal, layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{TetherError, TetherResult};

/// Tracing target for raw output of the supervised ssh process
pub const SSH_TARGET: &str = "ssh";

const SSH_LOG_MAX_BYTES: u64 = 1_000_000;
const SSH_LOG_BACKUPS: usize = 10;

/// Create an environment filter for the console based on verbosity level
pub fn create_env_filter(verbosity: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbosity {
            0 => EnvFilter::new("tether=warn,ssh=off"),
            1 => EnvFilter::new("tether=info,ssh=off"),
            _ => EnvFilter::new("tether=debug,ssh=off"),
        }
    }
}

/// Default directory for log files, `~/.tether`
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tether")
}

/// Initialize logging with tracing.
///
/// Operational events go to stderr (filtered by `verbosity`) and to `tether.log`;
/// ssh output goes only to `ssh.log`, which is returned so the supervisor can
/// rotate it once per connection attempt.
pub fn init_logging(verbosity: u8, log_dir: &Path) -> TetherResult<Arc<RotatingFile>> {
    fs::create_dir_all(log_dir).map_err(|e| {
        TetherError::Config(format!(
            "Failed to create log directory {}: {e}",
            log_dir.display()
        ))
    })?;

    let main_log = File::create(log_dir.join("tether.log"))?;
    let ssh_log = Arc::new(RotatingFile::create(
        log_dir.join("ssh.log"),
        SSH_LOG_MAX_BYTES,
        SSH_LOG_BACKUPS,
    )?);

    let console = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_filter(create_env_filter(verbosity));

    let main_file = tracing_subscriber::fmt::layer()
        .with_writer(Arc::new(main_log))
        .with_ansi(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_filter(Targets::new().with_target("tether", Level::DEBUG));

    let ssh_file = tracing_subscriber::fmt::layer()
        .with_writer(Arc::clone(&ssh_log))
        .with_ansi(false)
        .with_timer(ChronoLocal::rfc_3339())
        .with_filter(Targets::new().with_target(SSH_TARGET, Level::DEBUG));

    tracing_subscriber::registry()
        .with(console)
        .with(main_file)
        .with(ssh_file)
        .try_init()
        .map_err(|e| TetherError::Config(e.to_string()))?;

    Ok(ssh_log)
}

struct RotatingState {
    file: File,
    written: u64,
}

/// A log file that rolls over to numbered backups on demand or when it grows past
/// a size limit.
///
/// `ssh.log` becomes `ssh.log.1`, `ssh.log.1` becomes `ssh.log.2`, and so on up to
/// the backup count; the oldest backup is dropped.
pub struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    state: Mutex<RotatingState>,
}

impl RotatingFile {
    /// Create (truncating) the log file at `path`. A `max_bytes` of 0 disables
    /// size-based rollover.
    pub fn create(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            max_bytes,
            backups,
            state: Mutex::new(RotatingState { file, written: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the `index`-th backup
    pub fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, RotatingState>> {
        self.state
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))
    }

    /// Roll the current file over to the first backup and start a new one
    pub fn rotate(&self) -> io::Result<()> {
        let mut state = self.lock()?;
        self.rotate_locked(&mut state)
    }

    fn rotate_locked(&self, state: &mut RotatingState) -> io::Result<()> {
        state.file.flush()?;
        if self.backups > 0 {
            for index in (1..self.backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            fs::rename(&self.path, self.backup_path(1))?;
        }
        state.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        state.written = 0;
        Ok(())
    }
}

impl Write for &RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock()?;
        if self.max_bytes > 0
            && state.written > 0
            && state.written + buf.len() as u64 > self.max_bytes
        {
            self.rotate_locked(&mut state)?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock()?.file.flush()
    }
}
