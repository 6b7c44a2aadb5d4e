//! `tlog!` and the optional per-run log file.
//!
//! Every run with a log directory gets its own `YYYYMMDD-HHMMSS-smartled.log`.
//! Only the newest [`KEEP_LOGS`] are kept, and `smartled.log` points at the
//! current one on Unix.

use crate::error::ProvisionError;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Global log file handle. When `Some`, `tlog!` writes to both stderr and this file.
#[doc(hidden)]
pub static LOG_FILE: Mutex<Option<std::fs::File>> = Mutex::new(None);

pub const LATEST_LOG_NAME: &str = "smartled.log";
const LOG_SUFFIX: &str = "-smartled.log";

/// Per-run log files kept in the directory, the new one included.
pub const KEEP_LOGS: usize = 10;

#[doc(hidden)]
pub fn timestamp() -> impl std::fmt::Display {
    chrono::Local::now().format("%H:%M:%S%.3f")
}

/// Start writing `tlog!` output to a new file in `log_dir`.
/// Returns the path of the file.
pub fn init_file_logging(log_dir: &Path) -> Result<PathBuf, ProvisionError> {
    std::fs::create_dir_all(log_dir)
        .map_err(|e| ProvisionError::Config(format!("cannot create log dir {}: {e}", log_dir.display())))?;

    let filename = format!("{}{LOG_SUFFIX}", chrono::Local::now().format("%Y%m%d-%H%M%S"));
    let log_path = log_dir.join(&filename);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| ProvisionError::Config(format!("cannot open {}: {e}", log_path.display())))?;

    // eprintln directly: LOG_FILE is not installed yet
    match prune_old_logs(log_dir, KEEP_LOGS) {
        Ok(0) => {}
        Ok(n) => eprintln!("{} [logging] Removed {n} old log file(s)", timestamp()),
        Err(e) => eprintln!("{} [logging] Could not prune {}: {e}", timestamp(), log_dir.display()),
    }

    #[cfg(unix)]
    {
        let latest = log_dir.join(LATEST_LOG_NAME);
        let _ = std::fs::remove_file(&latest);
        if let Err(e) = std::os::unix::fs::symlink(&filename, &latest) {
            eprintln!("{} [logging] No {LATEST_LOG_NAME} link: {e}", timestamp());
        }
    }

    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    crate::tlog!("[logging] Writing {}", log_path.display());
    Ok(log_path)
}

/// Stop file logging and close the log file.
pub fn stop_file_logging() {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if guard.take().is_some() {
            eprintln!("{} [logging] File logging stopped", timestamp());
        }
    }
}

/// Delete the oldest per-run logs so that at most `keep` remain.
/// Names sort by their timestamp prefix. Other files are left alone.
/// Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> std::io::Result<usize> {
    let mut logs: Vec<PathBuf> = std::fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(LOG_SUFFIX) && n.len() > LOG_SUFFIX.len())
        })
        .filter(|path| path.symlink_metadata().is_ok_and(|m| m.is_file()))
        .collect();
    if logs.len() <= keep {
        return Ok(0);
    }

    logs.sort();
    let excess = logs.len() - keep;
    let mut removed = 0;
    for path in &logs[..excess] {
        if std::fs::remove_file(path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Timestamped logging macro.
/// Prepends `HH:MM:SS.mmm` local time to every message written to stderr.
/// Also writes to the log file when file logging is enabled.
#[macro_export]
macro_rules! tlog {
    ($($arg:tt)*) => {{
        use std::io::Write as _;
        let msg = format!("{} {}", $crate::logging::timestamp(), format_args!($($arg)*));
        eprintln!("{}", msg);
        if let Ok(mut guard) = $crate::logging::LOG_FILE.lock() {
            if let Some(ref mut f) = *guard {
                let _ = writeln!(f, "{}", msg);
            }
        }
    }};
}
