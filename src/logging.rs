use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// Guard is stored in a OnceLock so the non-blocking writer is never dropped
// while the process is alive.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const RETENTION_DAYS: u64 = 30;
const LOG_FILE_PREFIX: &str = "flowpilot";

pub struct LoggingSettings<'a> {
    pub level: Option<&'a str>,
    pub directory: Option<&'a str>,
    pub retention_days: Option<u64>,
}

/// Initialize tracing with a compact stdout layer and a daily-rolling file
/// layer. Returns the resolved log directory.
pub fn setup_tracing(settings: LoggingSettings) -> Result<PathBuf> {
    let log_dir = resolve_log_dir(settings.directory)?;
    let retention_days = settings.retention_days.unwrap_or(RETENTION_DAYS);
    if let Err(e) = cleanup_old_logs(&log_dir, retention_days) {
        eprintln!("Failed to cleanup old logs: {e}");
    }

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        return Err(anyhow!("logging already initialized"));
    }

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let default_filter = || {
        let level = settings.level.unwrap_or("info");
        EnvFilter::new(format!(
            "flowpilot={level},\
             axum=warn,tower_http=warn,hyper=warn,hyper_util=warn,reqwest=warn,mio=warn"
        ))
    };

    let filter = if settings.level.is_some() {
        default_filter()
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter())
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init();

    Ok(log_dir)
}

fn resolve_log_dir(configured: Option<&str>) -> Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
        .ok_or_else(|| anyhow!("could not find data directory"))?;
    let dir = if let Some(path) = configured {
        expand_tilde(path)
    } else {
        base.join("flowpilot").join("logs")
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn cleanup_old_logs(log_dir: &PathBuf, retention_days: u64) -> Result<()> {
    let now = SystemTime::now();
    let max_age = Duration::from_secs(60 * 60 * 24 * retention_days);
    for entry in std::fs::read_dir(log_dir)? {
        let entry = match entry {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Failed to read directory entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = match path.file_name().and_then(|n| n.to_str()) {
            Some(v) => v,
            None => continue,
        };
        if !file_name.starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(v) => v,
            Err(e) => {
                eprintln!("Failed to get metadata for {:?}: {e}", path);
                continue;
            }
        };
        if let Ok(age) = now.duration_since(modified) {
            if age > max_age {
                if let Err(e) = std::fs::remove_file(&path) {
                    eprintln!("Failed to remove old log file {:?}: {e}", path);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expansion() {
        let expanded = expand_tilde("~/logs");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("logs"));
        }
        assert_eq!(expand_tilde("/var/log/x"), PathBuf::from("/var/log/x"));
    }

    #[test]
    fn cleanup_removes_only_old_prefixed_files() {
        let dir = tempfile::tempdir().unwrap();
        let old_log = dir.path().join("flowpilot.2020-01-01");
        let other = dir.path().join("unrelated.log");
        std::fs::write(&old_log, "old").unwrap();
        std::fs::write(&other, "keep").unwrap();
        std::thread::sleep(Duration::from_millis(20));
        // Zero retention makes every prefixed file "old".
        cleanup_old_logs(&dir.path().to_path_buf(), 0).unwrap();
        assert!(!old_log.exists());
        assert!(other.exists());
    }
}
