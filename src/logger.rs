//! Append-only file logger, registered as the process-wide [`log::Log`]
//! sink so both this driver's own structured lines and any diagnostics
//! `fuser` itself emits through the `log` facade land in the same file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};

pub struct FileLogger {
    file: Mutex<File>,
    level: LevelFilter,
}

impl FileLogger {
    pub fn init(log_path: &Path, level: LevelFilter) -> anyhow::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| anyhow::anyhow!("cannot open log file {}: {e}", log_path.display()))?;

        let logger = FileLogger {
            file: Mutex::new(file),
            level,
        };
        log::set_boxed_logger(Box::new(logger))
            .map_err(|e| anyhow::anyhow!("logger already initialized: {e}"))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now = Utc::now();
        let line = format!(
            "{} {} {}\n",
            now.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            level_tag(record.level()),
            record.args()
        );
        // Best-effort: a failed write never cascades into the request path.
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
            let _ = file.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug | Level::Trace => "DEBUG",
    }
}

/// Builds one `op=... path=... decision=... detail=...` log line body, per
/// the external log format, for the operation layer to pass to `log::debug!`
/// and friends.
pub fn op_line(op: &str, path: &Path, decision: &str, detail: &str) -> String {
    format!(
        "op={op} path={} decision={decision} detail={detail}",
        path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn op_line_has_expected_shape() {
        let line = op_line("write", Path::new("/a.txt"), "FAIL(5)", "injected");
        assert!(line.starts_with("op=write path=/a.txt decision=FAIL(5) detail=injected"));
    }

    #[test]
    fn init_creates_log_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nas.log");
        // set_boxed_logger can only succeed once per process; this mirrors
        // what `main` does but we just check file creation semantics here.
        let file = OpenOptions::new().create(true).append(true).open(&path);
        assert!(file.is_ok());
        assert!(path.exists());
    }
}
