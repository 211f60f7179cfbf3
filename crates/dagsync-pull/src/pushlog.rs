//! Optional file-backed diagnostic log.
//!
//! When the `PUSH_LOG` environment variable is the case-insensitive string
//! `true`, records are appended to `<temp_dir>/push.log` with microsecond
//! timestamps. Open failures silently disable the log; pulls never fail
//! because of diagnostics.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;

pub(crate) struct PushLog {
    file: Mutex<File>,
}

impl PushLog {
    /// Opens the log if `PUSH_LOG` requests it.
    pub(crate) fn from_env(temp_dir: &Path) -> Option<PushLog> {
        let value = std::env::var("PUSH_LOG").ok()?;
        if !value.eq_ignore_ascii_case("true") {
            return None;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(temp_dir.join("push.log"))
            .ok()?;
        Some(PushLog {
            file: Mutex::new(file),
        })
    }

    /// Appends one timestamped record. Write errors are ignored.
    pub(crate) fn record(&self, msg: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{} {}", Utc::now().format("%H:%M:%S%.6f"), msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test covers both env states: the variable is process-global, so
    // splitting these would race under the parallel test runner.
    #[test]
    fn env_gates_log_creation() {
        let dir = tempfile::tempdir().unwrap();

        std::env::remove_var("PUSH_LOG");
        assert!(PushLog::from_env(dir.path()).is_none());

        std::env::set_var("PUSH_LOG", "TRUE");
        let log = PushLog::from_env(dir.path()).expect("log enabled");
        log.record("level 0: fetching 2 chunks");
        log.record("done");
        std::env::remove_var("PUSH_LOG");

        let contents = std::fs::read_to_string(dir.path().join("push.log")).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("level 0: fetching 2 chunks"));
        // Timestamp prefix carries microsecond precision: HH:MM:SS.ssssss
        let ts = lines[0].split_whitespace().next().unwrap();
        assert_eq!(ts.len(), "00:00:00.000000".len());
    }
}
