//! Operation log: one line per request milestone.
//!
//! An [`OperationLog`] is built once in `main` and handed to the service as
//! an `Arc`. Every record goes to `tracing`; when a log file is configured the
//! same record is also appended as
//! `[YYYY-MM-DD HH:MM:SS] [component] [SEVERITY] message`.

use crate::error::FileProcError;
use chrono::{DateTime, Local};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Severity of an operation-log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "INFO",
            Severity::Success => "SUCCESS",
            Severity::Error => "ERROR",
        })
    }
}

/// Injectable operation logger.
#[derive(Debug)]
pub struct OperationLog {
    sink: Option<(PathBuf, Mutex<File>)>,
}

impl OperationLog {
    /// Logger that only emits through `tracing`.
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Logger that also appends to `path`, creating it if needed.
    pub fn to_file(path: impl Into<PathBuf>) -> Result<Self, FileProcError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FileProcError::io(&path, e))?;
        Ok(Self {
            sink: Some((path, Mutex::new(file))),
        })
    }

    /// Log file path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(p, _)| p.as_path())
    }

    pub fn record(&self, component: &str, severity: Severity, message: &str) {
        match severity {
            Severity::Info | Severity::Success => {
                info!(component, severity = %severity, "{message}")
            }
            Severity::Error => error!(component, severity = %severity, "{message}"),
        }

        let Some((path, file)) = &self.sink else {
            return;
        };
        let line = format_line(&Local::now(), component, severity, message);
        let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            warn!("Failed to append to operation log {}: {}", path.display(), e);
        }
    }

    pub fn info(&self, component: &str, message: &str) {
        self.record(component, Severity::Info, message);
    }

    pub fn success(&self, component: &str, message: &str) {
        self.record(component, Severity::Success, message);
    }

    pub fn error(&self, component: &str, message: &str) {
        self.record(component, Severity::Error, message);
    }
}

/// Render one log line.
pub fn format_line(
    at: &DateTime<Local>,
    component: &str,
    severity: Severity,
    message: &str,
) -> String {
    format!(
        "[{}] [{}] [{}] {}",
        at.format("%Y-%m-%d %H:%M:%S"),
        component,
        severity,
        message
    )
}
