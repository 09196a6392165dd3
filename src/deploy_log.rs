//! Deployment Log Manager (C5): captures structured error entries for the
//! deployment currently in flight so they can be bundled and uploaded to the
//! server when a report carries `failure`. Held in the `RunContext` rather
//! than as process-wide state (see SPEC_FULL.md's note on avoiding the
//! implicit-global shape the teacher's own logging sink uses).

use crate::error::{self, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct LogBundle<'a> {
    messages: &'a [LogEntry],
}

/// Captures entries for one deployment into an in-memory buffer and a
/// per-deployment file, both best-effort: failures to persist are logged,
/// never propagated, since a lost deployment log must not sink the report
/// it was meant to accompany.
#[derive(Debug)]
pub struct DeploymentLogManager {
    dir: PathBuf,
    deployment_id: String,
    entries: Mutex<Vec<LogEntry>>,
}

impl DeploymentLogManager {
    pub fn new<P: Into<PathBuf>>(dir: P, deployment_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            deployment_id: deployment_id.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.log.json", self.deployment_id))
    }

    /// Appends a structured entry to the in-memory buffer and flushes the
    /// whole buffer to the per-deployment file via the same
    /// tempfile-then-persist pattern used for the checkpoint record.
    pub fn record(&self, level: LogLevel, message: impl Into<String>) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        };
        let mut entries = self.entries.lock().expect("deploy log lock poisoned");
        entries.push(entry);
        if let Err(e) = self.flush(&entries) {
            warn!("failed to persist deployment log: {}", e);
        }
    }

    fn flush(&self, entries: &[LogEntry]) -> Result<()> {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            warn!("failed to create deployment log directory: {}", e);
            return Ok(());
        }
        let tempfile = tempfile::NamedTempFile::new_in(&self.dir).context(
            error::CreateTempfileSnafu {
                key: self.deployment_id.clone(),
            },
        )?;
        serde_json::to_writer_pretty(&tempfile, entries).context(error::EncodeStateSnafu)?;
        tempfile
            .persist(self.path())
            .context(error::PersistStoreFileSnafu { path: self.path() })?;
        Ok(())
    }

    /// Returns the `{"messages": [...]}` document described in spec.md §4.5.
    pub fn bundle(&self) -> Result<Vec<u8>> {
        let entries = self.entries.lock().expect("deploy log lock poisoned");
        serde_json::to_vec(&LogBundle {
            messages: &entries,
        })
        .context(error::EncodeStateSnafu)
    }
}
