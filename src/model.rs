//! The data shapes the state machine reads, writes, and persists: update
//! descriptors, the state tag enum, reported status, and the checkpoint
//! record those are bundled into.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a deployment the server has assigned to this device. Immutable
/// once received; compared for equality against the running artifact name
/// after reboot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UpdateDescriptor {
    pub deployment_id: String,
    pub artifact_name: String,
}

/// Every state the machine can occupy. The string form is part of the
/// on-disk compatibility surface and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateId {
    Init,
    AuthorizeWait,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    UpdateFetch,
    FetchInstallRetry,
    UpdateInstall,
    UpdateVerify,
    UpdateCommit,
    UpdateStatusReport,
    ReportStatusError,
    Reboot,
    Rollback,
    Error,
    UpdateError,
    Final,
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = serde_plain::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&tag)
    }
}

/// Progress reported to the deployment server for a given update descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReportedStatus {
    Downloading,
    Installing,
    Rebooting,
    Success,
    Failure,
    AlreadyInstalled,
}

/// The crash-consistent snapshot the agent leaves on disk between reboots.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateData {
    pub version: u32,
    pub name: StateId,
    pub update: Option<UpdateDescriptor>,
    pub status: Option<ReportedStatus>,
}

impl StateData {
    /// Bumped whenever the on-disk shape of this record changes in a way
    /// that is not backward compatible. Readers reject anything else.
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(name: StateId, update: Option<UpdateDescriptor>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            name,
            update,
            status: None,
        }
    }

    pub fn with_status(mut self, status: ReportedStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// The key the checkpoint record is stored under in the key-value store.
pub const STATE_KEY: &str = "state";

/// Ephemeral per-run bookkeeping: poll timestamps that drive the
/// wait-until-next-poll computation in `CheckWait`, the directory new
/// per-deployment log managers are rooted in, and the log manager for
/// whichever deployment is currently in flight (created on entry to
/// `UpdateFetch`, dropped once that deployment terminates).
#[derive(Debug, Default)]
pub struct RunContext {
    pub last_update_check: Option<DateTime<Utc>>,
    pub last_inventory_refresh: Option<DateTime<Utc>>,
    pub deploy_log_dir: std::path::PathBuf,
    pub deploy_log: Option<std::sync::Arc<crate::deploy_log::DeploymentLogManager>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }
}
