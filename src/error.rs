use crate::model::{StateId, UpdateDescriptor};
use snafu::Snafu;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

/// Distinguishes errors that are worth retrying from ones that are not.
///
/// `DeploymentAborted` is its own thing: the server said stop, but the device
/// itself may well be fine, so states route it differently from an ordinary
/// fatal error even though it is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Transient,
    Fatal,
    DeploymentAborted,
}

impl Severity {
    pub fn is_transient(self) -> bool {
        matches!(self, Severity::Transient)
    }

    pub fn is_aborted(self) -> bool {
        matches!(self, Severity::DeploymentAborted)
    }
}

/// An error carrying the severity the state machine needs to decide how to
/// route it, independent of what went wrong underneath.
#[derive(Debug, Snafu)]
#[snafu(display("{}", source))]
pub struct AgentError {
    pub severity: Severity,
    #[snafu(source(from(Error, Box::new)))]
    pub source: Box<Error>,
}

impl AgentError {
    pub fn transient(source: Error) -> Self {
        Self {
            severity: Severity::Transient,
            source: Box::new(source),
        }
    }

    pub fn fatal(source: Error) -> Self {
        Self {
            severity: Severity::Fatal,
            source: Box::new(source),
        }
    }

    pub fn aborted(source: Error) -> Self {
        Self {
            severity: Severity::DeploymentAborted,
            source: Box::new(source),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to create store directory '{}': {}", path.display(), source))]
    CreateStoreDir { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to create tempfile for writing '{}': {}", key, source))]
    CreateTempfile { key: String, source: std::io::Error },

    #[snafu(display("Failed to persist store file '{}': {}", path.display(), source))]
    PersistStoreFile {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("No value stored for key '{}'", key))]
    NotFound { key: String },

    #[snafu(display("Failed to read store key '{}': {}", key, source))]
    ReadStoreKey { key: String, source: std::io::Error },

    #[snafu(display("Failed to remove store key '{}': {}", key, source))]
    RemoveStoreKey { key: String, source: std::io::Error },

    #[snafu(display("Failed to serialize checkpoint record: {}", source))]
    EncodeState { source: serde_json::Error },

    #[snafu(display("Failed to deserialize checkpoint record: {}", source))]
    DecodeState { source: serde_json::Error },

    #[snafu(display(
        "Checkpoint record has version {} but this agent understands version {}",
        found,
        expected
    ))]
    StateVersionMismatch { found: u32, expected: u32 },

    #[snafu(display("Checkpoint record names state '{}' but is missing its update descriptor", name))]
    StateMissingUpdate { name: StateId },

    #[snafu(display("Failed to read config file '{}': {}", path.display(), source))]
    ConfigRead { path: PathBuf, source: std::io::Error },

    #[snafu(display("Failed to parse config file '{}': {}", path.display(), source))]
    ConfigParse { path: PathBuf, source: toml::de::Error },

    #[snafu(display("Failed to parse log level '{}'", value))]
    LogLevel { value: String },

    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("Bootstrap failed: {}", source))]
    Bootstrap { source: std::io::Error },

    #[snafu(display("Authorization failed: {}", source))]
    Authorize { source: reqwest::Error },

    #[snafu(display("Failed to check for updates: {}", source))]
    CheckUpdate { source: reqwest::Error },

    #[snafu(display("Server offered an update already installed on this device"))]
    AlreadyInstalled { update: UpdateDescriptor },

    #[snafu(display("Failed to fetch update artifact from '{}': {}", url, source))]
    FetchUpdate { url: String, source: reqwest::Error },

    #[snafu(display("Failed to install update: {}", source))]
    InstallUpdate { source: std::io::Error },

    #[snafu(display("Failed to commit update: {}", source))]
    CommitUpdate { source: std::io::Error },

    #[snafu(display("Failed to roll back update: {}", source))]
    Rollback { source: std::io::Error },

    #[snafu(display("Failed to reboot device: {}", source))]
    Reboot { source: std::io::Error },

    #[snafu(display("Failed to determine upgrade status: {}", source))]
    HasUpgrade { source: std::io::Error },

    #[snafu(display("Failed to report update status to server: {}", source))]
    ReportStatus { source: reqwest::Error },

    #[snafu(display("Failed to upload deployment log: {}", source))]
    UploadLog { source: reqwest::Error },

    #[snafu(display("Failed to refresh inventory: {}", source))]
    InventoryRefresh { source: reqwest::Error },

    #[snafu(display("Handle called on the Final state"))]
    HandleOnFinal,

    #[snafu(display("Fetch/install retry schedule exhausted after {} attempts", attempts))]
    RetriesExhausted { attempts: u32 },

    #[snafu(display("Checkpoint record is corrupt or missing required fields"))]
    CorruptCheckpoint,
}
