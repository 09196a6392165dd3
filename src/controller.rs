//! Controller Façade (C6): the single capability interface the state
//! machine drives device operations, server calls, and configuration
//! through. Mirrors spec.md §6 one-for-one. Kept as one broad trait (per
//! SPEC_FULL.md's Design Note) rather than split into narrower capability
//! sets, so a single `FakeController` can script every test scenario.

use crate::error::{AgentError, Error};
use crate::model::{ReportedStatus, UpdateDescriptor};
use async_trait::async_trait;
use futures::StreamExt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

pub type CResult<T> = std::result::Result<T, AgentError>;

/// The artifact byte stream handed off from `fetch_update` to
/// `install_update`. Owned by `UpdateInstall` after hand-off; closed on
/// every exit path by virtue of being dropped at the end of that state's
/// scope, success or failure.
pub type ArtifactStream = Pin<Box<dyn AsyncRead + Send + Unpin>>;

#[async_trait]
pub trait Controller: Send + Sync {
    async fn bootstrap(&self) -> CResult<()>;
    async fn authorize(&self) -> CResult<()>;
    async fn get_current_artifact_name(&self) -> String;
    async fn has_upgrade(&self) -> CResult<bool>;

    fn get_update_poll_interval(&self) -> Duration;
    fn get_inventory_poll_interval(&self) -> Duration;
    fn get_retry_poll_interval(&self) -> Duration;

    async fn check_update(&self) -> CResult<Option<UpdateDescriptor>>;
    async fn fetch_update(&self, url: &str) -> CResult<(ArtifactStream, u64)>;
    async fn install_update(&self, stream: ArtifactStream, size: u64) -> CResult<()>;
    async fn commit_update(&self) -> CResult<()>;
    async fn rollback(&self) -> CResult<()>;
    async fn reboot(&self) -> CResult<()>;

    async fn report_update_status(
        &self,
        update: &UpdateDescriptor,
        status: ReportedStatus,
    ) -> CResult<()>;
    async fn upload_log(&self, update: &UpdateDescriptor, bytes: Vec<u8>) -> CResult<()>;
    async fn inventory_refresh(&self) -> CResult<()>;
}

/// Whether `check_update`'s error means "the server offered the artifact
/// already running on this device", distinct from an ordinary transient
/// failure. States match on this rather than string-sniffing, and recover
/// the offered descriptor to report against.
pub fn already_installed_update(err: &AgentError) -> Option<UpdateDescriptor> {
    match err.source.as_ref() {
        Error::AlreadyInstalled { update } => Some(update.clone()),
        _ => None,
    }
}

/// Whether a `report_update_status`/install/fetch error is the server
/// telling us to stop, rather than an ordinary fatal failure.
pub fn is_deployment_aborted(err: &AgentError) -> bool {
    err.severity.is_aborted()
}

/// `signpost`-shaped bootloader/partition abstraction: the interface survives
/// even though the real mechanism is a named non-goal (spec.md §1).
#[async_trait]
pub trait BootFlags: Send + Sync {
    /// Whether the bootloader activated the new partition set this boot.
    async fn has_upgrade(&self) -> io::Result<bool>;
    /// The artifact name running on the currently active partition.
    async fn current_artifact_name(&self) -> String;
    /// Clears the "try new partition" flag and marks it as the durable
    /// default, the commit half of partition activation.
    async fn commit(&self) -> io::Result<()>;
    /// Reactivates the prior partition set.
    async fn rollback(&self) -> io::Result<()>;
    /// Reboots the device. Does not return on success.
    async fn reboot(&self) -> io::Result<()>;
}

/// Production implementation composing an HTTP client for server calls and a
/// `BootFlags` handle for device operations, per SPEC_FULL.md's Controller
/// Façade module.
pub struct DeviceController {
    http: reqwest::Client,
    server_url: String,
    boot: Arc<dyn BootFlags>,
    update_poll_interval: Duration,
    inventory_poll_interval: Duration,
    retry_poll_interval: Duration,
}

impl DeviceController {
    pub fn new(
        server_url: impl Into<String>,
        boot: Arc<dyn BootFlags>,
        update_poll_interval: Duration,
        inventory_poll_interval: Duration,
        retry_poll_interval: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into(),
            boot,
            update_poll_interval,
            inventory_poll_interval,
            retry_poll_interval,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.server_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Controller for DeviceController {
    async fn bootstrap(&self) -> CResult<()> {
        // Device-identity setup has no server round trip of its own; the
        // boot-flags handle already reflects the running partition set.
        Ok(())
    }

    async fn authorize(&self) -> CResult<()> {
        self.http
            .get(self.endpoint("/v1/authorize"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|source| AgentError::transient(Error::Authorize { source }))
    }

    async fn get_current_artifact_name(&self) -> String {
        self.boot.current_artifact_name().await
    }

    async fn has_upgrade(&self) -> CResult<bool> {
        self.boot
            .has_upgrade()
            .await
            .map_err(|source| AgentError::fatal(Error::HasUpgrade { source }))
    }

    fn get_update_poll_interval(&self) -> Duration {
        self.update_poll_interval
    }

    fn get_inventory_poll_interval(&self) -> Duration {
        self.inventory_poll_interval
    }

    fn get_retry_poll_interval(&self) -> Duration {
        self.retry_poll_interval
    }

    async fn check_update(&self) -> CResult<Option<UpdateDescriptor>> {
        let response = self
            .http
            .get(self.endpoint("/v1/update"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| AgentError::transient(Error::CheckUpdate { source }))?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let update: UpdateDescriptor = response
            .json()
            .await
            .map_err(|source| AgentError::transient(Error::CheckUpdate { source }))?;

        if update.artifact_name == self.get_current_artifact_name().await {
            return Err(AgentError::transient(Error::AlreadyInstalled {
                update: update.clone(),
            }));
        }
        Ok(Some(update))
    }

    async fn fetch_update(&self, url: &str) -> CResult<(ArtifactStream, u64)> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|source| AgentError::transient(Error::FetchUpdate {
                url: url.to_string(),
                source,
            }))?;

        let size = response.content_length().unwrap_or(0);
        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        Ok((Box::pin(reader), size))
    }

    async fn install_update(&self, mut stream: ArtifactStream, size: u64) -> CResult<()> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::with_capacity(size as usize);
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|source| AgentError::fatal(Error::InstallUpdate { source }))?;
        // The block-device write itself is an external collaborator (§1
        // non-goal); this confirms the stream was fully drained and closes
        // it by dropping `stream` at the end of scope.
        Ok(())
    }

    async fn commit_update(&self) -> CResult<()> {
        self.boot
            .commit()
            .await
            .map_err(|source| AgentError::fatal(Error::CommitUpdate { source }))
    }

    async fn rollback(&self) -> CResult<()> {
        self.boot
            .rollback()
            .await
            .map_err(|source| AgentError::fatal(Error::Rollback { source }))
    }

    async fn reboot(&self) -> CResult<()> {
        self.boot
            .reboot()
            .await
            .map_err(|source| AgentError::fatal(Error::Reboot { source }))
    }

    async fn report_update_status(
        &self,
        update: &UpdateDescriptor,
        status: ReportedStatus,
    ) -> CResult<()> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            deployment_id: &'a str,
            status: ReportedStatus,
        }
        let response = self
            .http
            .put(self.endpoint("/v1/status"))
            .json(&Body {
                deployment_id: &update.deployment_id,
                status,
            })
            .send()
            .await
            .map_err(|source| AgentError::transient(Error::ReportStatus { source }))?;

        if response.status() == reqwest::StatusCode::CONFLICT {
            return Err(AgentError::aborted(Error::ReportStatus {
                source: response
                    .error_for_status()
                    .expect_err("409 response must carry an error status"),
            }));
        }
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|source| AgentError::transient(Error::ReportStatus { source }))
    }

    async fn upload_log(&self, update: &UpdateDescriptor, bytes: Vec<u8>) -> CResult<()> {
        self.http
            .post(self.endpoint(&format!("/v1/deployments/{}/log", update.deployment_id)))
            .body(bytes)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|source| AgentError::transient(Error::UploadLog { source }))
    }

    async fn inventory_refresh(&self) -> CResult<()> {
        self.http
            .post(self.endpoint("/v1/inventory"))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map(|_| ())
            .map_err(|source| AgentError::transient(Error::InventoryRefresh { source }))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records every call the state machine makes and returns scripted
    /// responses in order, the way the pack's fakes substitute all methods
    /// of a capability interface instead of mocking individual calls.
    #[derive(Default)]
    pub struct FakeController {
        pub bootstrap: Mutex<Vec<CResult<()>>>,
        pub authorize: Mutex<Vec<CResult<()>>>,
        pub current_artifact_name: Mutex<String>,
        pub has_upgrade: Mutex<Vec<CResult<bool>>>,
        pub update_poll_interval: Duration,
        pub inventory_poll_interval: Duration,
        pub retry_poll_interval: Duration,
        pub check_update: Mutex<Vec<CResult<Option<UpdateDescriptor>>>>,
        pub fetch_update: Mutex<Vec<CResult<Vec<u8>>>>,
        pub install_update: Mutex<Vec<CResult<()>>>,
        pub commit_update: Mutex<Vec<CResult<()>>>,
        pub rollback: Mutex<Vec<CResult<()>>>,
        pub reboot: Mutex<Vec<CResult<()>>>,
        pub report_update_status: Mutex<Vec<CResult<()>>>,
        pub upload_log: Mutex<Vec<CResult<()>>>,
        pub inventory_refresh: Mutex<Vec<CResult<()>>>,
        pub reported_statuses: Mutex<Vec<(UpdateDescriptor, ReportedStatus)>>,
        pub fetch_urls: Mutex<Vec<String>>,
    }

    impl FakeController {
        pub fn new() -> Self {
            Self::default()
        }

        fn pop<T>(queue: &Mutex<Vec<CResult<T>>>) -> CResult<T> {
            let mut guard = queue.lock().expect("fake controller lock poisoned");
            if guard.is_empty() {
                panic!("FakeController: no scripted response left for this call");
            }
            guard.remove(0)
        }
    }

    #[async_trait]
    impl Controller for FakeController {
        async fn bootstrap(&self) -> CResult<()> {
            Self::pop(&self.bootstrap)
        }

        async fn authorize(&self) -> CResult<()> {
            Self::pop(&self.authorize)
        }

        async fn get_current_artifact_name(&self) -> String {
            self.current_artifact_name
                .lock()
                .expect("fake controller lock poisoned")
                .clone()
        }

        async fn has_upgrade(&self) -> CResult<bool> {
            Self::pop(&self.has_upgrade)
        }

        fn get_update_poll_interval(&self) -> Duration {
            self.update_poll_interval
        }

        fn get_inventory_poll_interval(&self) -> Duration {
            self.inventory_poll_interval
        }

        fn get_retry_poll_interval(&self) -> Duration {
            self.retry_poll_interval
        }

        async fn check_update(&self) -> CResult<Option<UpdateDescriptor>> {
            Self::pop(&self.check_update)
        }

        async fn fetch_update(&self, url: &str) -> CResult<(ArtifactStream, u64)> {
            self.fetch_urls
                .lock()
                .expect("fake controller lock poisoned")
                .push(url.to_string());
            let bytes = Self::pop(&self.fetch_update)?;
            let size = bytes.len() as u64;
            let chunk: io::Result<bytes::Bytes> = Ok(bytes::Bytes::from(bytes));
            let byte_stream = futures::stream::once(async { chunk });
            let reader = tokio_util::io::StreamReader::new(byte_stream);
            Ok((Box::pin(reader), size))
        }

        async fn install_update(&self, _stream: ArtifactStream, _size: u64) -> CResult<()> {
            Self::pop(&self.install_update)
        }

        async fn commit_update(&self) -> CResult<()> {
            Self::pop(&self.commit_update)
        }

        async fn rollback(&self) -> CResult<()> {
            Self::pop(&self.rollback)
        }

        async fn reboot(&self) -> CResult<()> {
            Self::pop(&self.reboot)
        }

        async fn report_update_status(
            &self,
            update: &UpdateDescriptor,
            status: ReportedStatus,
        ) -> CResult<()> {
            self.reported_statuses
                .lock()
                .expect("fake controller lock poisoned")
                .push((update.clone(), status));
            Self::pop(&self.report_update_status)
        }

        async fn upload_log(&self, _update: &UpdateDescriptor, _bytes: Vec<u8>) -> CResult<()> {
            Self::pop(&self.upload_log)
        }

        async fn inventory_refresh(&self) -> CResult<()> {
            Self::pop(&self.inventory_refresh)
        }
    }
}
