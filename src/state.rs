//! State Set & Transition Rules (C7): the states themselves and the Handle
//! contract that drives the machine from one to the next. Modeled as a
//! tagged enum per SPEC_FULL.md's Design Note — no inheritance, no
//! back-pointers. `FetchInstallRetry` carries the update descriptor and
//! attempt count directly rather than pointing back at `UpdateFetch`.

use crate::codec;
use crate::controller::{already_installed_update, is_deployment_aborted, ArtifactStream, Controller};
use crate::deploy_log::{DeploymentLogManager, LogLevel};
use crate::error::{AgentError, Error};
use crate::kvstore::KeyValueStore;
use crate::model::{ReportedStatus, RunContext, StateData, StateId, UpdateDescriptor, STATE_KEY};
use crate::retry::{self, RetryDecision};
use crate::waiter::{state_after_wait, CancellableWaiter};
use chrono::Utc;
use log::{error, warn};
use std::sync::Arc;
use std::time::Duration;

/// Every state the machine can occupy, carrying exactly the data its
/// transition needs.
pub enum State {
    Init,
    Bootstrapped,
    AuthorizeWait,
    Authorized,
    InventoryUpdate,
    CheckWait,
    UpdateCheck,
    UpdateFetch {
        update: UpdateDescriptor,
        attempt: u32,
    },
    UpdateInstall {
        update: UpdateDescriptor,
        stream: ArtifactStream,
        size: u64,
        attempt: u32,
    },
    FetchInstallRetry {
        update: UpdateDescriptor,
        attempt: u32,
    },
    Reboot(UpdateDescriptor),
    UpdateVerify(UpdateDescriptor),
    UpdateCommit(UpdateDescriptor),
    Rollback(UpdateDescriptor),
    UpdateStatusReport {
        update: UpdateDescriptor,
        status: ReportedStatus,
        attempt: u32,
    },
    ReportErrorState {
        update: UpdateDescriptor,
        status: ReportedStatus,
    },
    ErrorState(Option<AgentError>),
    UpdateError {
        cause: Option<AgentError>,
        update: Option<UpdateDescriptor>,
    },
    Final,
}

impl State {
    /// The persisted/logged tag for this state. Doubles as the value used
    /// for `StateData::name` when checkpointing.
    pub fn tag(&self) -> StateId {
        match self {
            State::Init => StateId::Init,
            State::Bootstrapped => StateId::Init,
            State::AuthorizeWait => StateId::AuthorizeWait,
            State::Authorized => StateId::Init,
            State::InventoryUpdate => StateId::InventoryUpdate,
            State::CheckWait => StateId::CheckWait,
            State::UpdateCheck => StateId::UpdateCheck,
            State::UpdateFetch { .. } => StateId::UpdateFetch,
            State::UpdateInstall { .. } => StateId::UpdateInstall,
            State::FetchInstallRetry { .. } => StateId::FetchInstallRetry,
            State::Reboot(_) => StateId::Reboot,
            State::UpdateVerify(_) => StateId::UpdateVerify,
            State::UpdateCommit(_) => StateId::UpdateCommit,
            State::Rollback(_) => StateId::Rollback,
            State::UpdateStatusReport { .. } => StateId::UpdateStatusReport,
            State::ReportErrorState { .. } => StateId::ReportStatusError,
            State::ErrorState(_) => StateId::Error,
            State::UpdateError { .. } => StateId::UpdateError,
            State::Final => StateId::Final,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, State::Final)
    }

    /// Executes this state's work and returns the successor state along
    /// with whether the state exited because of cancellation rather than
    /// natural completion.
    pub async fn handle(
        self,
        ctx: &mut RunContext,
        store: &dyn KeyValueStore,
        controller: &dyn Controller,
        waiter: &dyn CancellableWaiter,
    ) -> (State, bool) {
        match self {
            State::Init => handle_init(controller).await,
            State::Bootstrapped => handle_bootstrapped(controller).await,
            State::AuthorizeWait => {
                state_after_wait(
                    waiter,
                    State::Bootstrapped,
                    State::AuthorizeWait,
                    controller.get_retry_poll_interval(),
                )
                .await
            }
            State::Authorized => handle_authorized(store).await,
            State::InventoryUpdate => handle_inventory_update(ctx, controller).await,
            State::CheckWait => handle_check_wait(ctx, controller, waiter).await,
            State::UpdateCheck => handle_update_check(ctx, controller).await,
            State::UpdateFetch { update, attempt } => {
                handle_update_fetch(ctx, store, controller, update, attempt).await
            }
            State::UpdateInstall {
                update,
                stream,
                size,
                attempt,
            } => handle_update_install(store, controller, update, attempt, stream, size).await,
            State::FetchInstallRetry { update, attempt } => {
                handle_fetch_install_retry(controller, waiter, update, attempt).await
            }
            State::Reboot(update) => handle_reboot(store, controller, update).await,
            State::UpdateVerify(update) => handle_update_verify(controller, update).await,
            State::UpdateCommit(update) => handle_update_commit(controller, update).await,
            State::Rollback(update) => handle_rollback(controller, update).await,
            State::UpdateStatusReport {
                update,
                status,
                attempt,
            } => handle_update_status_report(ctx, store, controller, waiter, update, status, attempt).await,
            State::ReportErrorState { update, status } => {
                handle_report_error_state(ctx, store, update, status).await
            }
            State::ErrorState(cause) => handle_error_state(cause),
            State::UpdateError { cause, update } => handle_update_error(cause, update),
            State::Final => panic!("Handle called on the Final state"),
        }
    }
}

async fn handle_init(controller: &dyn Controller) -> (State, bool) {
    match controller.bootstrap().await {
        Ok(()) => (State::Bootstrapped, false),
        Err(e) => (State::ErrorState(Some(e)), false),
    }
}

async fn handle_bootstrapped(controller: &dyn Controller) -> (State, bool) {
    match controller.authorize().await {
        Ok(()) => (State::Authorized, false),
        Err(e) if e.severity.is_transient() => (State::AuthorizeWait, false),
        Err(e) => (State::ErrorState(Some(e)), false),
    }
}

async fn handle_authorized(store: &dyn KeyValueStore) -> (State, bool) {
    let record = match store.read_all(STATE_KEY) {
        Err(crate::error::Error::NotFound { .. }) => return (State::InventoryUpdate, false),
        Err(e) => {
            error!("failed to read checkpoint record: {}", e);
            return (
                State::UpdateError {
                    cause: None,
                    update: None,
                },
                false,
            );
        }
        Ok(bytes) => match codec::decode(&bytes) {
            Ok(record) => record,
            Err(e) => {
                error!("checkpoint record failed validation: {}", e);
                return (
                    State::UpdateError {
                        cause: None,
                        update: None,
                    },
                    false,
                );
            }
        },
    };

    let corrupt = || {
        warn!("{}", Error::CorruptCheckpoint);
        (
            State::UpdateError {
                cause: None,
                update: None,
            },
            false,
        )
    };

    match record.name {
        StateId::UpdateStatusReport => match record.update {
            Some(update) => (
                State::UpdateStatusReport {
                    update,
                    status: record.status.unwrap_or(ReportedStatus::Failure),
                    attempt: 0,
                },
                false,
            ),
            None => corrupt(),
        },
        StateId::Reboot | StateId::UpdateVerify => match record.update {
            Some(update) => (State::UpdateVerify(update), false),
            None => corrupt(),
        },
        StateId::UpdateFetch | StateId::UpdateInstall => match record.update {
            // The update was interrupted before reboot: treat as failed.
            Some(update) => (
                State::UpdateError {
                    cause: None,
                    update: Some(update),
                },
                false,
            ),
            None => corrupt(),
        },
        _ => corrupt(),
    }
}

async fn handle_inventory_update(ctx: &mut RunContext, controller: &dyn Controller) -> (State, bool) {
    if let Err(e) = controller.inventory_refresh().await {
        warn!("inventory refresh failed (non-fatal): {}", e);
    }
    ctx.last_inventory_refresh = Some(Utc::now());
    (State::CheckWait, false)
}

fn duration_until(
    last: Option<chrono::DateTime<Utc>>,
    poll_interval: Duration,
    now: chrono::DateTime<Utc>,
) -> Duration {
    match last {
        None => Duration::ZERO,
        Some(last) => {
            let elapsed = now
                .signed_duration_since(last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            poll_interval.saturating_sub(elapsed)
        }
    }
}

async fn handle_check_wait(
    ctx: &mut RunContext,
    controller: &dyn Controller,
    waiter: &dyn CancellableWaiter,
) -> (State, bool) {
    let now = Utc::now();
    let update_due = duration_until(ctx.last_update_check, controller.get_update_poll_interval(), now);
    let inventory_due = duration_until(
        ctx.last_inventory_refresh,
        controller.get_inventory_poll_interval(),
        now,
    );
    // Wait until the sooner of the two deadlines, then take that action.
    let wait_for = update_due.min(inventory_due);
    let inventory_first = inventory_due <= update_due;
    let next = if inventory_first {
        State::InventoryUpdate
    } else {
        State::UpdateCheck
    };
    state_after_wait(waiter, next, State::CheckWait, wait_for).await
}

async fn handle_update_check(ctx: &mut RunContext, controller: &dyn Controller) -> (State, bool) {
    ctx.last_update_check = Some(Utc::now());
    match controller.check_update().await {
        Ok(None) => (State::CheckWait, false),
        Ok(Some(update)) => (State::UpdateFetch { update, attempt: 0 }, false),
        Err(e) => {
            if let Some(update) = already_installed_update(&e) {
                (
                    State::UpdateStatusReport {
                        update,
                        status: ReportedStatus::AlreadyInstalled,
                        attempt: 0,
                    },
                    false,
                )
            } else {
                (State::ErrorState(Some(e)), false)
            }
        }
    }
}

fn checkpoint(store: &dyn KeyValueStore, data: &StateData) -> crate::error::Result<()> {
    let bytes = codec::encode(data)?;
    store.write_all(STATE_KEY, &bytes)
}

fn clear_checkpoint(store: &dyn KeyValueStore) {
    if let Err(e) = store.remove(STATE_KEY) {
        warn!("failed to clear checkpoint record: {}", e);
    }
}

async fn handle_update_fetch(
    ctx: &mut RunContext,
    store: &dyn KeyValueStore,
    controller: &dyn Controller,
    update: UpdateDescriptor,
    attempt: u32,
) -> (State, bool) {
    let record = StateData::new(StateId::UpdateFetch, Some(update.clone()));
    if let Err(e) = checkpoint(store, &record) {
        return (
            State::UpdateError {
                cause: Some(AgentError::fatal(e)),
                update: Some(update),
            },
            false,
        );
    }

    ctx.deploy_log = Some(Arc::new(DeploymentLogManager::new(
        ctx.deploy_log_dir.clone(),
        update.deployment_id.clone(),
    )));

    if let Err(e) = controller
        .report_update_status(&update, ReportedStatus::Downloading)
        .await
    {
        if is_deployment_aborted(&e) {
            return (
                State::UpdateError {
                    cause: None,
                    update: Some(update),
                },
                false,
            );
        }
        // A progress ping is best-effort; the deployment still proceeds.
        warn!("failed to report 'downloading' status: {}", e);
    }

    // The Controller façade's `url` parameter is an opaque locator it
    // resolves itself; the deployment id is what we have to hand it.
    match controller.fetch_update(&update.deployment_id).await {
        Ok((stream, size)) => (
            State::UpdateInstall {
                update,
                stream,
                size,
                attempt,
            },
            false,
        ),
        Err(e) => {
            if is_deployment_aborted(&e) {
                (
                    State::UpdateError {
                        cause: None,
                        update: Some(update),
                    },
                    false,
                )
            } else {
                if let Some(log) = &ctx.deploy_log {
                    log.record(LogLevel::Error, format!("fetch failed: {}", e));
                }
                (
                    State::FetchInstallRetry {
                        update,
                        attempt: attempt + 1,
                    },
                    false,
                )
            }
        }
    }
}

async fn handle_update_install(
    store: &dyn KeyValueStore,
    controller: &dyn Controller,
    update: UpdateDescriptor,
    attempt: u32,
    stream: ArtifactStream,
    size: u64,
) -> (State, bool) {
    let record = StateData::new(StateId::UpdateInstall, Some(update.clone()));
    if let Err(e) = checkpoint(store, &record) {
        return (
            State::UpdateError {
                cause: Some(AgentError::fatal(e)),
                update: Some(update),
            },
            false,
        );
    }

    if let Err(e) = controller
        .report_update_status(&update, ReportedStatus::Installing)
        .await
    {
        if is_deployment_aborted(&e) {
            return (
                State::UpdateError {
                    cause: None,
                    update: Some(update),
                },
                false,
            );
        }
        warn!("failed to report 'installing' status: {}", e);
    }

    match controller.install_update(stream, size).await {
        Ok(()) => (State::Reboot(update), false),
        Err(e) => {
            if is_deployment_aborted(&e) {
                (
                    State::UpdateError {
                        cause: None,
                        update: Some(update),
                    },
                    false,
                )
            } else {
                (
                    State::FetchInstallRetry {
                        update,
                        attempt: attempt + 1,
                    },
                    false,
                )
            }
        }
    }
}

async fn handle_fetch_install_retry(
    controller: &dyn Controller,
    waiter: &dyn CancellableWaiter,
    update: UpdateDescriptor,
    attempt: u32,
) -> (State, bool) {
    match retry::fetch_install_retry(attempt, controller.get_update_poll_interval()) {
        RetryDecision::Wait(interval) => {
            state_after_wait(
                waiter,
                State::UpdateFetch {
                    update: update.clone(),
                    attempt,
                },
                State::FetchInstallRetry { update, attempt },
                interval,
            )
            .await
        }
        RetryDecision::Exhausted => (
            State::ErrorState(Some(AgentError::transient(Error::RetriesExhausted {
                attempts: attempt,
            }))),
            false,
        ),
    }
}

async fn handle_reboot(
    store: &dyn KeyValueStore,
    controller: &dyn Controller,
    update: UpdateDescriptor,
) -> (State, bool) {
    let record = StateData::new(StateId::Reboot, Some(update.clone()));
    if let Err(e) = checkpoint(store, &record) {
        // Tolerated: the device will reboot either way, and replay on next
        // boot handles the gap.
        warn!("failed to checkpoint before reboot: {}", e);
    }

    if let Err(e) = controller
        .report_update_status(&update, ReportedStatus::Rebooting)
        .await
    {
        if is_deployment_aborted(&e) {
            return (
                State::UpdateError {
                    cause: None,
                    update: Some(update),
                },
                false,
            );
        }
        warn!("failed to report 'rebooting' status: {}", e);
    }

    match controller.reboot().await {
        Ok(()) => (State::Final, false),
        Err(e) => (State::ErrorState(Some(e)), false),
    }
}

async fn handle_update_verify(controller: &dyn Controller, update: UpdateDescriptor) -> (State, bool) {
    match controller.has_upgrade().await {
        Err(e) => (
            State::UpdateError {
                cause: Some(e),
                update: Some(update),
            },
            false,
        ),
        Ok(false) => (
            State::UpdateStatusReport {
                update,
                status: ReportedStatus::Failure,
                attempt: 0,
            },
            false,
        ),
        Ok(true) => {
            let current = controller.get_current_artifact_name().await;
            if current == update.artifact_name {
                (State::UpdateCommit(update), false)
            } else {
                // Open question (spec.md §9): the source reboots again
                // rather than rolling back immediately on a post-reboot
                // artifact mismatch. Preserved as documented behavior; see
                // DESIGN.md.
                (State::Reboot(update), false)
            }
        }
    }
}

async fn handle_update_commit(controller: &dyn Controller, update: UpdateDescriptor) -> (State, bool) {
    match controller.commit_update().await {
        Ok(()) => (
            State::UpdateStatusReport {
                update,
                status: ReportedStatus::Success,
                attempt: 0,
            },
            false,
        ),
        Err(_) => (State::Rollback(update), false),
    }
}

async fn handle_rollback(controller: &dyn Controller, update: UpdateDescriptor) -> (State, bool) {
    match controller.rollback().await {
        Ok(()) => (State::Final, false),
        Err(e) => (State::ErrorState(Some(e)), false),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_update_status_report(
    ctx: &mut RunContext,
    store: &dyn KeyValueStore,
    controller: &dyn Controller,
    waiter: &dyn CancellableWaiter,
    update: UpdateDescriptor,
    status: ReportedStatus,
    attempt: u32,
) -> (State, bool) {
    if attempt == 0 {
        let record = StateData::new(StateId::UpdateStatusReport, Some(update.clone())).with_status(status);
        if let Err(e) = checkpoint(store, &record) {
            return (
                State::UpdateError {
                    cause: Some(AgentError::fatal(e)),
                    update: Some(update),
                },
                false,
            );
        }
    }

    if status == ReportedStatus::Failure {
        if let Some(log) = ctx.deploy_log.clone() {
            match log.bundle() {
                Ok(bytes) => {
                    if let Err(e) = controller.upload_log(&update, bytes).await {
                        warn!("failed to upload deployment log: {}", e);
                    }
                }
                Err(e) => warn!("failed to bundle deployment log: {}", e),
            }
        }
    }

    match controller.report_update_status(&update, status).await {
        Ok(()) => {
            clear_checkpoint(store);
            ctx.deploy_log = None;
            (State::Init, false)
        }
        Err(e) if is_deployment_aborted(&e) => {
            (State::ReportErrorState { update, status }, false)
        }
        Err(e) => {
            warn!("failed to report status {:?}: {}", status, e);
            let made = attempt + 1;
            let max_attempts =
                retry::max_sending_attempts(controller.get_update_poll_interval(), controller.get_retry_poll_interval());
            if made >= max_attempts {
                (State::ReportErrorState { update, status }, false)
            } else {
                state_after_wait(
                    waiter,
                    State::UpdateStatusReport {
                        update: update.clone(),
                        status,
                        attempt: made,
                    },
                    State::UpdateStatusReport {
                        update,
                        status,
                        attempt,
                    },
                    controller.get_retry_poll_interval(),
                )
                .await
            }
        }
    }
}

async fn handle_report_error_state(
    ctx: &mut RunContext,
    store: &dyn KeyValueStore,
    update: UpdateDescriptor,
    status: ReportedStatus,
) -> (State, bool) {
    match status {
        ReportedStatus::Success => (State::Rollback(update), false),
        ReportedStatus::Failure | ReportedStatus::AlreadyInstalled => {
            clear_checkpoint(store);
            ctx.deploy_log = None;
            (State::Init, false)
        }
        // Only success/failure/already-installed are ever carried here; any
        // other status means an earlier state built this variant wrong.
        _ => {
            clear_checkpoint(store);
            ctx.deploy_log = None;
            (State::Init, false)
        }
    }
}

fn handle_error_state(cause: Option<AgentError>) -> (State, bool) {
    match cause {
        None => (State::Final, false),
        Some(_) => (State::Init, false),
    }
}

fn handle_update_error(
    cause: Option<AgentError>,
    update: Option<UpdateDescriptor>,
) -> (State, bool) {
    match update {
        Some(update) => (
            State::UpdateStatusReport {
                update,
                status: ReportedStatus::Failure,
                attempt: 0,
            },
            false,
        ),
        // No descriptor in scope: there is no deployment to report against,
        // so this reduces to the general error path rather than a bogus
        // report (see DESIGN.md).
        None => (State::ErrorState(cause), false),
    }
}
