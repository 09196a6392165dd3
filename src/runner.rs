//! Runner Loop (C8): drives the state machine from `Init` to `Final`,
//! interleaving `State::handle` with a `tokio::select!` against SIGTERM so a
//! blocked wait state exits promptly on shutdown, the same shape the pack's
//! own OTA daemon example uses for its periodic-check-versus-ctrl_c loop.

use crate::controller::Controller;
use crate::kvstore::KeyValueStore;
use crate::model::RunContext;
use crate::state::State;
use crate::waiter::{CancellableWaiter, LatchWaiter};
use log::{info, warn};
use std::sync::Arc;

/// Runs the state machine to completion (`Final`) or until SIGTERM/SIGINT
/// requests shutdown, whichever comes first. Returns whether the machine
/// reached `Final` on its own rather than being interrupted.
pub async fn run(
    store: &dyn KeyValueStore,
    controller: &dyn Controller,
    deploy_log_dir: std::path::PathBuf,
) -> bool {
    let waiter = Arc::new(LatchWaiter::new());
    spawn_signal_handlers(Arc::clone(&waiter));

    let mut ctx = RunContext {
        deploy_log_dir,
        ..RunContext::new()
    };
    let mut state = State::Init;

    loop {
        if state.is_final() {
            info!("reached final state, exiting");
            return true;
        }
        let tag = state.tag();
        let (next, interrupted) = state.handle(&mut ctx, store, controller, waiter.as_ref()).await;
        if interrupted {
            info!("shutdown requested while waiting in '{}', exiting", tag);
            return false;
        }
        state = next;
    }
}

fn spawn_signal_handlers(waiter: Arc<dyn CancellableWaiter>) {
    let term_waiter = Arc::clone(&waiter);
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("received SIGTERM, requesting shutdown");
                term_waiter.stop();
            }
            Err(e) => warn!("failed to install SIGTERM handler: {}", e),
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, requesting shutdown");
            waiter.stop();
        }
    });
}
