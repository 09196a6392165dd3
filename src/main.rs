use agentcore::cli::{Arguments, Command};
use agentcore::config::Config;
use agentcore::controller::{BootFlags, DeviceController};
use agentcore::error::{self, Result};
use agentcore::kvstore::{FileKeyValueStore, KeyValueStore};
use agentcore::model::STATE_KEY;
use agentcore::runner;
use async_trait::async_trait;
use simplelog::{Config as LogConfig, TermLogger, TerminalMode};
use snafu::ResultExt;
use std::io;
use std::process;
use std::sync::Arc;

/// Placeholder `BootFlags` backing the production `DeviceController`. The
/// real bootloader/partition mechanism is a named non-goal; this stands in
/// for it so the rest of the state machine has something to drive.
struct NoopBootFlags;

#[async_trait]
impl BootFlags for NoopBootFlags {
    async fn has_upgrade(&self) -> io::Result<bool> {
        Ok(false)
    }

    async fn current_artifact_name(&self) -> String {
        std::env::var("AGENTCORE_ARTIFACT_NAME").unwrap_or_else(|_| "unknown".to_string())
    }

    async fn commit(&self) -> io::Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> io::Result<()> {
        Ok(())
    }

    async fn reboot(&self) -> io::Result<()> {
        Ok(())
    }
}

fn main() -> ! {
    let arguments: Arguments = argh::from_env();
    let runtime = tokio::runtime::Runtime::new().expect("unable to start tokio runtime");
    process::exit(match runtime.block_on(main_inner(arguments)) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{}", err);
            1
        }
    })
}

async fn main_inner(arguments: Arguments) -> Result<()> {
    // TerminalMode::Mixed sends errors to stderr and anything less to stdout.
    TermLogger::init(arguments.log_level, LogConfig::default(), TerminalMode::Mixed)
        .context(error::LoggerSnafu)?;

    let config = match &arguments.config {
        None => Config::new()?,
        Some(path) => Config::from_file(path)?,
    };

    let store = FileKeyValueStore::new(config.state_store_path.clone())?;

    match arguments.command {
        Command::Version(_) => {
            println!("agentcore {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::ShowState(_) => {
            show_state(&store)?;
            Ok(())
        }
        Command::Run(_) => {
            let controller = DeviceController::new(
                config.server_url.clone(),
                Arc::new(NoopBootFlags),
                config.update_poll_interval(),
                config.inventory_poll_interval(),
                config.retry_poll_interval(),
            );
            let reached_final = runner::run(&store, &controller, config.deployment_log_dir.clone()).await;
            if !reached_final {
                log::info!("runner exited early on shutdown request");
            }
            Ok(())
        }
    }
}

fn show_state(store: &dyn KeyValueStore) -> Result<()> {
    match store.read_all(STATE_KEY) {
        Ok(bytes) => {
            let record = agentcore::codec::decode(&bytes)?;
            println!("{:#?}", record);
            Ok(())
        }
        Err(error::Error::NotFound { .. }) => {
            println!("no checkpoint record present");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
