use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{crate_description, crate_version, Parser};
use tracing_subscriber::EnvFilter;

use crate::{
    external::{
        command::{CommandRebalancer, CommandSupervisor},
        local::{DirectoryCertificateAuthority, DirectorySecretStore},
    },
    kafka_controller::{Controller, Ctx, FULL_CONTROLLER_NAME},
    model::{listener, APP_NAME},
    operator_config::{ControllerInputs, OperatorConfig},
    store::DirectoryStore,
};

mod config;
mod credentials;
mod discovery;
mod external;
mod kafka_controller;
mod model;
mod operations;
mod operator_config;
mod peer_directory;
mod product_logging;
mod reconcile;
mod rolling_lock;
mod store;

mod built_info {
    // The file has been placed there by the build script.
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

const LOG_ENV_VAR: &str = "KAFKA_RECONCILER_LOG";

#[derive(clap::Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Reconcile the local member until interrupted.
    Run {
        /// Path of the operator configuration file.
        #[clap(long, env = "KAFKA_RECONCILER_CONFIG")]
        config: PathBuf,
    },
    /// Print the listeners the given inputs resolve to.
    ResolveListeners {
        #[clap(long)]
        inputs: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Run { config } => {
            initialize_logging();
            tracing::info!(
                description = crate_description!(),
                version = crate_version!(),
                git_version = ?built_info::GIT_VERSION,
                target = built_info::TARGET,
                built = built_info::BUILT_TIME_UTC,
                rustc = built_info::RUSTC_VERSION,
                "starting {APP_NAME} reconciler"
            );

            let config = OperatorConfig::from_file(&config)
                .with_context(|| format!("failed to load {}", config.display()))?;
            let controller = create_controller(config)?;
            controller
                .run(async {
                    if let Err(error) = tokio::signal::ctrl_c().await {
                        tracing::error!(error = %error, "failed to listen for shutdown signal");
                    }
                })
                .await;
        }
        Command::ResolveListeners { inputs } => {
            let inputs = ControllerInputs::from_file(&inputs)?;
            let listeners = listener::resolve(inputs.relations());
            print!("{}", serde_yaml::to_string(&listeners)?);
        }
    }

    Ok(())
}

fn initialize_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn create_controller(config: OperatorConfig) -> anyhow::Result<Controller> {
    let directories = config.directories.clone();
    let store = DirectoryStore::new(&directories.store)?;
    let supervisor = CommandSupervisor::new(config.commands.clone(), directories.config.clone());
    let rebalancer = CommandRebalancer::new(config.commands.rebalancer.clone());

    let ctx = Ctx::new(
        config,
        Arc::new(store),
        Arc::new(DirectorySecretStore::new(directories.secrets())),
        Arc::new(DirectoryCertificateAuthority::new(directories.certificates())),
        Arc::new(supervisor),
        Arc::new(rebalancer),
    );
    let controller = Controller::new(Arc::new(ctx))?;
    tracing::info!(controller = FULL_CONTROLLER_NAME, "controller created");
    Ok(controller)
}
