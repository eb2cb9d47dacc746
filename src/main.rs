use std::sync::Arc;

use capstan_common::config::AppConfig;
use capstan_control::backend::StandaloneBackend;
use capstan_control::error::{ClusterError, FatalErrorHandler};
use capstan_control::ha::StandaloneHaServices;
use capstan_control::manager::options::{
    ResourceManagerConfig, ResourceManagerOptions, ResourceManagerServices,
};
use capstan_control::slots::DefaultSlotManager;
use capstan_control::ResourceManagerRunner;
use clap::{Parser, Subcommand};
use log::{error, info};

#[derive(Parser)]
#[command(name = "capstan", version, about = "Capstan cluster resource manager")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cluster resource manager endpoint.
    Master {
        /// The host the RPC server listens on, overriding the configuration.
        #[arg(long)]
        host: Option<String>,
        /// The port the RPC server listens on, overriding the configuration.
        #[arg(long)]
        port: Option<u16>,
    },
}

/// Terminates the process on a fatal error so that an external supervisor
/// can restart the resource manager with a clean slate.
struct ExitFatalErrorHandler;

impl FatalErrorHandler for ExitFatalErrorHandler {
    fn on_fatal_error(&self, error: &ClusterError) {
        error!("terminating the process after a fatal error: {error}");
        std::process::exit(70);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    match cli.command {
        Command::Master { host, port } => run_master(host, port),
    }
}

fn run_master(host: Option<String>, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let mut manager_config = ResourceManagerConfig::try_from(&config)?;
    if let Some(host) = host {
        manager_config.listen_host = host;
    }
    if let Some(port) = port {
        manager_config.listen_port = port;
    }

    let ha = Arc::new(StandaloneHaServices::new());
    let services = ResourceManagerServices {
        leader_election: ha.clone(),
        job_leader_retrieval: ha,
        slot_manager: Box::new(DefaultSlotManager::new()),
        backend: Arc::new(StandaloneBackend::new()),
        fatal_error_handler: Arc::new(ExitFatalErrorHandler),
    };
    let options = ResourceManagerOptions {
        config: manager_config,
        services,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let runner = ResourceManagerRunner::new(options);
        info!("resource manager is running; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        runner.shutdown().await?;
        Ok(())
    })
}
