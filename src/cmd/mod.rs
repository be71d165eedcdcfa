//! # Command module
//!
//! This module provide command line interface structures and the daemon
//! running the lifecycle manager

use std::{io, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use crate::svc::{
    cfg::{Configuration, SpecsMode},
    controller::manager::{ConfigManager, CrdManager, SpecLoader},
    gctl::loader,
    http,
    k8s::{client, discovery::ApiRegistry},
};

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[command(version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[arg(short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[arg(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[arg(short = 't', long = "check", global = true)]
    pub check: bool,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to run lifecycle manager, {0}")]
    Manager(crate::svc::controller::manager::Error),
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to serve http content, {0}")]
    Server(http::server::Error),
}

// -----------------------------------------------------------------------------
// Running enumeration

enum Running {
    Config(ConfigManager),
    Crd(CrdManager),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(kubeconfig: Option<PathBuf>, config: Arc<Configuration>) -> Result<(), Error> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig).await.map_err(Error::Client)?;
    let registry = Arc::new(ApiRegistry::new(kube_client.to_owned()));

    // -------------------------------------------------------------------------
    // Expose health and metrics endpoints
    let server = {
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(err) = http::server::serve(config).await {
                error!(error = err.to_string(), "Could not serve http content");
            }
        })
    };

    // -------------------------------------------------------------------------
    // Start the lifecycle manager matching the configured specification
    // source
    let running = match config.specs.mode {
        SpecsMode::Config => {
            let path = config.specs.path.to_owned();
            let load: SpecLoader = Arc::new(move || loader::load_from_directory(&path));

            let mut manager = ConfigManager::new(
                kube_client,
                registry,
                config.operator.workers,
                load,
                Duration::from_secs(config.specs.retry_interval_seconds),
                Duration::from_secs(config.specs.load_timeout_seconds),
            );

            manager.start().await.map_err(Error::Manager)?;
            Running::Config(manager)
        }
        SpecsMode::Crd => Running::Crd(
            CrdManager::start(kube_client, registry, config.operator.workers)
                .await
                .map_err(Error::Manager)?,
        ),
    };

    // -------------------------------------------------------------------------
    // Wait for a termination signal, then drain every reconciler
    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::SigTerm)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::SigTerm)?;

    tokio::select! {
        _ = sigint.recv() => info!("Receive interrupt signal, shutting down"),
        _ = sigterm.recv() => info!("Receive termination signal, shutting down"),
    }

    match running {
        Running::Config(mut manager) => manager.stop().await,
        Running::Crd(manager) => manager.stop().await,
    }

    server.abort();
    Ok(())
}
