//! Controller command - run the RGD controller against the current cluster

use krg_kube::{ControllerConfig, DefinitionController, KubeCluster};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Result;

/// Log filter used when `RUST_LOG` is not set
const DEFAULT_LOG_FILTER: &str = "krg=info,krg_kube=info,krg_engine=info";

#[derive(Debug, Clone, Default)]
pub struct ControllerArgs {
    pub config: Option<PathBuf>,
    pub workers: Option<usize>,
    pub allow_crd_deletion: bool,
    pub log_json: bool,
}

pub fn run(args: &ControllerArgs) -> Result<()> {
    let config = load_config(args)?;
    init_tracing(args.log_json);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(serve(config))
}

/// Config file (or defaults) with command line overrides applied
fn load_config(args: &ControllerArgs) -> Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load_from(path)?,
        None => ControllerConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers_per_type = workers;
    }
    if args.allow_crd_deletion {
        config.allow_crd_deletion = true;
    }
    config.validate()?;
    Ok(config)
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn serve(config: ControllerConfig) -> Result<()> {
    let cluster = KubeCluster::new().await?;
    let controller = DefinitionController::new(Arc::new(cluster), &config);

    let shutdown = CancellationToken::new();
    let signal = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
    };

    tracing::info!(
        workers_per_type = config.workers_per_type,
        field_manager = %config.field_manager,
        "starting controller"
    );
    controller.run(shutdown).await?;
    signal.abort();
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
