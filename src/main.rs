mod cache;
mod config;
mod error;
mod proxy;
mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use config::{Config, Mode};
use proxy::bypass::BypassProxy;
use proxy::SecretProxy;
use store::VaultClient;

#[tokio::main]
async fn main() {
    // 1. Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "egressd=info".parse().unwrap()),
        )
        .init();

    // 2. Parse config
    let config = Config::from_env();
    let grace = Duration::from_secs(config.shutdown_grace_secs);

    // 3. Run the selected engine until a shutdown signal arrives. The mode
    //    is fixed for the lifetime of the sandbox.
    match config.mode {
        Mode::Bypass => {
            let proxy = BypassProxy::start(&config)
                .await
                .expect("failed to start bypass proxy");
            wait_for_shutdown().await;
            proxy.close(grace).await;
        }
        Mode::Mitm => {
            let store = VaultClient::from_env().expect("failed to create secret store client");
            let proxy = SecretProxy::start(&config, Arc::new(store))
                .await
                .expect("failed to start secret egress proxy");
            wait_for_shutdown().await;
            proxy.close(grace).await;
        }
    }

    info!("egress proxy stopped");
}

async fn wait_for_shutdown() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
    }
}
