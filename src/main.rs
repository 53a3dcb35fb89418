use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use oxide_remote::native::HttpDownloader;
use oxide_remote::setup::RemoteSetupService;
use oxide_remote::ssh::StaticPrompter;
use oxide_remote::{config, server, RemoteError, RemoteService};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), RemoteError> {
    let config = config::load().await?;
    info!(
        "Remote runtime {} / application {} {}",
        config.runtime.version, config.application.name, config.application.version
    );

    let downloader =
        HttpDownloader::new().map_err(|e| RemoteError::Server(e.to_string()))?;
    let setup = RemoteSetupService::from_config(&config, Arc::new(downloader));
    let service = Arc::new(RemoteService::new(
        &config,
        setup,
        Arc::new(StaticPrompter::from_env()),
    ));
    server::serve(service, &config.server.listen_addr).await
}
