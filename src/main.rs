use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use media_preprocessor::{AppConfig, IngestServer, SessionRegistry};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("media_preprocessor=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: media-preprocessor <config.yaml>");
        return ExitCode::FAILURE;
    };

    let config = match AppConfig::load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path, error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let registry = match SessionRegistry::from_config(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialise registry");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        port = config.server.rtmp_port,
        base_path = %config.segment.base_path.display(),
        cut_policy = config.segment.policy().name(),
        fanout = config.server.fanout,
        relay = config.server.media_processor.is_some(),
        encodings = config.media.encoding.len(),
        "Starting media preprocessor"
    );

    let server = IngestServer::new(config.listener(), Arc::clone(&registry));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    };

    let result = server.run_until(shutdown).await;
    registry.terminate_all().await;

    match result {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::FAILURE
        }
    }
}
