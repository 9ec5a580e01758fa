use s3_build_cache::{
    config::Config, http_proxy::HttpProxy, logging::LoggerManager, s3_client::S3Client, Result,
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let mut logger =
        LoggerManager::from_config(config.logging.clone(), LoggerManager::local_hostname());
    logger.initialize()?;

    info!("Starting S3 build cache v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Backend: bucket={}, region={}, endpoint={}",
        config.backend.bucket,
        config.backend.region,
        config.backend.endpoint.as_deref().unwrap_or("aws")
    );
    if config.cache.enabled {
        info!(
            "RAM cache: enabled, max_entry_size={}B, max_size={}MB",
            config.cache.max_entry_size,
            config.cache.max_total_size / 1024 / 1024
        );
    } else {
        info!("RAM cache: disabled");
    }
    info!(
        "Uploads: {}, max_pending={}MB, staging_dir={}",
        if config.async_upload.enabled { "async" } else { "sync" },
        config.async_upload.max_pending_bytes / 1024 / 1024,
        config.async_upload.staging_dir.display()
    );
    info!(
        "Offline mode: allow={}, errors_before_pausing={}, pause={:?}",
        config.offline.allow_offline,
        config.offline.errors_before_pausing,
        config.offline.pause_duration
    );

    let s3_client = match S3Client::new(&config.backend) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create S3 client: {}", e);
            return Err(e);
        }
    };

    let proxy = HttpProxy::new(config, s3_client);
    proxy.lifecycle().listen_for_signals()?;

    let reason = proxy
        .run(|addr| info!("Ready to accept connections on {}", addr))
        .await?;

    info!("Shutdown complete: {}", reason);
    Ok(())
}
