pub mod cli;
pub mod config;
pub mod logging;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::{Context, Result};
use http::{Method, Uri};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ConfigFile;
use crate::proxy::cache::HttpCache;
use crate::proxy::client::NiceClient;
use crate::proxy::throttle::MemoryHttpThrottle;
use crate::proxy::upstream::ReqwestTransport;
use crate::settings::Settings;

pub async fn run(settings: Settings) -> Result<()> {
    let bind_addr = settings.listen_addr();
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    let shutdown = CancellationToken::new();
    spawn_shutdown_task(shutdown.clone());
    run_with_listener(settings, listener, shutdown).await
}

/// Assemble the shared state (config, throttle, cache, client) and serve on
/// the given listener until the shutdown token fires. Split from `run` so
/// tests can bind an ephemeral port and drive shutdown themselves.
pub async fn run_with_listener(
    settings: Settings,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    let settings = Arc::new(settings);
    let config = Arc::new(ConfigFile::load(&settings.config_file)?);

    let throttle = Arc::new(MemoryHttpThrottle::new(settings.default_throttle_wait));
    let cache = HttpCache::new(settings.cache_max_bytes, shutdown.clone());
    let transport = Arc::new(ReqwestTransport::new()?);
    let client = Arc::new(NiceClient::new(transport, throttle.clone(), cache));

    for rate_limit in &config.rate_limits {
        let method: Method = rate_limit
            .method
            .parse()
            .with_context(|| format!("invalid rate limit method '{}'", rate_limit.method))?;
        let uri: Uri = rate_limit
            .url
            .parse()
            .with_context(|| format!("invalid rate limit url '{}'", rate_limit.url))?;
        info!(
            url = %uri,
            method = %method,
            wait = ?rate_limit.wait_duration,
            "setting throttle for url"
        );
        throttle.set_throttle(&method, &uri, rate_limit.wait_duration);
    }

    let app = proxy::AppContext {
        settings,
        config,
        client,
        throttle,
        shutdown,
    };
    proxy::listener::start_listener(app, listener).await
}

fn spawn_shutdown_task(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install shutdown signal handler");
            return;
        }
        info!("received shutdown signal");
        shutdown.cancel();
    });
}
