use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use chaperone::cli::LogFormat;
use chaperone::run_with_listener;
use chaperone::settings::Settings;

/// A proxy instance bound to an ephemeral port, running the full stack with
/// the given YAML configuration.
pub struct TestProxy {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
    // Holds the config file on disk for the proxy's lifetime.
    _config: NamedTempFile,
}

impl TestProxy {
    pub async fn start(config_yaml: &str) -> Result<Self> {
        let mut config = NamedTempFile::new()?;
        config.write_all(config_yaml.as_bytes())?;

        let settings = Settings {
            port: 0,
            config_file: config.path().to_path_buf(),
            log: LogFormat::Text,
            debug: false,
            cache_max_bytes: 64 * 1024 * 1024,
            default_throttle_wait: Duration::from_millis(10),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_with_listener(settings, listener, shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            handle,
            _config: config,
        })
    }

    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await?
    }
}
