use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};

use crate::cli::{Cli, LogFormat};

const PORT_VAR: &str = "PORT";
const CONFIG_FILE_VAR: &str = "CONFIGFILE";
const DEBUG_VAR: &str = "DEBUG";

fn default_port() -> u16 {
    8080
}

fn default_config_file() -> PathBuf {
    PathBuf::from("./chaperone.yaml")
}

fn default_cache_max_bytes() -> u64 {
    512_000_000
}

fn default_throttle_wait() -> Duration {
    Duration::from_secs(1)
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Startup settings resolved from the environment with CLI overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub config_file: PathBuf,
    pub log: LogFormat,
    /// Forces the `debug` log level when set.
    pub debug: bool,
    /// Total budget for cached response bodies, in bytes.
    pub cache_max_bytes: u64,
    /// Wait applied to requests with no configured throttle.
    pub default_throttle_wait: Duration,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let port = match cli.port {
            Some(port) => port,
            None => read_port()?,
        };
        let config_file = cli
            .config
            .clone()
            .or_else(|| env::var_os(CONFIG_FILE_VAR).map(PathBuf::from))
            .unwrap_or_else(default_config_file);

        let settings = Settings {
            port,
            config_file,
            log: cli.log.unwrap_or_else(default_log_format),
            debug: read_strict_bool(DEBUG_VAR)?,
            cache_max_bytes: default_cache_max_bytes(),
            default_throttle_wait: default_throttle_wait(),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_max_bytes > 0,
            "cache_max_bytes must be greater than 0 (got {})",
            self.cache_max_bytes
        );
        ensure!(
            !self.default_throttle_wait.is_zero(),
            "default_throttle_wait must be greater than zero"
        );
        Ok(())
    }
}

fn read_port() -> Result<u16> {
    match env::var(PORT_VAR) {
        Ok(value) => value
            .parse::<u16>()
            .with_context(|| format!("invalid {PORT_VAR} value '{value}'")),
        Err(env::VarError::NotPresent) => Ok(default_port()),
        Err(err) => Err(err).with_context(|| format!("failed to read {PORT_VAR}")),
    }
}

/// Boolean env vars accept only true/false/1/0; anything else is a startup error.
fn read_strict_bool(name: &str) -> Result<bool> {
    match env::var(name) {
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => bail!("invalid boolean value '{other}' for {name}"),
        },
        Err(env::VarError::NotPresent) => Ok(false),
        Err(err) => Err(err).with_context(|| format!("failed to read {name}")),
    }
}
