pub mod cache;
pub mod cache_headers;
pub mod client;
pub mod front;
pub mod headers;
pub mod listener;
pub mod request;
pub mod throttle;
pub mod upstream;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::ConfigFile;
use crate::settings::Settings;

use client::NiceClient;
use throttle::MemoryHttpThrottle;

/// Everything a request handler needs, assembled once in `run()` and cloned
/// per connection. Cache and throttle state live behind the client.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub config: Arc<ConfigFile>,
    pub client: Arc<NiceClient>,
    pub throttle: Arc<MemoryHttpThrottle>,
    pub shutdown: CancellationToken,
}
