use std::convert::Infallible;

use anyhow::Result;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use super::{AppContext, front};

/// Accept connections and serve each over HTTP/1 until the shutdown token
/// fires. Every connection runs as its own task; request handling is fully
/// concurrent across connections.
pub async fn start_listener(app: AppContext, listener: TcpListener) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "proxy listener started");

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = app.shutdown.cancelled() => {
                info!("proxy listener shutting down");
                app.throttle.stop();
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!(error = %err, "failed to accept incoming connection");
                    continue;
                }
            },
        };

        debug!(peer = %peer_addr, "accepted connection");
        let connection_app = app.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let app = connection_app.clone();
                async move {
                    Ok::<_, Infallible>(front::handle_request(app, peer_addr, req).await)
                }
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer_addr, error = %err, "connection closed with error");
            }
        });
    }
}
