use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use http::header::HeaderName;
use http::{HeaderMap, StatusCode, header};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

mod index;
mod key;

use index::CacheIndex;
use key::cache_key;

use super::cache_headers::{response_cache_ttl, vary_header_names};
use super::request::{ProxyResponse, ResponseBody};

/// An immutable record of one upstream response, created on store and handed
/// out on lookup.
#[derive(Debug)]
pub struct CachedResponse {
    pub url: String,
    pub status: StatusCode,
    pub body: Bytes,
    /// Response headers as received from the origin.
    pub headers: HeaderMap,
    /// The varied-on subset of the request headers at store time.
    pub request_headers: HeaderMap,
    pub vary_names: Vec<String>,
    pub fresh_until: SystemTime,
}

impl CachedResponse {
    /// True when the stored response may serve the given request: every
    /// varied-on header must carry the same value it had at store time. This
    /// guards the key-collision case where two vary schemes build the same
    /// key.
    pub fn is_valid_for(&self, request_headers: &HeaderMap) -> bool {
        self.vary_names.iter().all(|name| {
            key::header_value(&self.request_headers, name)
                == key::header_value(request_headers, name)
        })
    }
}

/// In-memory response cache honoring Cache-Control/Expires/Vary semantics,
/// bounded by a total body-byte budget. Shared across all request handlers.
#[derive(Clone)]
pub struct HttpCache {
    state: Arc<CacheState>,
}

struct CacheState {
    index: Mutex<CacheIndex>,
    max_bytes: u64,
    expiry_wake: Notify,
}

impl HttpCache {
    pub fn new(max_bytes: u64, shutdown: CancellationToken) -> Self {
        let state = Arc::new(CacheState {
            index: Mutex::new(CacheIndex::new(max_bytes)),
            max_bytes,
            expiry_wake: Notify::new(),
        });
        spawn_sweeper(state.clone(), shutdown);
        Self { state }
    }

    /// Return a previously stored response valid for the given request url
    /// and headers, or None.
    pub fn lookup(&self, url: &str, request_headers: &HeaderMap) -> Option<Arc<CachedResponse>> {
        let cached = {
            let mut index = self.state.index.lock();
            let now = Instant::now();
            let vary_names = index.get_vary(url, now)?;
            let cache_key = cache_key(url, &vary_names, request_headers);
            index.get_response(&cache_key, now)?
        };

        if !cached.is_valid_for(request_headers) {
            trace!(url, "cached response vary mismatch");
            return None;
        }
        trace!(url, "cache hit");
        Some(cached)
    }

    /// Decide whether and how long to cache the response. When cached (or
    /// buffered along the way), the returned response carries a fresh
    /// readable body; otherwise the original body is handed back untouched.
    pub async fn store(
        &self,
        url: &str,
        request_headers: &HeaderMap,
        response: ProxyResponse,
        min_ttl: Duration,
        max_ttl: Duration,
        default_ttl: Duration,
    ) -> Result<ProxyResponse> {
        let mut ttl = response_cache_ttl(response.status, &response.headers, default_ttl);
        if ttl < min_ttl {
            ttl = min_ttl;
        } else if ttl > max_ttl {
            ttl = max_ttl;
        }
        if ttl.is_zero() {
            trace!(url, "response not cacheable");
            return Ok(response);
        }

        let expires_at = Instant::now() + ttl;

        // Record which headers this url varies on; lookups rebuild the key
        // from this record without having seen the response.
        let vary_names = vary_header_names(&response.headers);
        self.state
            .index
            .lock()
            .insert_vary(url.to_string(), vary_names.clone(), expires_at);
        self.state.expiry_wake.notify_one();

        let cache_key = cache_key(url, &vary_names, request_headers);

        // Size ceiling: the declared Content-Length when present, otherwise
        // the whole budget. Reading past the declared length is never cached.
        let mut ceiling = self.state.max_bytes;
        if let Some(value) = response.headers.get(header::CONTENT_LENGTH) {
            let value = value.to_str().context("invalid Content-Length header")?;
            ceiling = value
                .parse::<u64>()
                .with_context(|| format!("invalid Content-Length '{value}'"))?;
            if self.state.index.lock().would_exceed(ceiling) {
                warn!(url, content_length = ceiling, "caching response would exceed byte budget");
                return Ok(response);
            }
        }

        let ProxyResponse {
            status,
            headers,
            body,
        } = response;
        let limit = usize::try_from(ceiling).unwrap_or(usize::MAX);
        let buffer = body.read_limited(limit).await?;

        {
            let mut index = self.state.index.lock();
            if index.would_exceed(buffer.len() as u64) {
                warn!(url, size = buffer.len(), "caching response would exceed byte budget");
                return Ok(ProxyResponse {
                    status,
                    headers,
                    body: ResponseBody::Buffered(buffer),
                });
            }

            let stored = Arc::new(CachedResponse {
                url: url.to_string(),
                status,
                body: buffer.clone(),
                headers: headers.clone(),
                request_headers: vary_subset(&vary_names, request_headers),
                vary_names,
                fresh_until: SystemTime::now() + ttl,
            });
            index.insert_response(cache_key, stored, expires_at);
        }
        self.state.expiry_wake.notify_one();

        debug!(url, ttl_seconds = ttl.as_secs(), size = buffer.len(), "cached response");
        Ok(ProxyResponse {
            status,
            headers,
            body: ResponseBody::Buffered(buffer),
        })
    }

    #[cfg(test)]
    fn bytes_in_use(&self) -> u64 {
        self.state.index.lock().bytes_in_use()
    }
}

/// Copy the request header values the response varies on, so later lookups
/// can verify them against the incoming request.
fn vary_subset(vary_names: &[String], request_headers: &HeaderMap) -> HeaderMap {
    let mut subset = HeaderMap::new();
    for name in vary_names {
        if name.is_empty() {
            continue;
        }
        if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes())
            && let Some(value) = request_headers.get(&header_name)
        {
            subset.insert(header_name, value.clone());
        }
    }
    subset
}

/// One background task drains the expiration heap; it wakes early whenever a
/// store introduces a nearer deadline and stops with the process.
fn spawn_sweeper(state: Arc<CacheState>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            let deadline = state.index.lock().next_deadline();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    state.index.lock().clear();
                    break;
                }
                _ = state.expiry_wake.notified() => {}
                _ = sleep_until_or_forever(deadline) => {
                    let (removed, bytes_freed) = state.index.lock().remove_due(Instant::now());
                    if removed > 0 {
                        trace!(removed, bytes_freed, "cache sweep removed expired entries");
                    }
                }
            }
        }
    });
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
