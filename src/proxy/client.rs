use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, ensure};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::HttpCache;
use super::cache_headers::parse_retry_after;
use super::request::{ProxyRequest, ProxyResponse, RequestBody, ResponseBody};
use super::throttle::MemoryHttpThrottle;
use super::upstream::{UpstreamRequest, UpstreamTransport};

/// Longest upstream-imposed backoff honored; anything larger is capped.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(3);
/// Uniform jitter added to every backoff to avoid thundering herds.
const MAX_JITTER_MS: u64 = 2000;
const MAX_REDIRECTS: usize = 10;

pub const DEFAULT_USER_AGENT: &str = "ChaperoneBot/0.1";

/// The retry loop was abandoned because the request's context was cancelled.
/// Distinct from transport and protocol failures so callers can tell an
/// aborted request from a broken one.
#[derive(Debug, Error)]
#[error("request cancelled during retry loop")]
pub struct RequestCancelled;

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// User-Agent injected when the request carries none.
    pub user_agent: String,
    pub min_cache_ttl: Duration,
    pub max_cache_ttl: Duration,
    pub default_cache_ttl: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_cache_ttl: Duration::ZERO,
            max_cache_ttl: Duration::from_secs(24 * 60 * 60),
            default_cache_ttl: Duration::ZERO,
        }
    }
}

/// An HTTP client that is polite to origin servers: it rate-limits through
/// the shared throttle, serves and fills the response cache, honors
/// Retry-After backoff, and follows redirects transparently.
pub struct NiceClient {
    transport: Arc<dyn UpstreamTransport>,
    throttle: Arc<MemoryHttpThrottle>,
    cache: HttpCache,
}

impl NiceClient {
    pub fn new(
        transport: Arc<dyn UpstreamTransport>,
        throttle: Arc<MemoryHttpThrottle>,
        cache: HttpCache,
    ) -> Self {
        Self {
            transport,
            throttle,
            cache,
        }
    }

    pub async fn round_trip(
        &self,
        req: ProxyRequest,
        cancel: &CancellationToken,
    ) -> Result<ProxyResponse> {
        self.round_trip_with_options(req, &RequestOptions::default(), cancel)
            .await
    }

    /// Perform one logical request: cache lookup, throttle wait, upstream
    /// dispatch, backoff on 429/503, redirect following, cache store.
    pub async fn round_trip_with_options(
        &self,
        mut req: ProxyRequest,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<ProxyResponse> {
        if !req.headers.contains_key(header::USER_AGENT) {
            let agent = HeaderValue::from_str(&options.user_agent)
                .with_context(|| format!("invalid user agent '{}'", options.user_agent))?;
            req.headers.insert(header::USER_AGENT, agent);
        }

        let original_method = req.method.clone();
        // Responses are cached under the url the caller asked for, so a
        // cached redirect target stays discoverable via the original url.
        let original_url = req.uri.to_string();

        if original_method == Method::GET
            && let Some(cached) = self.cache.lookup(&original_url, &req.headers)
        {
            debug!(url = %original_url, "serving cached response");
            return Ok(ProxyResponse {
                status: cached.status,
                headers: cached.headers.clone(),
                body: ResponseBody::Buffered(cached.body.clone()),
            });
        }

        // The transport consumes the body on every attempt; an in-memory
        // copy outlives all retries and redirects.
        let buffered = req.buffer_body().await?;
        if buffered > 0 {
            debug!(url = %original_url, buffer_size = buffered, "buffered request body for retries");
        }

        let mut attempt = 1u32;
        let mut redirects = 0usize;
        loop {
            debug!(method = %req.method, url = %req.uri, attempt, "waiting to make request");
            self.throttle.wait(&req.method, &req.uri).await;

            let response = self
                .transport
                .round_trip(UpstreamRequest {
                    method: &req.method,
                    uri: &req.uri,
                    headers: &req.headers,
                    body: req.body.as_bytes(),
                })
                .await?;
            debug!(status = %response.status, attempt, "got upstream response");

            match response.status {
                StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
                    let wait = backoff_wait(&response.headers);
                    let jitter =
                        Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS));
                    warn!(
                        status = %response.status,
                        wait_ms = (wait + jitter).as_millis() as u64,
                        "got backoff status code"
                    );
                    self.throttle.block(&req.method, &req.uri, wait + jitter);
                }
                StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT => {
                    redirects += 1;
                    ensure!(
                        redirects <= MAX_REDIRECTS,
                        "stopped after {MAX_REDIRECTS} redirects for {original_url}"
                    );
                    let target = redirect_target(&response.headers, &req.uri)?;
                    info!(from = %req.uri, to = %target, "following redirect");
                    // Method, headers, and the buffered body carry over.
                    req.uri = target;
                }
                _ => {
                    let mut response = response;
                    // Only GET responses are cached; other methods are never
                    // safe to replay from a cache.
                    if original_method == Method::GET {
                        response = self
                            .cache
                            .store(
                                &original_url,
                                &req.headers,
                                response,
                                options.min_cache_ttl,
                                options.max_cache_ttl,
                                options.default_cache_ttl,
                            )
                            .await?;
                    }
                    return Ok(response);
                }
            }

            if cancel.is_cancelled() {
                return Err(RequestCancelled.into());
            }
            attempt += 1;
        }
    }

    pub async fn get(
        &self,
        uri: Uri,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<ProxyResponse> {
        self.round_trip_with_options(ProxyRequest::new(Method::GET, uri), options, cancel)
            .await
    }

    pub async fn post(
        &self,
        uri: Uri,
        body: Bytes,
        options: &RequestOptions,
        cancel: &CancellationToken,
    ) -> Result<ProxyResponse> {
        let mut req = ProxyRequest::new(Method::POST, uri);
        req.body = RequestBody::Buffered(body);
        self.round_trip_with_options(req, options, cancel).await
    }
}

/// How long to back off after a 429/503: the upstream's Retry-After when
/// given, capped so a hostile header cannot park the loop for hours.
fn backoff_wait(headers: &HeaderMap) -> Duration {
    let wait = parse_retry_after(headers, DEFAULT_RETRY_AFTER);
    wait.min(MAX_RETRY_AFTER)
}

/// Parse the Location header of a redirect; relative references resolve
/// against the current request url.
fn redirect_target(headers: &HeaderMap, base: &Uri) -> Result<Uri> {
    let location = headers
        .get(header::LOCATION)
        .ok_or_else(|| anyhow!("redirect response missing Location header"))?;
    let location = location.to_str().context("invalid Location header")?;
    let target: Uri = location
        .parse()
        .with_context(|| format!("invalid redirect target '{location}'"))?;

    if target.scheme().is_some() && target.authority().is_some() {
        return Ok(target);
    }
    ensure!(
        location.starts_with('/'),
        "unsupported redirect target '{location}'"
    );

    let mut builder = Uri::builder().path_and_query(location);
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .build()
        .with_context(|| format!("invalid redirect target '{location}'"))
}
