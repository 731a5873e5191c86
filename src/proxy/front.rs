use std::net::SocketAddr;

use anyhow::{Context, Result};
use bytes::Bytes;
use http::uri::Scheme;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::body::Incoming;
use tracing::error;

use crate::config::ConfigFile;

use super::AppContext;
use super::client::RequestOptions;
use super::headers::{append_forwarded_for, strip_hop_headers};
use super::request::{ProxyRequest, ProxyResponse, RequestBody};

type HttpBody = UnsyncBoxBody<Bytes, anyhow::Error>;

const UPGRADE_HEADER: &str = "x-upgrade-https";

/// Handle one inbound client request end to end. Failures never tear the
/// connection down; they are reported to the client as a 400 with the error
/// text.
pub async fn handle_request(
    app: AppContext,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<HttpBody> {
    match proxy_request(app, peer, req).await {
        Ok(response) => response,
        Err(err) => {
            error!(error = ?err, "proxied request failed");
            text_response(StatusCode::BAD_REQUEST, format!("{err:#}\n"))
        }
    }
}

async fn proxy_request(
    app: AppContext,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<HttpBody>> {
    // CONNECT would turn the proxy into an opaque byte relay, hiding urls
    // from the cache and throttle; clients upgrade via X-Upgrade-HTTPS
    // instead.
    if req.method() == Method::CONNECT {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT requests are not supported; use X-Upgrade-HTTPS\n".to_string(),
        ));
    }

    let scheme = req.uri().scheme_str().unwrap_or_default();
    if scheme != "http" && scheme != "https" {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            format!("unsupported protocol scheme {scheme}\n"),
        ));
    }

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    strip_hop_headers(&mut headers);
    append_forwarded_for(&mut headers, peer.ip());

    let uri = apply_https_upgrade(&headers, parts.uri)?;
    let options = request_options_for(&app.config, &uri);

    let mut proxy_req = ProxyRequest::new(parts.method, uri);
    proxy_req.headers = headers;
    proxy_req.body = RequestBody::Stream(body.map_err(anyhow::Error::from).boxed_unsync());

    let cancel = app.shutdown.child_token();
    let response = app
        .client
        .round_trip_with_options(proxy_req, &options, &cancel)
        .await?;

    let ProxyResponse {
        status,
        mut headers,
        body,
    } = response;
    strip_hop_headers(&mut headers);

    let mut response = Response::new(body.into_http_body());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Rewrite the request scheme to https unless the client opted out with
/// `X-Upgrade-HTTPS: false` (or `0`). Upgrading is the default.
fn apply_https_upgrade(headers: &HeaderMap, uri: Uri) -> Result<Uri> {
    let opt_out = headers
        .get(UPGRADE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            let value = value.to_ascii_lowercase();
            value == "false" || value == "0"
        })
        .unwrap_or(false);

    if opt_out || uri.scheme() == Some(&Scheme::HTTPS) {
        return Ok(uri);
    }

    let mut parts = uri.into_parts();
    parts.scheme = Some(Scheme::HTTPS);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse().expect("static path"));
    }
    Uri::from_parts(parts).context("failed to upgrade request scheme")
}

/// TTL clamps for the request: the most specific configured override, or the
/// stock 0 / 24h / 0.
fn request_options_for(config: &ConfigFile, uri: &Uri) -> RequestOptions {
    let mut options = RequestOptions::default();
    if let Some(override_) = config.cache_override_for_url(&uri.to_string()) {
        options.min_cache_ttl = override_.min_ttl;
        options.max_cache_ttl = override_.max_ttl;
        options.default_cache_ttl = override_.default_ttl;
    }
    options
}

fn text_response(status: StatusCode, text: String) -> Response<HttpBody> {
    let body = Full::new(Bytes::from(text))
        .map_err(|never| match never {})
        .boxed_unsync();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use http::HeaderValue;

    use crate::config::CacheOverride;

    #[test]
    fn upgrade_is_the_default() {
        let uri = apply_https_upgrade(&HeaderMap::new(), "http://a.test/x".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "https://a.test/x");
    }

    #[test]
    fn upgrade_opt_out_is_case_insensitive() {
        for value in ["false", "False", "FALSE", "0"] {
            let mut headers = HeaderMap::new();
            headers.insert(UPGRADE_HEADER, HeaderValue::from_str(value).unwrap());
            let uri =
                apply_https_upgrade(&headers, "http://a.test/x".parse().unwrap()).unwrap();
            assert_eq!(uri.to_string(), "http://a.test/x", "value {value}");
        }
    }

    #[test]
    fn unrelated_upgrade_values_still_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE_HEADER, HeaderValue::from_static("yes"));
        let uri = apply_https_upgrade(&headers, "http://a.test/x".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "https://a.test/x");
    }

    #[test]
    fn https_requests_are_left_alone() {
        let uri =
            apply_https_upgrade(&HeaderMap::new(), "https://a.test/x".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "https://a.test/x");
    }

    #[test]
    fn options_fall_back_to_stock_clamps() {
        let config = ConfigFile::default();
        let options = request_options_for(&config, &"http://a.test/x".parse().unwrap());
        assert_eq!(options.min_cache_ttl, Duration::ZERO);
        assert_eq!(options.max_cache_ttl, Duration::from_secs(24 * 60 * 60));
        assert_eq!(options.default_cache_ttl, Duration::ZERO);
    }

    #[test]
    fn options_use_most_specific_override() {
        let config = ConfigFile {
            rate_limits: Vec::new(),
            cache_overrides: vec![CacheOverride {
                url: "http://a.test".to_string(),
                min_ttl: Duration::from_secs(1),
                max_ttl: Duration::from_secs(10),
                default_ttl: Duration::from_secs(5),
            }],
        };
        let options = request_options_for(&config, &"http://a.test/x".parse().unwrap());
        assert_eq!(options.min_cache_ttl, Duration::from_secs(1));
        assert_eq!(options.max_cache_ttl, Duration::from_secs(10));
        assert_eq!(options.default_cache_ttl, Duration::from_secs(5));
    }
}
