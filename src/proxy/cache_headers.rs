use std::time::{Duration, SystemTime};

use http::{HeaderMap, StatusCode, header};
use tracing::warn;

/// How long a permanent redirect may be cached when the response carries no
/// caching headers of its own.
const MOVED_PERMANENTLY_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Parse a Cache-Control header value, returning how long the associated
/// response may be cached. Returns the default when no freshness directive is
/// present and zero when caching is forbidden.
pub fn parse_cache_control(header: &str, default_ttl: Duration) -> Duration {
    let mut ttl = default_ttl;

    for directive in header.split(',') {
        let directive = directive.trim().to_ascii_lowercase();
        let (name, value) = match directive.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (directive.as_str(), None),
        };

        if name == "no-store" || name == "no-cache" {
            return Duration::ZERO;
        }

        if name == "max-age" || name == "s-max-age" {
            let Some(value) = value else {
                warn!(header, "invalid cache-control header");
                continue;
            };
            if let Ok(seconds) = value.parse::<u64>() {
                ttl = Duration::from_secs(seconds);
            }
        }
    }

    ttl
}

/// Parse an Expires header value, returning the time remaining until the
/// given date. Returns the default when the value is not an RFC 1123 date and
/// zero when the date is in the past.
pub fn parse_expires(header: &str, default_ttl: Duration) -> Duration {
    match httpdate::parse_http_date(header) {
        Ok(date) => date
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
        Err(_) => default_ttl,
    }
}

/// Calculate how long a response may be cached based on its status and
/// caching headers.
pub fn response_cache_ttl(
    status: StatusCode,
    headers: &HeaderMap,
    default_ttl: Duration,
) -> Duration {
    if let Some(cache_control) = non_empty_header(headers, header::CACHE_CONTROL) {
        return parse_cache_control(cache_control, default_ttl);
    }
    if let Some(expires) = non_empty_header(headers, header::EXPIRES) {
        return parse_expires(expires, default_ttl);
    }

    // Permanent redirects keep for a very long time absent explicit headers.
    if status == StatusCode::MOVED_PERMANENTLY {
        return MOVED_PERMANENTLY_TTL;
    }

    default_ttl
}

/// Header names the response declares it varies on, in declared order.
///
/// A response without a Vary header yields a single empty name, so the cache
/// key for vary-less urls always carries one empty `name=value` pair.
pub fn vary_header_names(headers: &HeaderMap) -> Vec<String> {
    let vary = header_str(headers, header::VARY).unwrap_or("");
    vary.split(',').map(|name| name.trim().to_string()).collect()
}

/// Parse a Retry-After header as either an RFC 1123 date or a number of
/// seconds. Returns the default when the header is absent or unparsable.
pub fn parse_retry_after(headers: &HeaderMap, default_wait: Duration) -> Duration {
    let Some(value) = header_str(headers, header::RETRY_AFTER) else {
        return default_wait;
    };
    if value.is_empty() {
        return default_wait;
    }

    if let Ok(date) = httpdate::parse_http_date(value) {
        return date
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);
    }

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Duration::from_secs(seconds);
    }

    default_wait
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn non_empty_header(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    header_str(headers, name).filter(|value| !value.is_empty())
}
