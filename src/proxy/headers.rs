use std::net::IpAddr;

use http::{HeaderMap, HeaderValue, header::HeaderName};

/// Headers meaningful only on the hop between two adjacent HTTP peers.
/// Stripped from both directions before forwarding.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn strip_hop_headers(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        headers.remove(name);
    }
}

/// Append the client's IP to X-Forwarded-For so origins can see the original
/// sender. Prior proxy entries are folded into one comma-separated header.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<String> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .collect();

    let combined = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {client_ip}", prior.join(", "))
    };

    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(HeaderName::from_static("x-forwarded-for"), value);
    }
}
