use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// A parsed proxy response as seen by a raw client.
#[derive(Debug)]
pub struct ClientResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl ClientResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (header, value) = line.split_once(':')?;
            header
                .trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim())
        })
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Send one absolute-form request through the proxy. The HTTPS upgrade is
/// opted out so scripted plain-http origins can serve the request; pass
/// extra headers to override that.
pub async fn proxy_request(
    proxy: SocketAddr,
    method: &str,
    url: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Result<ClientResponse> {
    let host = url
        .split_once("://")
        .map(|(_, rest)| rest.split('/').next().unwrap_or_default())
        .unwrap_or_default();

    let mut request = format!("{method} {url} HTTP/1.1\r\nHost: {host}\r\n");
    if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("x-upgrade-https")) {
        request.push_str("X-Upgrade-HTTPS: false\r\n");
    }
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    if !body.is_empty() {
        request.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    request.push_str("Connection: close\r\n\r\n");

    let mut stream = TcpStream::connect(proxy)
        .await
        .context("failed to connect to proxy")?;
    stream.write_all(request.as_bytes()).await?;
    stream.write_all(body).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

pub async fn proxy_get(proxy: SocketAddr, url: &str) -> Result<ClientResponse> {
    proxy_request(proxy, "GET", url, &[], b"").await
}

fn parse_response(raw: &[u8]) -> Result<ClientResponse> {
    let Some(head_end) = raw.windows(4).position(|window| window == b"\r\n\r\n") else {
        bail!("response has no header terminator");
    };
    let head = String::from_utf8(raw[..head_end].to_vec())
        .context("response head is not valid utf-8")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .context("response has no status code")?;
    let body = raw[head_end + 4..].to_vec();
    Ok(ClientResponse { status, head, body })
}
