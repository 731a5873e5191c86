use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, Method, Uri};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;

use super::request::{ProxyResponse, ResponseBody};

/// A borrowed view of one sanitized, replay-ready request: the nice client
/// buffers bodies before dispatch, so the transport only ever sees bytes.
pub struct UpstreamRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a Bytes>,
}

/// One network round trip to an origin server. The nice client owns all
/// policy (caching, throttling, retries, redirects); implementations only
/// move bytes.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn round_trip(&self, req: UpstreamRequest<'_>) -> Result<ProxyResponse>;
}

/// Production transport backed by reqwest. Redirects are disabled so the
/// nice client sees 3xx responses itself; TLS toward upgraded origins is
/// handled by the client internals.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build upstream http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamTransport for ReqwestTransport {
    async fn round_trip(&self, req: UpstreamRequest<'_>) -> Result<ProxyResponse> {
        let url = reqwest::Url::parse(&req.uri.to_string())
            .with_context(|| format!("invalid upstream url '{}'", req.uri))?;

        let mut builder = self
            .client
            .request(req.method.clone(), url)
            .headers(req.headers.clone());
        if let Some(body) = req.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.context("upstream request failed")?;
        let status = response.status();
        let headers = response.headers().clone();
        let stream = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(anyhow::Error::from);

        Ok(ProxyResponse {
            status,
            headers,
            body: ResponseBody::Stream(StreamBody::new(stream).boxed_unsync()),
        })
    }
}
