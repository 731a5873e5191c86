use anyhow::Result;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};

/// One outbound request as seen by the nice client and upstream transport.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    /// Replace a streaming body with an in-memory copy so the request can be
    /// replayed across retries and redirects. No-op for empty and
    /// already-buffered bodies.
    pub async fn buffer_body(&mut self) -> Result<usize> {
        let body = std::mem::replace(&mut self.body, RequestBody::Empty);
        let buffered = match body {
            RequestBody::Empty => return Ok(0),
            RequestBody::Buffered(bytes) => bytes,
            RequestBody::Stream(stream) => stream.collect().await?.to_bytes(),
        };
        let len = buffered.len();
        self.body = if len == 0 {
            RequestBody::Empty
        } else {
            RequestBody::Buffered(buffered)
        };
        Ok(len)
    }
}

#[derive(Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Buffered(Bytes),
    Stream(UnsyncBoxBody<Bytes, anyhow::Error>),
}

impl RequestBody {
    /// The buffered payload, if any. Streaming bodies must be buffered via
    /// [`ProxyRequest::buffer_body`] before the transport is invoked.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RequestBody::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// One upstream response flowing back toward the client.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

#[derive(Debug)]
pub enum ResponseBody {
    Buffered(Bytes),
    Stream(UnsyncBoxBody<Bytes, anyhow::Error>),
}

impl ResponseBody {
    pub fn buffered(bytes: impl Into<Bytes>) -> Self {
        ResponseBody::Buffered(bytes.into())
    }

    /// Read at most `limit` bytes, abandoning the rest of the stream.
    pub async fn read_limited(self, limit: usize) -> Result<Bytes> {
        match self {
            ResponseBody::Buffered(bytes) => {
                let len = bytes.len().min(limit);
                Ok(bytes.slice(..len))
            }
            ResponseBody::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while buffer.len() < limit {
                    let Some(frame) = stream.frame().await else {
                        break;
                    };
                    if let Ok(data) = frame?.into_data() {
                        let remaining = limit - buffer.len();
                        if data.len() > remaining {
                            buffer.extend_from_slice(&data[..remaining]);
                        } else {
                            buffer.extend_from_slice(&data);
                        }
                    }
                }
                Ok(buffer.freeze())
            }
        }
    }

    /// Collect the full body into memory.
    pub async fn into_bytes(self) -> Result<Bytes> {
        match self {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Stream(stream) => Ok(stream.collect().await?.to_bytes()),
        }
    }

    /// Convert into a body the hyper server can stream to the client.
    pub fn into_http_body(self) -> UnsyncBoxBody<Bytes, anyhow::Error> {
        match self {
            ResponseBody::Buffered(bytes) => {
                Full::new(bytes).map_err(|never| match never {}).boxed_unsync()
            }
            ResponseBody::Stream(stream) => stream,
        }
    }
}
