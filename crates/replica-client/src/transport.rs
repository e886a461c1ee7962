use std::{fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::{
    Method,
    header::{CONTENT_TYPE, HeaderMap},
};
use thiserror::Error;
use url::Url;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of a streaming response. `None` from the stream is a clean end.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Failures below the HTTP status level.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("stream read failed: {0}")]
    Stream(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// A request as handed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Response head plus a body stream.
pub struct StreamResponse {
    pub status: u16,
    pub status_text: String,
    pub body: Option<ByteStream>,
}

impl fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// HTTP transport used by resource clients.
///
/// Both calls are cancelled by dropping the returned future; dropping a
/// [`ByteStream`] aborts the connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    request_timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        Self::with_request_timeout(None)
    }

    /// `request_timeout` bounds buffered requests only; watch streams stay open.
    pub fn with_request_timeout(request_timeout: Option<Duration>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn build(&self, request: HttpRequest, timeout: Option<Duration>) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        builder
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = self
            .build(request, self.request_timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            content_type,
            body,
        })
    }

    async fn open_stream(&self, request: HttpRequest) -> Result<StreamResponse, TransportError> {
        let response = self
            .build(request, None)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map_err(|err| TransportError::Stream(err.to_string())),
        );

        Ok(StreamResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            body: Some(body),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else if err.is_body() || err.is_decode() {
        TransportError::Stream(err.to_string())
    } else {
        TransportError::Request(err.to_string())
    }
}
