//! The transport layer: one physical HTTP exchange per call.
//!
//! [`Transport`] abstracts over the HTTP engine. The default implementation,
//! [`ReqwestTransport`], drives `reqwest`; tests plug in scripted transports.
//!
//! A successful [`Transport::send`] yields an [`Exchange`]: status, headers
//! and a lazily-read [`Body`]. The body owns the underlying connection and
//! releases it exactly once, whether it was read to the end, failed half-way,
//! was closed explicitly or was simply dropped.

use crate::request::Request;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Sends requests over the network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs one physical exchange.
    ///
    /// Implementations return [`Error::Transport`] or [`Error::Timeout`] when
    /// no status line could be obtained. Any status, including errors, is a
    /// successful exchange at this layer.
    async fn send(&self, request: &Request) -> Result<Exchange>;
}

/// A raw response body owned by a transport.
#[async_trait]
pub trait ResponseBody: Send {
    /// Reads the next chunk, or `None` at end of stream.
    async fn chunk(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Releases the underlying connection.
    ///
    /// [`Body`] guarantees this is called exactly once.
    fn close(&mut self);
}

/// A response body stream that releases its connection exactly once.
pub struct Body {
    inner: Option<Box<dyn ResponseBody>>,
}

impl Body {
    /// Wraps a transport body.
    pub fn new(inner: impl ResponseBody + 'static) -> Self {
        Self {
            inner: Some(Box::new(inner)),
        }
    }

    /// A body that is already closed and yields nothing.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Reads the next chunk.
    ///
    /// The connection is released when the end of the stream is reached or
    /// when a read fails. Reading a closed body yields `None`.
    pub async fn chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(None);
        };
        match inner.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// Reads the whole body and releases the connection.
    pub async fn bytes(mut self) -> Result<Bytes> {
        self.read_to_end()
            .await
            .map_err(|source| Error::BodyRead { source })
    }

    /// Reads the whole body as UTF-8 text (lossily) and releases the connection.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) async fn read_to_end(&mut self) -> std::io::Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Releases the connection without reading the rest of the body.
    ///
    /// Closing an already closed body does nothing.
    pub fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }

    /// Returns `true` once the connection has been released.
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum ErrorBody {
    Unread,
    Read(Bytes),
    Failed,
}

/// The result of one attempt: status, headers and the body stream.
///
/// An exchange is never shared across attempts. For error statuses the body
/// can be read through [`error_body`](Self::error_body), which consumes the
/// stream once and remembers the bytes for later readers in the same attempt.
pub struct Exchange {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: Body,
    error_body: ErrorBody,
}

impl Exchange {
    /// Creates an exchange from the parts a transport received.
    pub fn new(status: StatusCode, headers: HeaderMap, url: Url, body: Body) -> Self {
        Self {
            status,
            headers,
            url,
            body,
            error_body: ErrorBody::Unread,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The URL the request was sent to.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Reads the whole body of an error response.
    ///
    /// The stream is consumed and released on the first call; later calls
    /// return the same bytes. Returns `None` if reading failed, or if the
    /// response is a success (success bodies are left for the caller).
    pub async fn error_body(&mut self) -> Option<&Bytes> {
        if self.status.is_success() {
            return None;
        }
        if let ErrorBody::Unread = self.error_body {
            self.error_body = match self.body.read_to_end().await {
                Ok(bytes) => ErrorBody::Read(bytes),
                Err(e) => {
                    tracing::warn!(error = %e, url = %self.url, "Failed to read error body");
                    ErrorBody::Failed
                }
            };
            self.body.close();
        }
        match &self.error_body {
            ErrorBody::Read(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Consumes and releases whatever is left of the body, so the attempt can
    /// be discarded before a replay.
    pub(crate) async fn discard(mut self) {
        if self.status.is_success() {
            if let Err(e) = self.body.read_to_end().await {
                tracing::debug!(error = %e, "Failed to drain response before replay");
            }
        } else {
            self.error_body().await;
        }
        self.body.close();
    }

    pub(crate) fn into_body(self) -> Body {
        self.body
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("body", &self.body)
            .finish()
    }
}

/// Transport settings passed to [`ReqwestTransport`].
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Option<Duration>,
    /// Timeout for each read from the connection.
    pub read_timeout: Option<Duration>,
    /// HTTP proxy to route requests through.
    pub proxy: Option<Url>,
    /// Credentials for the proxy.
    pub proxy_credentials: Option<(String, String)>,
    /// Maximum idle connections kept per host.
    pub max_idle_connections: Option<usize>,
}

/// The default transport, backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http_client: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport from the given settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the proxy or the underlying client
    /// cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(timeout) = config.read_timeout {
            builder = builder.read_timeout(timeout);
        }
        if let Some(max) = config.max_idle_connections {
            builder = builder.pool_max_idle_per_host(max);
        }
        if let Some(proxy_url) = &config.proxy {
            let mut proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|e| Error::ConfigurationError(format!("Invalid proxy: {}", e)))?;
            if let Some((user, password)) = &config.proxy_credentials {
                proxy = proxy.basic_auth(user, password);
            }
            builder = builder.proxy(proxy);
        }
        let http_client = builder.build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &Request) -> Result<Exchange> {
        let mut builder = self
            .http_client
            .request(request.method().clone(), request.url().clone())
            .headers(request.headers().clone());

        if let Some(body) = request.body() {
            builder = match body {
                crate::RequestBody::Bytes(bytes) => builder.body(bytes.clone()),
                crate::RequestBody::Generated(_) => {
                    builder.body(reqwest::Body::wrap_stream(body.open()?))
                }
            };
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = request.url().clone();
        Ok(Exchange::new(
            status,
            headers,
            url,
            Body::new(ReqwestBody {
                response: Some(response),
            }),
        ))
    }
}

fn map_reqwest_error(request: &Request, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout {
            url: request.url().clone(),
        }
    } else {
        Error::transport(request.method().clone(), request.url().clone(), e)
    }
}

struct ReqwestBody {
    response: Option<reqwest::Response>,
}

#[async_trait]
impl ResponseBody for ReqwestBody {
    async fn chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        match self.response.as_mut() {
            Some(response) => response.chunk().await.map_err(std::io::Error::other),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        self.response = None;
    }
}
