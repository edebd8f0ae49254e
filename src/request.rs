//! Request descriptors.
//!
//! A [`Request`] describes one logical call: method, target URL, content
//! type, headers, an optional body and the interceptors that apply to this
//! request in addition to the client-wide ones. Every attempt of a call
//! (including interceptor-driven replays) starts from a fresh clone of the
//! descriptor, so interceptors never see headers left over from an earlier
//! attempt.

use crate::interceptor::{RequestInterceptor, ResponseInterceptor};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use url::Url;

/// A stream of request body bytes.
pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Produces a fresh body stream for each attempt of a request.
///
/// Implementors must return a stream positioned at the start of the body on
/// every call, so that a replayed request sends the same payload.
pub trait BodyGenerator: Send + Sync {
    /// Returns a new stream over the whole body.
    fn generate(&self) -> Result<BodyStream>;

    /// The body length in bytes, if known.
    fn content_length(&self) -> Option<u64> {
        None
    }
}

impl<F> BodyGenerator for F
where
    F: Fn() -> Result<BodyStream> + Send + Sync,
{
    fn generate(&self) -> Result<BodyStream> {
        self()
    }
}

/// A stream that can be sent exactly once.
struct OneShot(Mutex<Option<BodyStream>>);

impl BodyGenerator for OneShot {
    fn generate(&self) -> Result<BodyStream> {
        self.0.lock().take().ok_or(Error::BodyConsumed)
    }
}

/// The body of a request.
#[derive(Clone)]
pub enum RequestBody {
    /// A fully materialised body, replayable at no cost.
    Bytes(Bytes),
    /// A body produced on demand by a generator.
    Generated(Arc<dyn BodyGenerator>),
}

impl RequestBody {
    /// Wraps a stream that can only be read once.
    ///
    /// A request carrying this body fails with [`Error::BodyConsumed`] if an
    /// interceptor asks for it to be replayed.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        RequestBody::Generated(Arc::new(OneShot(Mutex::new(Some(Box::pin(stream))))))
    }

    /// Wraps a generator that can regenerate the body for replays.
    pub fn generator(generator: impl BodyGenerator + 'static) -> Self {
        RequestBody::Generated(Arc::new(generator))
    }

    /// The body length in bytes, if known.
    pub fn content_length(&self) -> Option<u64> {
        match self {
            RequestBody::Bytes(bytes) => Some(bytes.len() as u64),
            RequestBody::Generated(generator) => generator.content_length(),
        }
    }

    /// Opens the body as a stream for one attempt.
    pub fn open(&self) -> Result<BodyStream> {
        match self {
            RequestBody::Bytes(bytes) => {
                let bytes = bytes.clone();
                Ok(Box::pin(futures_util::stream::once(async move { Ok(bytes) })))
            }
            RequestBody::Generated(generator) => generator.generate(),
        }
    }

    /// Reads one attempt's worth of body into memory.
    pub async fn read_all(&self) -> Result<Bytes> {
        if let RequestBody::Bytes(bytes) = self {
            return Ok(bytes.clone());
        }
        let mut stream = self.open()?;
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| Error::BodyRead { source })?;
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RequestBody::Generated(_) => f.write_str("Generated"),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        RequestBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        RequestBody::Bytes(bytes.into())
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        RequestBody::Bytes(text.into())
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        RequestBody::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// Describes one HTTP call.
///
/// # Examples
///
/// ```
/// use couchwire::Request;
/// use http::Method;
/// use url::Url;
///
/// let url = Url::parse("http://localhost:5984/animaldb").unwrap();
/// let request = Request::new(Method::PUT, url)
///     .with_content_type("application/json")
///     .unwrap()
///     .with_body(r#"{"_id":"zebra"}"#)
///     .with_query_param("batch", "ok");
///
/// assert_eq!(request.url().as_str(), "http://localhost:5984/animaldb?batch=ok");
/// ```
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
    pub(crate) request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    pub(crate) response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
}

impl Request {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
        }
    }

    /// Sets the `Content-Type` header.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a valid header value.
    pub fn with_content_type(self, content_type: impl AsRef<str>) -> Result<Self> {
        self.with_header(CONTENT_TYPE.as_str(), content_type)
    }

    /// Adds a header, replacing any existing value of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Appends a query parameter to the URL.
    pub fn with_query_param(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.url
            .query_pairs_mut()
            .append_pair(key.as_ref(), value.as_ref());
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Appends an interceptor that runs for this request only, after the
    /// client-wide ones.
    pub fn with_request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    /// Appends a response interceptor that runs for this request only, after
    /// the client-wide ones.
    pub fn with_response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
        self.response_interceptors.push(interceptor);
        self
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the request headers, for interceptors.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// The `Content-Type` header, if set.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }

    /// The body, if any.
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Replaces the body, for interceptors.
    pub fn set_body(&mut self, body: Option<RequestBody>) {
        self.body = body;
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("request_interceptors", &self.request_interceptors.len())
            .field("response_interceptors", &self.response_interceptors.len())
            .finish()
    }
}
