//! Error types for the request pipeline.
//!
//! Every failure a caller can observe is a variant of [`Error`]. HTTP-level
//! failures (the server answered with a non-2xx status) are carried by
//! [`HttpError`], which records the semantic [`ErrorKind`], the status, the
//! request URL and whatever `error`/`reason` the server supplied. Failures that
//! happen before any status was obtained are [`Error::Transport`] or
//! [`Error::Timeout`].

use http::{Method, StatusCode};
use std::fmt;
use url::Url;

/// Boxed lower-level cause carried by transport failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for the request pipeline.
///
/// # Examples
///
/// ```no_run
/// use couchwire::{Client, Error, ErrorKind, Request};
/// use http::Method;
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://account.example.com")?
///     .build()?;
///
/// let request = Request::new(Method::GET, client.url(&["animaldb", "zebra"], &[])?);
/// match client.execute(request).await {
///     Ok(body) => println!("{}", body.text().await?),
///     Err(Error::Http(e)) if e.kind() == ErrorKind::NotFound => {
///         eprintln!("no such document: {}", e);
///     }
///     Err(e) if e.is_transport() => eprintln!("could not reach server: {}", e),
///     Err(e) => return Err(e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The server answered with a non-2xx status.
    #[error("{0}")]
    Http(Box<HttpError>),

    /// The server could not be reached, or the connection failed before a
    /// status line was read (DNS, connect, reset).
    #[error("Transport failure for {method} {url}: {source}")]
    Transport {
        /// The method of the request that failed.
        method: Method,
        /// The URL of the request that failed.
        url: Url,
        /// The underlying cause.
        #[source]
        source: BoxError,
    },

    /// The request timed out while connecting or reading.
    #[error("Request to {url} timed out")]
    Timeout {
        /// The URL of the request that timed out.
        url: Url,
    },

    /// Reading a continuous feed failed. The feed is closed.
    #[error("Error reading continuous stream: {source}")]
    FeedRead {
        /// The read error.
        #[source]
        source: std::io::Error,
    },

    /// Reading a response body failed.
    #[error("Error reading response body: {source}")]
    BodyRead {
        /// The read error.
        #[source]
        source: std::io::Error,
    },

    /// A request interceptor refused to send the request.
    #[error("Request aborted by interceptor: {reason}")]
    Aborted {
        /// The reason given by the interceptor.
        reason: String,
    },

    /// A response interceptor asked for a replay after the replay budget of
    /// the call was spent.
    #[error("Replay requested after {attempts} attempts; refusing to replay again")]
    ReplayLimitExceeded {
        /// The number of attempts made.
        attempts: usize,
    },

    /// A session could not be opened with the configured credentials.
    #[error("Failed to open session: {0}")]
    SessionFailed(String),

    /// A stream-backed request body was needed for a replay but can only be
    /// read once.
    #[error("Request body was already consumed and cannot be replayed")]
    BodyConsumed,

    /// Failed to deserialize a response body into the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Failed to serialize a request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// Invalid configuration was provided.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl Error {
    /// Builds a transport failure from any lower-level error.
    pub fn transport(
        method: Method,
        url: Url,
        source: impl Into<BoxError>,
    ) -> Self {
        Error::Transport {
            method,
            url,
            source: source.into(),
        }
    }

    /// Returns the semantic kind of an HTTP-level error.
    ///
    /// Returns `None` for errors that did not come from a response status.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Http(e) => Some(e.kind()),
            _ => None,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http(e) => Some(e.status()),
            Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the typed HTTP error, if this is one.
    pub fn as_http(&self) -> Option<&HttpError> {
        match self {
            Error::Http(e) => Some(e),
            _ => None,
        }
    }

    /// Returns `true` if the server could not be talked to at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout { .. })
    }

    /// Returns `true` if this error is potentially retryable by an outer
    /// retry policy.
    ///
    /// Transport failures, timeouts, 5xx responses and 429 are retryable.
    /// The pipeline itself never retries on this basis.
    ///
    /// # Examples
    ///
    /// ```
    /// use couchwire::{Error, HttpError};
    /// use http::StatusCode;
    ///
    /// let err = Error::from(HttpError::new(StatusCode::SERVICE_UNAVAILABLE));
    /// assert!(err.is_retryable());
    ///
    /// let err = Error::from(HttpError::new(StatusCode::CONFLICT));
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } | Error::Timeout { .. } => true,
            Error::Http(e) => {
                e.status().is_server_error() || e.kind() == ErrorKind::TooManyRequests
            }
            _ => false,
        }
    }
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        Error::Http(Box::new(e))
    }
}

/// Semantic category of a non-2xx response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Any status without a more specific kind.
    Generic,
    /// 404: the database or document does not exist.
    NotFound,
    /// 409: a revision mismatch on write.
    Conflict,
    /// 412: the resource already exists or a precondition was unmet.
    PreconditionFailed,
    /// 429: the request was rate limited.
    TooManyRequests,
}

impl ErrorKind {
    /// Maps a status code onto its kind.
    ///
    /// ```
    /// use couchwire::ErrorKind;
    /// use http::StatusCode;
    ///
    /// assert_eq!(ErrorKind::from_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
    /// assert_eq!(ErrorKind::from_status(StatusCode::BAD_GATEWAY), ErrorKind::Generic);
    /// ```
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            412 => ErrorKind::PreconditionFailed,
            429 => ErrorKind::TooManyRequests,
            _ => ErrorKind::Generic,
        }
    }
}

/// A non-2xx response, classified.
///
/// At most one of a structured error (parsed `error`/`reason`) or a raw text
/// error is recorded: when the body is not a JSON object, its text is stored
/// as [`error`](Self::error) and [`reason`](Self::reason) stays empty.
#[derive(Debug, Clone)]
pub struct HttpError {
    kind: ErrorKind,
    status: StatusCode,
    error: Option<String>,
    reason: Option<String>,
    url: Option<Url>,
    raw_body: Option<String>,
}

impl HttpError {
    /// Creates an error for the given status with no server detail.
    pub fn new(status: StatusCode) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            status,
            error: None,
            reason: None,
            url: None,
            raw_body: None,
        }
    }

    pub(crate) fn with_error(mut self, error: Option<String>, reason: Option<String>) -> Self {
        self.error = error;
        self.reason = reason;
        self
    }

    pub(crate) fn with_raw_body(mut self, raw_body: String) -> Self {
        self.raw_body = Some(raw_body);
        self
    }

    pub(crate) fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// The semantic kind derived from the status.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The HTTP status of the response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The server-supplied `error` field, or the raw body text when the body
    /// was not JSON.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The server-supplied `reason` field.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// The URL of the request that failed.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// The error body exactly as received, if one was read.
    pub fn raw_body(&self) -> Option<&str> {
        self.raw_body.as_deref()
    }
}

impl fmt::Display for HttpError {
    /// Renders `"{status} {reason phrase} at {url}. Error: {error}. Reason: {reason}."`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status.as_u16())?;
        if let Some(phrase) = self.status.canonical_reason() {
            write!(f, " {}", phrase)?;
        }
        if let Some(url) = &self.url {
            write!(f, " at {}", url)?;
        }
        f.write_str(".")?;
        if let Some(error) = &self.error {
            write!(f, " Error: {}.", error)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, " Reason: {}.", reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for HttpError {}

/// A specialized `Result` type for the request pipeline.
pub type Result<T> = std::result::Result<T, Error>;
