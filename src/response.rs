//! Typed success envelope.
//!
//! [`Response`] carries the deserialized body of a successful call together
//! with the details of the exchange that produced it, so callers can log the
//! raw document or inspect timing without a second request.

use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// A successful, deserialized response.
///
/// # Type Parameters
///
/// * `T` - The type of the deserialized response data
///
/// # Examples
///
/// ```no_run
/// use couchwire::Client;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Animal {
///     #[serde(rename = "_id")]
///     id: String,
///     class: String,
/// }
///
/// # async fn example() -> Result<(), couchwire::Error> {
/// let client = Client::builder()
///     .base_url("http://localhost:5984")?
///     .build()?;
///
/// let response = client.get::<Animal>(&["animaldb", "zebra"]).await?;
///
/// println!("{} is a {}", response.data.id, response.data.class);
/// println!("Request took {:?}", response.latency);
/// println!("Attempts: {}", response.attempts);
///
/// if response.latency > std::time::Duration::from_secs(1) {
///     println!("Slow response body: {}", response.raw_body);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized response data.
    pub data: T,

    /// The response body exactly as received.
    pub raw_body: String,

    /// The HTTP status code of the response.
    pub status: StatusCode,

    /// The response headers.
    pub headers: HeaderMap,

    /// Time from the first attempt until the body was read, including any
    /// session renewal or back-off in between.
    pub latency: Duration,

    /// The number of attempts the call took.
    ///
    /// `1` unless an interceptor asked for a replay.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Creates a new `Response`.
    pub fn new(
        data: T,
        raw_body: String,
        status: StatusCode,
        headers: HeaderMap,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
        }
    }

    /// Maps the response data to a different type, keeping the metadata.
    ///
    /// # Examples
    ///
    /// ```
    /// # use couchwire::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response::new(
    ///     serde_json::json!({"ok": true, "rev": "1-abc"}),
    ///     r#"{"ok":true,"rev":"1-abc"}"#.to_string(),
    ///     StatusCode::CREATED,
    ///     HeaderMap::new(),
    ///     Duration::from_millis(100),
    ///     1,
    /// );
    ///
    /// let rev = response.map(|v| v["rev"].as_str().unwrap_or_default().to_string());
    /// assert_eq!(rev.data, "1-abc");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the call was replayed, for example after a session
    /// renewal or a 429 back-off.
    ///
    /// # Examples
    ///
    /// ```
    /// # use couchwire::Response;
    /// # use http::{HeaderMap, StatusCode};
    /// # use std::time::Duration;
    /// let response = Response::new(
    ///     (),
    ///     String::new(),
    ///     StatusCode::OK,
    ///     HeaderMap::new(),
    ///     Duration::from_millis(100),
    ///     2,
    /// );
    ///
    /// assert!(response.was_replayed());
    /// ```
    pub fn was_replayed(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a header value by name.
    ///
    /// # Examples
    ///
    /// ```
    /// # use couchwire::Response;
    /// # use http::{HeaderMap, StatusCode, HeaderValue};
    /// # use std::time::Duration;
    /// let mut headers = HeaderMap::new();
    /// headers.insert("etag", HeaderValue::from_static("\"1-abc\""));
    ///
    /// let response = Response::new(
    ///     (),
    ///     String::new(),
    ///     StatusCode::OK,
    ///     headers,
    ///     Duration::from_millis(100),
    ///     1,
    /// );
    ///
    /// assert_eq!(response.header("etag").unwrap(), "\"1-abc\"");
    /// ```
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }

    /// The document revision from the `ETag` header, without quotes.
    ///
    /// CouchDB sends the current revision as the entity tag when a single
    /// document is read or written. Other responses carry tags that are not
    /// revisions.
    pub fn rev(&self) -> Option<&str> {
        let etag = self.header("etag")?;
        let etag = etag.strip_prefix("W/").unwrap_or(etag);
        Some(etag.trim_matches('"')).filter(|rev| !rev.is_empty())
    }

    /// Whether the server reported the request as accepted but not yet
    /// committed (`202 Accepted`), as it does for writes when the write
    /// quorum was not met.
    pub fn is_accepted(&self) -> bool {
        self.status == StatusCode::ACCEPTED
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}
