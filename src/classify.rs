//! Turns a finished exchange into a body stream or a typed error.

use crate::error::HttpError;
use crate::transport::{Body, Exchange};
use crate::{Error, Result};
use serde::Deserialize;

/// The JSON error document CouchDB returns with error statuses.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorDocument {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ErrorDocument {
    /// Parses an error body. Only a JSON object counts as a structured error.
    pub(crate) fn parse(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(value @ serde_json::Value::Object(_)) => serde_json::from_value(value).ok(),
            _ => None,
        }
    }
}

/// Classifies the final exchange of a call.
///
/// A 2xx status hands the body back unread. Any other status consumes the
/// error body once, releases the connection and yields an [`Error::Http`]
/// whose kind follows the status: 404 not-found, 409 conflict, 412
/// precondition-failed, 429 too-many-requests, anything else generic.
///
/// A body that is a JSON object fills `error` and `reason`; any other body
/// is kept as raw text in `error`.
pub async fn classify(mut exchange: Exchange) -> Result<Body> {
    let status = exchange.status();
    if status.is_success() {
        return Ok(exchange.into_body());
    }

    let url = exchange.url().clone();
    let mut error = HttpError::new(status);

    if let Some(bytes) = exchange.error_body().await {
        let text = String::from_utf8_lossy(bytes).into_owned();
        error = match ErrorDocument::parse(bytes) {
            Some(doc) => error.with_error(doc.error, doc.reason),
            None if text.is_empty() => error,
            None => error.with_error(Some(text.clone()), None),
        }
        .with_raw_body(text);
    }
    drop(exchange);

    let error = error.with_url(url);
    if status.is_client_error() {
        tracing::error!(
            status = status.as_u16(),
            url = %error.url().map(|u| u.as_str()).unwrap_or_default(),
            error = error.error().unwrap_or_default(),
            reason = error.reason().unwrap_or_default(),
            "Client error (4xx)"
        );
    } else {
        tracing::warn!(
            status = status.as_u16(),
            url = %error.url().map(|u| u.as_str()).unwrap_or_default(),
            error = error.error().unwrap_or_default(),
            "Server error"
        );
    }
    Err(Error::from(error))
}
