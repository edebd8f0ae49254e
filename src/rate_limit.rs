//! Parsing of server-supplied rate limit hints.

use http::HeaderMap;
use std::time::{Duration, SystemTime};

/// Parses the `Retry-After` header.
///
/// Supports both delay-seconds (integer) and HTTP-date formats. A date in the
/// past yields `None`.
///
/// # Examples
///
/// ```
/// use couchwire::rate_limit::retry_after;
/// use http::HeaderMap;
/// use std::time::Duration;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("retry-after", "60".parse().unwrap());
/// assert_eq!(retry_after(&headers), Some(Duration::from_secs(60)));
/// ```
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    match httpdate::parse_http_date(header) {
        Ok(date_time) => date_time.duration_since(SystemTime::now()).ok(),
        Err(_) => {
            tracing::warn!(
                retry_after = header,
                "Invalid Retry-After value from server; falling back to default backoff"
            );
            None
        }
    }
}
