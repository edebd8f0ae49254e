//! Builds request URLs from a base, path segments and query parameters.

use crate::{Error, Result};
use url::Url;

/// Appends percent-encoded path segments and query pairs to a base URL.
///
/// # Examples
///
/// ```
/// use couchwire::uri::build_url;
/// use url::Url;
///
/// let base = Url::parse("http://localhost:5984/").unwrap();
/// let url = build_url(&base, &["animal db", "_changes"], &[("feed", "normal")]).unwrap();
/// assert_eq!(url.as_str(), "http://localhost:5984/animal%20db/_changes?feed=normal");
/// ```
pub fn build_url<K, V>(base: &Url, segments: &[&str], query: &[(K, V)]) -> Result<Url>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| Error::ConfigurationError(format!("{} cannot be a base URL", base)))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key.as_ref(), value.as_ref());
        }
    }
    Ok(url)
}
