//! The `_changes` API of a database, in normal and continuous mode.

use crate::client::Client;
use crate::feed::ContinuousFeed;
use crate::request::Request;
use crate::Result;
use http::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One revision listed in a change row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rev {
    /// The revision id.
    pub rev: String,
}

/// A single change to a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRow {
    /// The update sequence of this change. Opaque; may be a number or a string.
    pub seq: serde_json::Value,
    /// The document id.
    pub id: String,
    /// The leaf revisions, one entry unless `style=all_docs` was requested.
    #[serde(default)]
    pub changes: Vec<Rev>,
    /// `true` if the change is a deletion.
    #[serde(default)]
    pub deleted: bool,
    /// The document body, when `include_docs=true`.
    #[serde(default)]
    pub doc: Option<serde_json::Value>,
}

/// The result of a `feed=normal` changes request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResult {
    /// The changes, in sequence order.
    pub results: Vec<ChangeRow>,
    /// The sequence to resume from.
    pub last_seq: serde_json::Value,
    /// Changes remaining after this batch, when reported.
    #[serde(default)]
    pub pending: Option<u64>,
}

/// A request against a database's `_changes` endpoint.
///
/// Created by [`Client::changes`]. Each setter replaces any earlier value of
/// the same parameter.
///
/// # Examples
///
/// ```no_run
/// use couchwire::Client;
/// use std::time::Duration;
///
/// # async fn example(client: Client) -> Result<(), couchwire::Error> {
/// let result = client
///     .changes("animaldb")
///     .include_docs(true)
///     .limit(10)
///     .normal()
///     .await?;
///
/// let mut feed = client
///     .changes("animaldb")
///     .since(result.last_seq.to_string().trim_matches('"'))
///     .heartbeat(Duration::from_secs(30))
///     .continuous()
///     .await?;
/// while feed.has_next().await? {
///     let row = feed.next();
/// #   let _ = row;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Changes {
    client: Client,
    db: String,
    params: Vec<(String, String)>,
}

impl Changes {
    pub(crate) fn new(client: Client, db: impl Into<String>) -> Self {
        Self {
            client,
            db: db.into(),
            params: Vec::new(),
        }
    }

    /// Starts after the given sequence. `"now"` skips existing changes.
    pub fn since(self, since: impl Into<String>) -> Self {
        self.parameter("since", since)
    }

    /// Limits the number of changes returned.
    pub fn limit(self, limit: u64) -> Self {
        self.parameter("limit", limit.to_string())
    }

    /// Asks the server to send an empty line at this interval while idle.
    pub fn heartbeat(self, interval: Duration) -> Self {
        self.parameter("heartbeat", interval.as_millis().to_string())
    }

    /// Asks the server to end the feed after this long without changes.
    pub fn timeout(self, timeout: Duration) -> Self {
        self.parameter("timeout", timeout.as_millis().to_string())
    }

    /// Filters changes through a design document filter (`ddoc/name`).
    pub fn filter(self, filter: impl Into<String>) -> Self {
        self.parameter("filter", filter)
    }

    /// Includes the document body in each row.
    pub fn include_docs(self, include_docs: bool) -> Self {
        self.parameter("include_docs", include_docs.to_string())
    }

    /// Sets the revision style: `main_only` or `all_docs`.
    pub fn style(self, style: impl Into<String>) -> Self {
        self.parameter("style", style)
    }

    /// Returns changes in descending sequence order.
    pub fn descending(self, descending: bool) -> Self {
        self.parameter("descending", descending.to_string())
    }

    /// Sets any other query parameter, such as those read by a filter.
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == key) {
            Some(existing) => existing.1 = value,
            None => self.params.push((key, value)),
        }
        self
    }

    /// Fetches one batch of changes.
    pub async fn normal(self) -> Result<ChangesResult> {
        let request = self.request("normal")?;
        Ok(self.client.execute_as::<ChangesResult>(request).await?.data)
    }

    /// Opens a continuous feed of changes.
    pub async fn continuous(self) -> Result<ContinuousFeed<ChangeRow>> {
        let request = self.request("continuous")?;
        self.client.continuous_feed(request).await
    }

    fn request(&self, feed: &str) -> Result<Request> {
        let mut query: Vec<(&str, &str)> = vec![("feed", feed)];
        query.extend(
            self.params
                .iter()
                .filter(|(k, _)| k != "feed")
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        let url = self.client.url(&[self.db.as_str(), "_changes"], &query)?;
        Ok(Request::new(Method::GET, url))
    }
}
