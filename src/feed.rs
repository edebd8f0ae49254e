//! Continuous feeds: an open-ended stream of newline-delimited JSON records.
//!
//! A [`ContinuousFeed`] wraps the body of a long-lived response and hands out
//! one record at a time through [`has_next`](ContinuousFeed::has_next) and
//! [`next`](ContinuousFeed::next). Empty lines are heartbeats and are skipped.
//! The feed closes, releasing the connection exactly once, when:
//!
//! - the terminal `{"last_seq": ...}` summary line arrives,
//! - the stream ends,
//! - the caller stops it, or
//! - a read or parse error occurs (reported once).
//!
//! Stopping from another task goes through a [`FeedStopper`]. A read that is
//! waiting for data is abandoned immediately and the stream is closed; this
//! counts as a clean end of the feed, not an error.

use crate::codec::JsonCodec;
use crate::transport::Body;
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures_util::stream::Stream;
use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use tokio_util::sync::CancellationToken;

const TERMINAL_PREFIX: &[u8] = b"{\"last_seq\"";

/// The summary record that ends a continuous feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEnd {
    /// The sequence to resume from.
    pub last_seq: serde_json::Value,
    /// The number of changes not yet sent, when the server reports it.
    #[serde(default)]
    pub pending: Option<u64>,
}

/// Stops a [`ContinuousFeed`] from another task.
#[derive(Debug, Clone)]
pub struct FeedStopper {
    token: CancellationToken,
}

impl FeedStopper {
    /// Requests the feed to stop.
    ///
    /// A pending [`has_next`](ContinuousFeed::has_next) returns `false`
    /// promptly and the stream is released.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Returns `true` if a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

enum Line {
    Text(Bytes),
    End,
    Stopped,
}

/// A pull-based reader over a continuous feed.
///
/// # Examples
///
/// ```no_run
/// use couchwire::{Client, changes::ChangeRow};
///
/// # async fn example(client: Client) -> Result<(), couchwire::Error> {
/// let mut feed = client.changes("animaldb").since("now").continuous().await?;
/// let stopper = feed.stopper();
///
/// while feed.has_next().await? {
///     if let Some(row) = feed.next() {
///         println!("{} changed", row.id);
///         if row.id == "zebra" {
///             stopper.stop();
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct ContinuousFeed<T> {
    body: Body,
    codec: JsonCodec,
    buffer: BytesMut,
    eof: bool,
    closed: bool,
    next: Option<T>,
    end: Option<FeedEnd>,
    token: CancellationToken,
}

impl<T: DeserializeOwned> ContinuousFeed<T> {
    /// Starts reading records from a response body.
    pub fn new(body: Body, codec: JsonCodec) -> Self {
        Self {
            body,
            codec,
            buffer: BytesMut::new(),
            eof: false,
            closed: false,
            next: None,
            end: None,
            token: CancellationToken::new(),
        }
    }

    /// Waits until a record is available or the feed ends.
    ///
    /// Returns `true` when a record is ready for [`next`](Self::next). Calling
    /// it again before `next` does not read further. Returns `false` once the
    /// feed is closed, and keeps returning `false` after that.
    ///
    /// # Errors
    ///
    /// A read failure is reported as [`Error::FeedRead`] and a malformed
    /// record as [`Error::DeserializationFailed`]. Either closes the feed.
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.token.is_cancelled() {
            self.terminate("stopped");
            return Ok(false);
        }
        if self.closed {
            return Ok(false);
        }
        if self.next.is_some() {
            return Ok(true);
        }

        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(source) => {
                    self.terminate("read error");
                    return Err(Error::FeedRead { source });
                }
            };

            match line {
                Line::Text(line) => {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        tracing::trace!("Heartbeat");
                        continue;
                    }
                    if line.starts_with(TERMINAL_PREFIX) {
                        self.end = serde_json::from_slice(&line).ok();
                        self.terminate("last_seq");
                        return Ok(false);
                    }
                    match self.codec.decode::<T>(&line, StatusCode::OK) {
                        Ok(record) => {
                            self.next = Some(record);
                            return Ok(true);
                        }
                        Err(e) => {
                            self.terminate("malformed record");
                            return Err(e);
                        }
                    }
                }
                Line::End => {
                    self.terminate("end of stream");
                    return Ok(false);
                }
                Line::Stopped => {
                    self.terminate("stopped");
                    return Ok(false);
                }
            }
        }
    }

    /// Takes the record made ready by the last successful
    /// [`has_next`](Self::has_next).
    ///
    /// Returns `None` if `has_next` was not called, or returned `false`, since
    /// the previous record was taken.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<T> {
        self.next.take()
    }

    /// Stops the feed and releases the stream, discarding unread data.
    pub fn stop(&mut self) {
        self.token.cancel();
        self.terminate("stopped");
    }

    /// Returns a handle that can stop this feed from another task.
    pub fn stopper(&self) -> FeedStopper {
        FeedStopper {
            token: self.token.clone(),
        }
    }

    /// Returns `true` once the feed has ended and the stream is released.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The summary record, if the feed ended with one.
    pub fn end(&self) -> Option<&FeedEnd> {
        self.end.as_ref()
    }

    /// The sequence to resume from, if the feed ended with a summary record.
    pub fn last_seq(&self) -> Option<&serde_json::Value> {
        self.end.as_ref().map(|e| &e.last_seq)
    }

    /// Converts the feed into a [`Stream`] of records.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        futures_util::stream::unfold(self, |mut feed| async move {
            match feed.has_next().await {
                Ok(true) => feed.next().map(|record| (Ok(record), feed)),
                Ok(false) => None,
                Err(e) => Some((Err(e), feed)),
            }
        })
    }

    async fn read_line(&mut self) -> std::io::Result<Line> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let mut line = self.buffer.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                return Ok(Line::Text(line.freeze()));
            }
            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(Line::End);
                }
                return Ok(Line::Text(self.buffer.split().freeze()));
            }

            let chunk = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(Line::Stopped),
                chunk = self.body.chunk() => chunk,
            };
            match chunk {
                Ok(Some(chunk)) => self.buffer.extend_from_slice(&chunk),
                Ok(None) => self.eof = true,
                Err(_) if self.token.is_cancelled() => return Ok(Line::Stopped),
                Err(e) => return Err(e),
            }
        }
    }

    fn terminate(&mut self, why: &'static str) {
        if !self.closed {
            tracing::debug!(reason = why, "Continuous feed closed");
        }
        self.closed = true;
        self.next = None;
        self.buffer.clear();
        self.body.close();
    }
}

impl<T> fmt::Debug for ContinuousFeed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuousFeed")
            .field("closed", &self.closed)
            .field("has_record", &self.next.is_some())
            .field("end", &self.end)
            .finish()
    }
}
