//! # couchwire - request pipeline for CouchDB-compatible databases
//!
//! couchwire sends requests to CouchDB and Cloudant-compatible servers through
//! a small, explicit pipeline built on `reqwest`:
//!
//! 1. A [`Request`] describes the call.
//! 2. Request interceptors rewrite it (user agent, session cookie, your own).
//! 3. A [`Transport`] sends it and returns status, headers and a lazy [`Body`].
//! 4. Response interceptors may ask for the request to be replayed, for
//!    example after renewing an expired session or backing off on a 429.
//! 5. The classifier hands back the body of a 2xx response, or turns anything
//!    else into a typed [`Error::Http`].
//!
//! Long-lived `_changes` feeds are read one record at a time through a
//! [`ContinuousFeed`], which can be stopped from another task.
//!
//! ## Quick Start
//!
//! ```no_run
//! use couchwire::{Client, IfExists};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Animal {
//!     #[serde(rename = "_id")]
//!     id: String,
//!     class: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), couchwire::Error> {
//!     let client = Client::builder()
//!         .base_url("http://localhost:5984")?
//!         .credentials("admin", "secret")
//!         .create_if_exists(IfExists::Ignore)
//!         .build()?;
//!
//!     client.create_database("animaldb").await?;
//!
//!     let zebra = Animal { id: "zebra".to_string(), class: "mammal".to_string() };
//!     let written = client.put::<_, serde_json::Value>(&["animaldb", "zebra"], &zebra).await?;
//!     println!("Stored at rev {}", written.data["rev"]);
//!
//!     let mut feed = client.changes("animaldb").since("0").continuous().await?;
//!     while feed.has_next().await? {
//!         if let Some(row) = feed.next() {
//!             println!("{} changed", row.id);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! Non-2xx responses are classified by status and carry the server's
//! `error` and `reason`:
//!
//! ```no_run
//! use couchwire::{Client, Error, ErrorKind};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("http://localhost:5984")?.build()?;
//! match client.get::<serde_json::Value>(&["animaldb", "unicorn"]).await {
//!     Ok(response) => println!("Found: {}", response.raw_body),
//!     Err(Error::Http(e)) if e.kind() == ErrorKind::NotFound => {
//!         eprintln!("{}", e); // 404 Not Found at http://.... Error: not_found. Reason: missing.
//!     }
//!     Err(Error::Http(e)) => eprintln!("HTTP {}: {:?}", e.status(), e.error()),
//!     Err(e) if e.is_transport() => eprintln!("Server unreachable: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//!
//! The crate logs through `tracing` and installs no subscriber. Every attempt
//! is logged at `debug`, every response at `info`, failed requests, replays
//! and 429 back-offs at `warn`, and classified 4xx responses at `error`.
//! Cookie values and credentials are never logged.

pub mod auth;
pub mod changes;
mod classify;
mod client;
pub mod codec;
mod error;
pub mod feed;
pub mod interceptor;
pub mod rate_limit;
pub mod request;
mod response;
pub mod retry;
pub mod transport;
pub mod uri;

pub use classify::classify;
pub use client::{Client, ClientBuilder, IfExists};
pub use codec::JsonCodec;
pub use error::{BoxError, Error, ErrorKind, HttpError, Result};
pub use feed::{ContinuousFeed, FeedStopper};
pub use request::{Request, RequestBody};
pub use response::Response;
pub use retry::BackoffPolicy;
pub use transport::{Body, Exchange, ReqwestTransport, ResponseBody, Transport, TransportConfig};
