//! Request and response interceptors.
//!
//! Interceptors are pluggable units that observe or rewrite a request before
//! it is sent, or inspect a response after it is received. They run in
//! registration order: the client-wide interceptors first, then those attached
//! to the individual [`Request`].
//!
//! A request interceptor may [`abort`](RequestAction::Abort) the call. A
//! response interceptor may ask for the original request to be
//! [`replayed`](ResponseAction::Replay); the client accepts a bounded number
//! of replays per logical call and treats any further request as a failure.
//!
//! State that must survive across the attempts of one logical call (for
//! example "I already renewed the session for this call") lives in the
//! per-call [`Extensions`] bag exposed by both contexts.

use crate::request::Request;
use crate::transport::{Exchange, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use http::header::AUTHORIZATION;
use http::{Extensions, HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Instant;

/// What a request interceptor wants the chain to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAction {
    /// Continue with the next interceptor, then send.
    Proceed,
    /// Do not send the request; fail the call with this reason.
    Abort(String),
}

/// What a response interceptor wants the chain to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Hand the response on.
    Proceed,
    /// Discard this response and send the original request again.
    Replay,
}

/// Context handed to request interceptors for one attempt.
pub struct RequestContext<'a> {
    /// The outgoing request for this attempt. Mutations do not leak into
    /// later attempts.
    pub request: &'a mut Request,
    /// State shared by all attempts of the logical call.
    pub extensions: &'a mut Extensions,
    /// The transport the call is using, for interceptors that need to make
    /// their own requests (such as a login).
    pub transport: &'a dyn Transport,
    /// The 1-indexed attempt number.
    pub attempt: usize,
}

/// Context handed to response interceptors for one attempt.
pub struct ResponseContext<'a> {
    /// The request that produced the response.
    pub request: &'a Request,
    /// The response of this attempt.
    pub exchange: &'a mut Exchange,
    /// State shared by all attempts of the logical call.
    pub extensions: &'a mut Extensions,
    /// The transport the call is using.
    pub transport: &'a dyn Transport,
    /// The 1-indexed attempt number.
    pub attempt: usize,
}

/// Observes or rewrites requests before they are sent.
///
/// # Examples
///
/// ```
/// use couchwire::interceptor::{RequestAction, RequestContext, RequestInterceptor};
/// use http::HeaderValue;
///
/// struct Tracing;
///
/// #[async_trait::async_trait]
/// impl RequestInterceptor for Tracing {
///     async fn intercept_request(
///         &self,
///         context: &mut RequestContext<'_>,
///     ) -> couchwire::Result<RequestAction> {
///         context
///             .request
///             .headers_mut()
///             .insert("x-trace", HeaderValue::from_static("on"));
///         Ok(RequestAction::Proceed)
///     }
/// }
/// ```
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    /// Inspects or modifies the outgoing request.
    async fn intercept_request(&self, context: &mut RequestContext<'_>) -> Result<RequestAction>;
}

/// Inspects responses after they are received.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    /// Inspects the response and decides whether to replay the request.
    async fn intercept_response(&self, context: &mut ResponseContext<'_>)
        -> Result<ResponseAction>;
}

/// Adds a `User-Agent` header identifying this library and platform.
#[derive(Debug, Clone)]
pub struct UserAgentInterceptor {
    user_agent: http::HeaderValue,
}

impl UserAgentInterceptor {
    /// Creates the interceptor with the default agent string,
    /// `couchwire/{version}/{os}/{arch}`.
    pub fn new() -> Self {
        let agent = format!(
            "{}/{}/{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        Self {
            user_agent: http::HeaderValue::from_str(&agent)
                .unwrap_or_else(|_| http::HeaderValue::from_static(env!("CARGO_PKG_NAME"))),
        }
    }

    /// The agent string sent with each request.
    pub fn user_agent(&self) -> &str {
        self.user_agent.to_str().unwrap_or_default()
    }
}

impl Default for UserAgentInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestInterceptor for UserAgentInterceptor {
    async fn intercept_request(&self, context: &mut RequestContext<'_>) -> Result<RequestAction> {
        context
            .request
            .headers_mut()
            .insert(http::header::USER_AGENT, self.user_agent.clone());
        Ok(RequestAction::Proceed)
    }
}

/// Sends `Authorization: Basic` credentials with every request.
///
/// An alternative to cookie sessions for servers that accept basic
/// authentication on each request.
#[derive(Clone)]
pub struct BasicAuthInterceptor {
    authorization: HeaderValue,
}

impl BasicAuthInterceptor {
    /// Creates the interceptor for the given user and password.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the encoded credentials do not form a
    /// valid header value.
    pub fn new(username: &str, password: &str) -> Result<Self> {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        let mut authorization = HeaderValue::from_str(&format!("Basic {}", encoded))
            .map_err(|e| Error::ConfigurationError(format!("Invalid credentials: {}", e)))?;
        authorization.set_sensitive(true);
        Ok(Self { authorization })
    }
}

impl std::fmt::Debug for BasicAuthInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuthInterceptor").finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestInterceptor for BasicAuthInterceptor {
    async fn intercept_request(&self, context: &mut RequestContext<'_>) -> Result<RequestAction> {
        context
            .request
            .headers_mut()
            .insert(AUTHORIZATION, self.authorization.clone());
        Ok(RequestAction::Proceed)
    }
}

/// The client-wide interceptors, default headers and replay budget that one
/// logical call runs through.
#[derive(Clone, Default)]
pub(crate) struct InterceptorChain {
    pub(crate) default_headers: HeaderMap,
    pub(crate) request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    pub(crate) response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    pub(crate) max_replays: usize,
}

impl InterceptorChain {
    /// Runs attempts until no interceptor asks for a replay, or the budget is
    /// spent. Returns the final exchange and the number of attempts.
    pub(crate) async fn run(
        &self,
        transport: &dyn Transport,
        request: Request,
    ) -> Result<(Exchange, usize)> {
        let mut extensions = Extensions::new();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut outgoing = request.clone();
            for (name, value) in &self.default_headers {
                if !outgoing.headers().contains_key(name) {
                    outgoing.headers_mut().insert(name.clone(), value.clone());
                }
            }

            let request_chain = self
                .request_interceptors
                .iter()
                .chain(request.request_interceptors.iter());
            for interceptor in request_chain {
                let mut context = RequestContext {
                    request: &mut outgoing,
                    extensions: &mut extensions,
                    transport,
                    attempt,
                };
                if let RequestAction::Abort(reason) =
                    interceptor.intercept_request(&mut context).await?
                {
                    tracing::warn!(
                        method = %outgoing.method(),
                        url = %outgoing.url(),
                        reason = %reason,
                        "Request aborted by interceptor"
                    );
                    return Err(Error::Aborted { reason });
                }
            }

            tracing::debug!(
                method = %outgoing.method(),
                url = %outgoing.url(),
                attempt = attempt,
                "Executing HTTP request"
            );

            let sent_at = Instant::now();
            let mut exchange = match transport.send(&outgoing).await {
                Ok(exchange) => exchange,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        method = %outgoing.method(),
                        url = %outgoing.url(),
                        "Request failed"
                    );
                    return Err(e);
                }
            };

            tracing::info!(
                status = exchange.status().as_u16(),
                latency_ms = sent_at.elapsed().as_millis(),
                attempt = attempt,
                "Received HTTP response"
            );

            let mut replay = false;
            let response_chain = self
                .response_interceptors
                .iter()
                .chain(request.response_interceptors.iter());
            for interceptor in response_chain {
                let mut context = ResponseContext {
                    request: &outgoing,
                    exchange: &mut exchange,
                    extensions: &mut extensions,
                    transport,
                    attempt,
                };
                if interceptor.intercept_response(&mut context).await? == ResponseAction::Replay {
                    replay = true;
                    break;
                }
            }

            if !replay {
                return Ok((exchange, attempt));
            }

            if attempt <= self.max_replays {
                tracing::debug!(
                    status = exchange.status().as_u16(),
                    attempt = attempt,
                    "Replaying request"
                );
                exchange.discard().await;
                continue;
            }

            tracing::warn!(
                status = exchange.status().as_u16(),
                attempts = attempt,
                max_replays = self.max_replays,
                "Replay requested after the replay budget was spent"
            );
            if exchange.status().is_success() {
                return Err(Error::ReplayLimitExceeded { attempts: attempt });
            }
            return Ok((exchange, attempt));
        }
    }
}

/// A transport that sends each request through an [`InterceptorChain`] before
/// it reaches the wire. Used for requests an interceptor makes on its own
/// behalf, such as a login.
pub(crate) struct ChainedTransport<'a> {
    pub(crate) transport: &'a dyn Transport,
    pub(crate) chain: &'a InterceptorChain,
}

#[async_trait]
impl Transport for ChainedTransport<'_> {
    async fn send(&self, request: &Request) -> Result<Exchange> {
        let (exchange, _) = self.chain.run(self.transport, request.clone()).await?;
        Ok(exchange)
    }
}
