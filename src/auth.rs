//! Cookie session authentication.
//!
//! [`CookieInterceptor`] is registered as both a request and a response
//! interceptor. It logs in lazily before the first guarded request, attaches
//! the session cookie to every request, and when a response says the session
//! has expired it logs in again and asks the chain to replay the original
//! request once.
//!
//! How a session is obtained is delegated to a [`SessionProvider`]:
//! [`PasswordSession`] posts a name and password to `/_session`, while
//! [`IamSession`] exchanges an API key for an IAM token and posts that to
//! `/_iam_session`.
//!
//! # Session state
//!
//! ```text
//! NoSession --login--> HasSession --expiry--> Renewing --login--> HasSession
//!      \                                          |
//!       `--login fails--> Failed <--login fails---'
//! ```
//!
//! The session is shared by every request of a client. Reads are atomic
//! snapshots; logging in is serialized by a mutex. A request that finds a
//! login in flight waits for it and then uses its result. A request that sees
//! an expiry signal only logs in if nobody replaced the session it sent in
//! the meantime; otherwise it replays straight away with the newer cookie.
//! Once in `Failed`, no further logins are attempted and requests are sent
//! without a cookie.
//!
//! The login requests themselves run through the client's other interceptors,
//! so they carry the user agent and are backed off on 429 like any request.

use crate::classify::{classify, ErrorDocument};
use crate::interceptor::{
    ChainedTransport, InterceptorChain, RequestAction, RequestContext, RequestInterceptor,
    ResponseAction, ResponseContext, ResponseInterceptor,
};
use crate::request::Request;
use crate::transport::{Exchange, Transport};
use crate::uri::build_url;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cookie::Cookie;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::RwLock;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Default IAM token endpoint.
pub const DEFAULT_IAM_SERVER_URL: &str = "https://iam.cloud.ibm.com/identity/token";

/// Obtains session cookies from the server.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Performs the login call and returns the cookies of the new session.
    ///
    /// Returns [`Error::SessionFailed`] if the server refused the credentials.
    async fn open_session(&self, transport: &dyn Transport) -> Result<Vec<(String, String)>>;
}

/// Logs in with a name and password against `/_session`.
pub struct PasswordSession {
    session_url: Url,
    form: String,
}

impl PasswordSession {
    /// Creates a provider for the server at `base_url`.
    pub fn new(base_url: &Url, name: &str, password: &str) -> Result<Self> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("name", name)
            .append_pair("password", password)
            .finish();
        Ok(Self {
            session_url: build_url::<&str, &str>(base_url, &["_session"], &[])?,
            form,
        })
    }
}

#[async_trait]
impl SessionProvider for PasswordSession {
    async fn open_session(&self, transport: &dyn Transport) -> Result<Vec<(String, String)>> {
        let (headers, body) = post_for_session(
            transport,
            &self.session_url,
            "application/x-www-form-urlencoded",
            Bytes::from(self.form.clone()),
        )
        .await?;
        started_session_cookies(&headers, &body)
    }
}

/// Logs in with an IAM API key against `/_iam_session`.
pub struct IamSession {
    session_url: Url,
    iam_server_url: Url,
    token_request: String,
}

impl IamSession {
    /// Creates a provider for the server at `base_url`, using the given IAM
    /// token endpoint.
    pub fn new(base_url: &Url, api_key: &str, iam_server_url: Url) -> Result<Self> {
        let token_request = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "urn:ibm:params:oauth:grant-type:apikey")
            .append_pair("response_type", "cloud_iam")
            .append_pair("apikey", api_key)
            .finish();
        Ok(Self {
            session_url: build_url::<&str, &str>(base_url, &["_iam_session"], &[])?,
            iam_server_url,
            token_request,
        })
    }
}

#[async_trait]
impl SessionProvider for IamSession {
    async fn open_session(&self, transport: &dyn Transport) -> Result<Vec<(String, String)>> {
        let (_, token) = post_for_session(
            transport,
            &self.iam_server_url,
            "application/x-www-form-urlencoded",
            Bytes::from(self.token_request.clone()),
        )
        .await?;
        let (headers, body) =
            post_for_session(transport, &self.session_url, "application/json", token).await?;
        started_session_cookies(&headers, &body)
    }
}

async fn post_for_session(
    transport: &dyn Transport,
    url: &Url,
    content_type: &str,
    body: Bytes,
) -> Result<(HeaderMap, Bytes)> {
    let request = Request::new(Method::POST, url.clone())
        .with_content_type(content_type)?
        .with_header("accept", "application/json")?
        .with_body(body);
    let exchange: Exchange = transport.send(&request).await?;
    let headers = exchange.headers().clone();
    let body = classify(exchange).await.map_err(|e| match e {
        Error::Http(e) => Error::SessionFailed(e.to_string()),
        other => other,
    })?;
    Ok((headers, body.bytes().await?))
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(default)]
    ok: bool,
}

fn started_session_cookies(headers: &HeaderMap, body: &[u8]) -> Result<Vec<(String, String)>> {
    let started = serde_json::from_slice::<SessionResponse>(body)
        .map(|r| r.ok)
        .unwrap_or(false);
    if !started {
        return Err(Error::SessionFailed(
            "session response did not contain \"ok\": true".to_string(),
        ));
    }
    let cookies = parse_set_cookies(headers);
    if cookies.is_empty() {
        return Err(Error::SessionFailed(
            "session response carried no cookie".to_string(),
        ));
    }
    Ok(cookies)
}

fn parse_set_cookies(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for value in headers.get_all(SET_COOKIE).iter() {
        match value.to_str().map(Cookie::parse) {
            Ok(Ok(cookie)) => out.push((cookie.name().to_string(), cookie.value().to_string())),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to parse Set-Cookie header"),
            Err(_) => tracing::warn!("Invalid Set-Cookie header (non-UTF8)"),
        }
    }
    out
}

/// A response that means "the session expired, log in again".
///
/// Both the status and the `error` field of the JSON body must match; a
/// response with the same status and any other error is a real failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirySignal {
    /// The status of the expiry response.
    pub status: StatusCode,
    /// The `error` field of the expiry response body.
    pub error: String,
}

impl ExpirySignal {
    /// Creates a signal for the given status and error code.
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    /// The signals CouchDB and Cloudant send for missing or expired cookies.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(StatusCode::UNAUTHORIZED, "unauthorized"),
            Self::new(StatusCode::FORBIDDEN, "credentials_expired"),
        ]
    }
}

/// Observable state of a [`CookieInterceptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No login has happened yet.
    NoSession,
    /// A session cookie is held.
    HasSession,
    /// A login is in flight.
    Renewing,
    /// Logging in failed; no further attempts are made.
    Failed,
}

struct Session {
    cookies: Vec<(String, String)>,
    header: HeaderValue,
    generation: u64,
}

enum State {
    NoSession,
    HasSession(Session),
    Renewing,
    Failed,
}

enum Snapshot {
    Session(HeaderValue, u64),
    Missing,
    Failed,
}

/// The session generation a request was sent with.
#[derive(Clone, Copy)]
struct SentGeneration(u64);

/// Marks a call whose session was already renewed once.
#[derive(Clone, Copy)]
struct SessionRenewed;

/// Attaches session cookies to requests and renews expired sessions.
///
/// # Examples
///
/// ```no_run
/// use couchwire::auth::{CookieInterceptor, PasswordSession};
/// use std::sync::Arc;
/// use url::Url;
///
/// # fn example() -> couchwire::Result<()> {
/// let base = Url::parse("https://account.example.com")?;
/// let cookies = Arc::new(CookieInterceptor::new(PasswordSession::new(
///     &base, "admin", "secret",
/// )?));
///
/// let client = couchwire::Client::builder()
///     .base_url(base.as_str())?
///     .request_interceptor(cookies.clone())
///     .response_interceptor(cookies)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct CookieInterceptor {
    provider: Box<dyn SessionProvider>,
    state: RwLock<State>,
    renewal: tokio::sync::Mutex<()>,
    generations: AtomicU64,
    expiry_signals: Vec<ExpirySignal>,
    login_chain: InterceptorChain,
}

impl CookieInterceptor {
    /// Creates an interceptor using the given login flow and the default
    /// expiry signals.
    pub fn new(provider: impl SessionProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            state: RwLock::new(State::NoSession),
            renewal: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
            expiry_signals: ExpirySignal::defaults(),
            login_chain: InterceptorChain::default(),
        }
    }

    /// Replaces the responses that count as session expiry.
    pub fn with_expiry_signals(mut self, signals: Vec<ExpirySignal>) -> Self {
        self.expiry_signals = signals;
        self
    }

    /// Sends login requests through the given interceptors instead of
    /// straight to the transport.
    pub(crate) fn with_login_chain(mut self, chain: InterceptorChain) -> Self {
        self.login_chain = chain;
        self
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        match &*self.state.read() {
            State::NoSession => SessionState::NoSession,
            State::HasSession(_) => SessionState::HasSession,
            State::Renewing => SessionState::Renewing,
            State::Failed => SessionState::Failed,
        }
    }

    fn snapshot(&self) -> Snapshot {
        match &*self.state.read() {
            State::HasSession(session) => {
                Snapshot::Session(session.header.clone(), session.generation)
            }
            State::NoSession | State::Renewing => Snapshot::Missing,
            State::Failed => Snapshot::Failed,
        }
    }

    /// Waits for any login in flight, then logs in if there is still no
    /// session.
    async fn establish(&self, transport: &dyn Transport) -> Option<(HeaderValue, u64)> {
        let _guard = self.renewal.lock().await;
        match self.snapshot() {
            Snapshot::Session(header, generation) => Some((header, generation)),
            Snapshot::Missing => self.login(transport).await,
            Snapshot::Failed => None,
        }
    }

    /// Performs one login. Callers must hold the renewal lock.
    async fn login(&self, transport: &dyn Transport) -> Option<(HeaderValue, u64)> {
        *self.state.write() = State::Renewing;
        tracing::debug!("Requesting session cookie");

        let chained = ChainedTransport {
            transport,
            chain: &self.login_chain,
        };
        let result = self
            .provider
            .open_session(&chained)
            .await
            .and_then(|cookies| {
                let header = cookie_header(&cookies)?;
                Ok((cookies, header))
            });

        match result {
            Ok((cookies, header)) => {
                let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                *self.state.write() = State::HasSession(Session {
                    cookies,
                    header: header.clone(),
                    generation,
                });
                tracing::debug!(generation, "Session cookie obtained");
                Some((header, generation))
            }
            Err(e) => {
                *self.state.write() = State::Failed;
                tracing::error!(
                    error = %e,
                    "Failed to obtain session cookie; no further logins will be attempted"
                );
                None
            }
        }
    }

    async fn is_expiry(&self, exchange: &mut Exchange) -> bool {
        let status = exchange.status();
        if !self.expiry_signals.iter().any(|s| s.status == status) {
            return false;
        }
        let Some(document) = exchange.error_body().await.and_then(|b| ErrorDocument::parse(b))
        else {
            return false;
        };
        let Some(error) = document.error else {
            return false;
        };
        self.expiry_signals
            .iter()
            .any(|s| s.status == status && s.error == error)
    }

    /// Picks up re-issued session cookies from an ordinary response.
    fn refresh(&self, headers: &HeaderMap) {
        let issued = parse_set_cookies(headers);
        if issued.is_empty() {
            return;
        }
        let mut state = self.state.write();
        let State::HasSession(session) = &*state else {
            return;
        };
        let mut cookies = session.cookies.clone();
        let mut changed = false;
        for (name, value) in issued {
            if let Some(existing) = cookies.iter_mut().find(|(n, _)| *n == name) {
                if existing.1 != value {
                    existing.1 = value;
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }
        match cookie_header(&cookies) {
            Ok(header) => {
                let generation = session.generation;
                *state = State::HasSession(Session {
                    cookies,
                    header,
                    generation,
                });
                tracing::trace!("Stored refreshed session cookie");
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring unusable refreshed cookie"),
        }
    }
}

fn cookie_header(cookies: &[(String, String)]) -> Result<HeaderValue> {
    let joined = cookies
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::from_str(&joined)
        .map_err(|e| Error::SessionFailed(format!("invalid session cookie: {}", e)))
}

impl fmt::Debug for CookieInterceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieInterceptor")
            .field("state", &self.state())
            .field("expiry_signals", &self.expiry_signals)
            .finish()
    }
}

#[async_trait]
impl RequestInterceptor for CookieInterceptor {
    async fn intercept_request(&self, context: &mut RequestContext<'_>) -> Result<RequestAction> {
        let session = match self.snapshot() {
            Snapshot::Session(header, generation) => Some((header, generation)),
            Snapshot::Missing => self.establish(context.transport).await,
            Snapshot::Failed => None,
        };
        if let Some((header, generation)) = session {
            context.request.headers_mut().insert(COOKIE, header);
            context.extensions.insert(SentGeneration(generation));
        }
        Ok(RequestAction::Proceed)
    }
}

#[async_trait]
impl ResponseInterceptor for CookieInterceptor {
    async fn intercept_response(
        &self,
        context: &mut ResponseContext<'_>,
    ) -> Result<ResponseAction> {
        if matches!(self.snapshot(), Snapshot::Failed) {
            return Ok(ResponseAction::Proceed);
        }

        if !self.is_expiry(context.exchange).await {
            self.refresh(context.exchange.headers());
            return Ok(ResponseAction::Proceed);
        }

        if context.extensions.get::<SessionRenewed>().is_some() {
            tracing::warn!(
                status = context.exchange.status().as_u16(),
                url = %context.exchange.url(),
                "Session expired again after renewal; giving up on cookie authentication"
            );
            let _guard = self.renewal.lock().await;
            *self.state.write() = State::Failed;
            return Ok(ResponseAction::Proceed);
        }
        context.extensions.insert(SessionRenewed);

        let sent = context.extensions.get::<SentGeneration>().map(|g| g.0);
        let _guard = self.renewal.lock().await;
        match (sent, self.snapshot()) {
            (_, Snapshot::Failed) => return Ok(ResponseAction::Proceed),
            (Some(sent), Snapshot::Session(_, current)) if current != sent => {
                tracing::debug!("Session already renewed by another request");
                return Ok(ResponseAction::Replay);
            }
            _ => {}
        }

        tracing::debug!("Session cookie was invalid; requesting a new one");
        match self.login(context.transport).await {
            Some(_) => Ok(ResponseAction::Replay),
            None => Ok(ResponseAction::Proceed),
        }
    }
}
