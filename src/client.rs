//! The client: interceptor chain, dispatch loop and typed helpers.
//!
//! The [`Client`] type is the main entry point for making requests.
//! Use [`ClientBuilder`] to configure and create clients.

use crate::{
    auth::{CookieInterceptor, ExpirySignal, IamSession, PasswordSession, SessionState},
    changes::Changes,
    classify::classify,
    codec::JsonCodec,
    feed::ContinuousFeed,
    interceptor::{
        InterceptorChain, RequestInterceptor, ResponseInterceptor, UserAgentInterceptor,
    },
    request::Request,
    retry::{BackoffPolicy, Replay429Interceptor},
    transport::{Body, Exchange, ReqwestTransport, Transport, TransportConfig},
    uri::build_url,
    Error, ErrorKind, Response, Result,
};
use http::{header::ACCEPT, HeaderMap, HeaderName, HeaderValue, Method};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// What [`Client::create_database`] does when the database already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IfExists {
    /// Fail with [`ErrorKind::PreconditionFailed`].
    #[default]
    Error,
    /// Treat the existing database as created.
    Ignore,
}

/// A client for a CouchDB-compatible server.
///
/// The client is cheap to clone and meant to be shared: clones use the same
/// connection pool and the same session.
///
/// # Examples
///
/// ```no_run
/// use couchwire::{Client, Response};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Animal {
///     #[serde(rename = "_id")]
///     id: String,
///     class: String,
/// }
///
/// #[derive(Deserialize)]
/// struct WriteResult {
///     id: String,
///     rev: String,
/// }
///
/// # async fn example() -> Result<(), couchwire::Error> {
/// let client = Client::builder()
///     .base_url("https://account.example.com")?
///     .credentials("admin", "secret")
///     .build()?;
///
/// let zebra = Animal { id: "zebra".to_string(), class: "mammal".to_string() };
/// let written: Response<WriteResult> = client.put(&["animaldb", "zebra"], &zebra).await?;
/// println!("Stored {} at {}", written.data.id, written.data.rev);
///
/// let read: Response<Animal> = client.get(&["animaldb", "zebra"]).await?;
/// println!("{} is a {}", read.data.id, read.data.class);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: Url,
    chain: InterceptorChain,
    codec: JsonCodec,
    if_exists: IfExists,
    session: Option<Arc<CookieInterceptor>>,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use couchwire::Client;
    ///
    /// # async fn example() -> Result<(), couchwire::Error> {
    /// let client = Client::builder()
    ///     .base_url("http://localhost:5984")?
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Executes a request and returns the response body unread.
    ///
    /// Runs the interceptor chain, sends the request, replays it when an
    /// interceptor asks for it and the replay budget allows, and classifies
    /// the final response.
    ///
    /// # Errors
    ///
    /// - [`Error::Http`] for any non-2xx final status, with the kind derived
    ///   from the status and the server's `error`/`reason` when supplied.
    /// - [`Error::Transport`] or [`Error::Timeout`] when the server could not
    ///   be reached.
    /// - [`Error::Aborted`] when a request interceptor refused to send.
    /// - [`Error::ReplayLimitExceeded`] when a replay was requested for a 2xx
    ///   response after the budget was spent.
    pub async fn execute(&self, request: Request) -> Result<Body> {
        let (exchange, _) = self.dispatch(request).await?;
        classify(exchange).await
    }

    /// Executes a request and deserializes the response body.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use couchwire::{Client, Request};
    /// use http::Method;
    ///
    /// # async fn example(client: Client) -> Result<(), couchwire::Error> {
    /// let url = client.url(&["_all_dbs"], &[("limit", "10")])?;
    /// let dbs = client.execute_as::<Vec<String>>(Request::new(Method::GET, url)).await?;
    /// println!("{} databases", dbs.data.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute_as<T>(&self, request: Request) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let start_time = Instant::now();
        let (exchange, attempts) = self.dispatch(request).await?;
        let status = exchange.status();
        let headers = exchange.headers().clone();

        let bytes = classify(exchange).await?.bytes().await?;
        let data = self.inner.codec.decode(&bytes, status)?;
        Ok(Response::new(
            data,
            String::from_utf8_lossy(&bytes).into_owned(),
            status,
            headers,
            start_time.elapsed(),
            attempts,
        ))
    }

    /// Executes a request whose response is a continuous feed of
    /// newline-delimited JSON records.
    ///
    /// Errors are reported as for [`execute`](Self::execute); once the feed
    /// is open, read errors surface from
    /// [`ContinuousFeed::has_next`].
    pub async fn continuous_feed<T>(&self, request: Request) -> Result<ContinuousFeed<T>>
    where
        T: DeserializeOwned,
    {
        let body = self.execute(request).await?;
        Ok(ContinuousFeed::new(body, self.inner.codec.clone()))
    }

    /// Builds a URL below the base URL. Segments are percent-encoded.
    pub fn url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        build_url(&self.inner.base_url, segments, query)
    }

    /// GETs a JSON document.
    pub async fn get<T>(&self, path: &[&str]) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let request = Request::new(Method::GET, self.path_url(path)?);
        self.execute_as(request).await
    }

    /// PUTs a value as JSON.
    pub async fn put<B, T>(&self, path: &[&str], body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.json_request(Method::PUT, path, body)?;
        self.execute_as(request).await
    }

    /// POSTs a value as JSON.
    pub async fn post<B, T>(&self, path: &[&str], body: &B) -> Result<Response<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let request = self.json_request(Method::POST, path, body)?;
        self.execute_as(request).await
    }

    /// Sends a DELETE.
    ///
    /// Deleting a document needs its revision; build the request with
    /// [`url`](Self::url) and `("rev", ..)` and use
    /// [`execute_as`](Self::execute_as) for that.
    pub async fn delete<T>(&self, path: &[&str]) -> Result<Response<T>>
    where
        T: DeserializeOwned,
    {
        let request = Request::new(Method::DELETE, self.path_url(path)?);
        self.execute_as(request).await
    }

    /// Starts a request against a database's `_changes` feed.
    pub fn changes(&self, db: impl Into<String>) -> Changes {
        Changes::new(self.clone(), db)
    }

    /// Creates a database.
    ///
    /// Returns `true` if the database was created. When it already exists the
    /// outcome depends on [`ClientBuilder::create_if_exists`]: with
    /// [`IfExists::Ignore`] this returns `false`, otherwise it fails with
    /// [`ErrorKind::PreconditionFailed`].
    pub async fn create_database(&self, name: &str) -> Result<bool> {
        let request = Request::new(Method::PUT, self.path_url(&[name])?);
        match self.execute(request).await {
            Ok(body) => {
                body.bytes().await?;
                Ok(true)
            }
            Err(e)
                if e.kind() == Some(ErrorKind::PreconditionFailed)
                    && self.inner.if_exists == IfExists::Ignore =>
            {
                tracing::debug!(db = name, "Database already exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes a database.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        let request = Request::new(Method::DELETE, self.path_url(&[name])?);
        self.execute(request).await?.bytes().await?;
        Ok(())
    }

    /// The state of the cookie session, if the client authenticates with one.
    pub fn session_state(&self) -> Option<SessionState> {
        self.inner.session.as_ref().map(|s| s.state())
    }

    /// The base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    fn path_url(&self, path: &[&str]) -> Result<Url> {
        self.url(path, &[])
    }

    fn json_request<B>(&self, method: Method, path: &[&str], body: &B) -> Result<Request>
    where
        B: Serialize + ?Sized,
    {
        let bytes = self.inner.codec.encode(body)?;
        Ok(Request::new(method, self.path_url(path)?)
            .with_content_type("application/json")?
            .with_body(bytes))
    }

    async fn dispatch(&self, request: Request) -> Result<(Exchange, usize)> {
        self.inner
            .chain
            .run(self.inner.transport.as_ref(), request)
            .await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("request_interceptors", &self.inner.chain.request_interceptors.len())
            .field("response_interceptors", &self.inner.chain.response_interceptors.len())
            .field("max_replays", &self.inner.chain.max_replays)
            .field("session", &self.session_state())
            .finish()
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use couchwire::{BackoffPolicy, ClientBuilder};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), couchwire::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://account.example.com")?
///     .iam_api_key("my-api-key")
///     .connect_timeout(Duration::from_secs(10))
///     .read_timeout(Duration::from_secs(60))
///     .too_many_requests_backoff(BackoffPolicy::default())
///     .default_header("X-Cloudant-User", "reader")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    credentials: Option<(String, String)>,
    iam_api_key: Option<String>,
    iam_server_url: Option<Url>,
    expiry_signals: Option<Vec<ExpirySignal>>,
    transport_config: TransportConfig,
    transport: Option<Arc<dyn Transport>>,
    request_interceptors: Vec<Arc<dyn RequestInterceptor>>,
    response_interceptors: Vec<Arc<dyn ResponseInterceptor>>,
    backoff: Option<BackoffPolicy>,
    max_replays: usize,
    codec: JsonCodec,
    user_agent: bool,
    if_exists: IfExists,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            credentials: None,
            iam_api_key: None,
            iam_server_url: None,
            expiry_signals: None,
            transport_config: TransportConfig::default(),
            transport: None,
            request_interceptors: Vec::new(),
            response_interceptors: Vec::new(),
            backoff: None,
            max_replays: 1,
            codec: JsonCodec::new(),
            user_agent: true,
            if_exists: IfExists::Error,
        }
    }

    /// Sets the server URL all requests are resolved against.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Authenticates with a name and password through a `_session` cookie.
    pub fn credentials(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some((name.into(), password.into()));
        self
    }

    /// Authenticates with an IAM API key through an `_iam_session` cookie.
    pub fn iam_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.iam_api_key = Some(api_key.into());
        self
    }

    /// Overrides the IAM token endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn iam_server_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.iam_server_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Replaces the responses that count as session expiry.
    pub fn session_expiry_signals(mut self, signals: Vec<ExpirySignal>) -> Self {
        self.expiry_signals = Some(signals);
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport_config.connect_timeout = Some(timeout);
        self
    }

    /// Sets the timeout for each read from the connection.
    ///
    /// Continuous feeds should use a heartbeat shorter than this.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.transport_config.read_timeout = Some(timeout);
        self
    }

    /// Routes requests through an HTTP proxy.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn proxy(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.transport_config.proxy = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Sets basic auth credentials for the proxy.
    pub fn proxy_credentials(
        mut self,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.transport_config.proxy_credentials = Some((user.into(), password.into()));
        self
    }

    /// Limits the idle connections kept per host.
    pub fn max_idle_connections(mut self, max: usize) -> Self {
        self.transport_config.max_idle_connections = Some(max);
        self
    }

    /// Adds a header sent with every request unless the request sets it.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(
        mut self,
        name: impl AsRef<str>,
        value: impl AsRef<str>,
    ) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Adds a request interceptor that runs for every request, after the
    /// built-in ones.
    pub fn request_interceptor(mut self, interceptor: Arc<dyn RequestInterceptor>) -> Self {
        self.request_interceptors.push(interceptor);
        self
    }

    /// Adds a response interceptor that runs for every request, after the
    /// built-in ones.
    pub fn response_interceptor(mut self, interceptor: Arc<dyn ResponseInterceptor>) -> Self {
        self.response_interceptors.push(interceptor);
        self
    }

    /// Replays requests answered with 429 after backing off.
    ///
    /// The policy's replays are added to the replay budget of each call.
    pub fn too_many_requests_backoff(mut self, policy: BackoffPolicy) -> Self {
        self.backoff = Some(policy);
        self
    }

    /// Sets how many replays one call may make before a further replay
    /// request is refused. Defaults to 1, enough for one session renewal.
    pub fn max_replays(mut self, max_replays: usize) -> Self {
        self.max_replays = max_replays;
        self
    }

    /// Sets the JSON codec used for request and response bodies.
    pub fn codec(mut self, codec: JsonCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Enables or disables the `User-Agent` header. Enabled by default.
    pub fn user_agent(mut self, enabled: bool) -> Self {
        self.user_agent = enabled;
        self
    }

    /// Sets what [`Client::create_database`] does for an existing database.
    pub fn create_if_exists(mut self, if_exists: IfExists) -> Self {
        self.if_exists = if_exists;
        self
    }

    /// Sends requests through a custom transport instead of the built-in
    /// `reqwest` one. Timeout and proxy settings are then ignored.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL was provided, if both password and IAM
    /// credentials were set, or if the transport cannot be built.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        if self.transport_config.proxy_credentials.is_some()
            && self.transport_config.proxy.is_none()
        {
            return Err(Error::ConfigurationError(
                "Proxy credentials require a proxy".to_string(),
            ));
        }

        let session = match (self.credentials, self.iam_api_key) {
            (Some(_), Some(_)) => {
                return Err(Error::ConfigurationError(
                    "Set either credentials or an IAM API key, not both".to_string(),
                ))
            }
            (Some((name, password)), None) => Some(CookieInterceptor::new(PasswordSession::new(
                &base_url, &name, &password,
            )?)),
            (None, Some(api_key)) => {
                let iam_server_url = match self.iam_server_url {
                    Some(url) => url,
                    None => Url::parse(crate::auth::DEFAULT_IAM_SERVER_URL)?,
                };
                Some(CookieInterceptor::new(IamSession::new(
                    &base_url,
                    &api_key,
                    iam_server_url,
                )?))
            }
            (None, None) => None,
        };

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(&self.transport_config)?),
        };

        let mut default_headers = self.default_headers;
        if !default_headers.contains_key(ACCEPT) {
            default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        // Everything but the session itself; logins run through this chain.
        let mut others = InterceptorChain {
            default_headers,
            max_replays: self.max_replays,
            ..InterceptorChain::default()
        };
        if self.user_agent {
            others
                .request_interceptors
                .push(Arc::new(UserAgentInterceptor::new()));
        }
        if let Some(policy) = self.backoff {
            others.max_replays += policy.max_replays;
            others
                .response_interceptors
                .push(Arc::new(Replay429Interceptor::new(policy)));
        }
        others.request_interceptors.extend(self.request_interceptors);
        others.response_interceptors.extend(self.response_interceptors);

        let session = session.map(|s| {
            let s = match self.expiry_signals {
                Some(signals) => s.with_expiry_signals(signals),
                None => s,
            };
            Arc::new(s.with_login_chain(others.clone()))
        });

        let mut chain = others;
        if let Some(session) = &session {
            let position = usize::from(self.user_agent);
            chain
                .request_interceptors
                .insert(position, session.clone() as Arc<dyn RequestInterceptor>);
            chain
                .response_interceptors
                .insert(0, session.clone() as Arc<dyn ResponseInterceptor>);
        }

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                base_url,
                chain,
                codec: self.codec,
                if_exists: self.if_exists,
                session,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
