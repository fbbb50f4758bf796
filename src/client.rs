//! HTTP client with token handling, throttle-aware retries and rich errors.
//!
//! The [`Client`] type is the main entry point. It owns the two lowest
//! layers every other operation builds on:
//!
//! * the request executor ([`Client::send`]): one request, one network call,
//!   with bearer token and content negotiation headers attached;
//! * the retry/backoff controller ([`Client::execute`]): re-issues throttled
//!   or failed requests according to a [`RetryPolicy`] and refreshes the
//!   token once after a 401/403.
//!
//! Pagination, provisioning, batches and writes are implemented on top in
//! their own modules.

use crate::{
    auth::TokenProvider,
    classify::{extract_message, Classifier},
    config::{ClientConfig, RetrySettings},
    metadata::{RequestBody, RequestMetadata},
    rate_limit::RateLimitConfig,
    retry::{RetryEvent, RetryHook, RetryPolicy, RetryReason},
    schema::SchemaCache,
    Error, Response, Result,
};
use http::{header, HeaderMap, HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

/// `Accept` value requesting minimal-metadata JSON.
pub const ACCEPT_JSON: &str = "application/json;odata=nometadata";
/// `Content-Type` value for JSON payloads.
pub const CONTENT_TYPE_JSON: &str = "application/json;odata=nometadata";

/// A client for one site of a list-based data store.
///
/// The client is cheap to clone; clones share the connection pool, the token
/// provider and the [`SchemaCache`].
///
/// # Examples
///
/// ```no_run
/// use listkeeper::{Client, ListQuery, ListRef};
///
/// # async fn example() -> Result<(), listkeeper::Error> {
/// let client = Client::builder()
///     .base_url("https://contoso.example.com/sites/hr")?
///     .token_provider(|| async { std::env::var("HR_TOKEN").ok() })
///     .build()?;
///
/// let rows = client
///     .list_all(
///         &ListRef::title("Staff"),
///         &ListQuery::new().select(["Id", "Title"]).top(500),
///     )
///     .await?;
/// println!("{} staff rows", rows.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    cancel: Option<CancellationToken>,
}

struct ClientInner {
    http_client: reqwest::Client,
    base_url: Url,
    default_headers: HeaderMap,
    token_provider: Arc<dyn TokenProvider>,
    retry_settings: RetrySettings,
    rate_limit_config: RateLimitConfig,
    timeout: Option<Duration>,
    schema_cache: SchemaCache,
    classifier: Classifier,
    on_retry: Option<RetryHook>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("retry_settings", &self.inner.retry_settings)
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Builds a client from a [`ClientConfig`] and a token provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured site URL is invalid.
    pub fn from_config<P>(config: ClientConfig, token_provider: P) -> Result<Self>
    where
        P: TokenProvider + 'static,
    {
        let mut builder = Client::builder()
            .base_url(&config.site_url)?
            .token_provider(token_provider)
            .retry_settings(config.retry);
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }

    /// Returns a handle whose operations stop issuing requests once `token`
    /// is cancelled. The handle shares all state with `self`.
    pub fn cancellable(&self, token: CancellationToken) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
            cancel: Some(token),
        }
    }

    /// The schema negotiation cache used by this client.
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.inner.schema_cache
    }

    /// The retry settings used for reads and batches.
    pub fn retry_settings(&self) -> &RetrySettings {
        &self.inner.retry_settings
    }

    /// The default policy for reads.
    pub fn read_policy(&self) -> RetryPolicy {
        RetryPolicy::read(&self.inner.retry_settings)
    }

    pub(crate) fn classifier(&self) -> &Classifier {
        &self.inner.classifier
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sends exactly one request and returns the response whatever its status.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoToken`] before any network call when the token
    /// provider yields nothing, and with transport errors.
    pub async fn send(&self, metadata: RequestMetadata) -> Result<Response<()>> {
        self.check_cancelled()?;
        let token = self.acquire_token().await?;
        let started = Instant::now();
        let response = self.dispatch(&metadata, &token, 1).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let raw_body = response.text().await?;
        Ok(Response::new(
            (),
            raw_body,
            status,
            headers,
            started.elapsed(),
            1,
        ))
    }

    /// Issues a request under `policy`.
    ///
    /// Transient failures accepted by the policy's predicate are retried,
    /// waiting for the server's `Retry-After` when the policy honours it and
    /// the computed backoff otherwise. Once retries stop, a 401/403 triggers
    /// one token refresh and, if the provider hands out a different token,
    /// one re-issue.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the last attempt. Errors that were
    /// retried until the budget ran out are wrapped in
    /// [`Error::MaxRetriesExceeded`].
    pub async fn execute(
        &self,
        metadata: RequestMetadata,
        policy: &RetryPolicy,
    ) -> Result<Response<()>> {
        self.execute_counted(metadata, policy)
            .await
            .map_err(|(error, _)| error)
    }

    /// [`Client::execute`], reporting how many requests were sent along with
    /// the terminal error.
    pub(crate) async fn execute_counted(
        &self,
        metadata: RequestMetadata,
        policy: &RetryPolicy,
    ) -> std::result::Result<Response<()>, (Error, usize)> {
        self.check_cancelled().map_err(|e| (e, 0))?;
        let started = Instant::now();
        let mut token = self.acquire_token().await.map_err(|e| (e, 0))?;
        let mut attempt = 1;
        let mut refreshed = false;

        loop {
            let error = match self.attempt(&metadata, &token, attempt, started).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            tracing::warn!(
                error = %error,
                attempt = attempt,
                method = %metadata.method,
                path = %metadata.path,
                "Request failed"
            );

            if policy.predicate.should_retry(&error, attempt) {
                let Some(backoff) = policy.strategy.delay_for_attempt(attempt) else {
                    let error = if attempt > 1 {
                        Error::MaxRetriesExceeded {
                            attempts: attempt,
                            last_error: Box::new(error),
                        }
                    } else {
                        error
                    };
                    return Err((error, attempt));
                };

                let delay = match error.retry_after() {
                    Some(server_delay) if policy.honor_retry_after => server_delay,
                    _ => backoff,
                };

                self.emit_retry(RetryEvent {
                    attempt: attempt + 1,
                    status: error.status().map(|s| s.as_u16()),
                    reason: RetryReason::for_error(&error),
                    delay,
                });
                self.sleep(delay).await.map_err(|e| (e, attempt))?;
                attempt += 1;
                continue;
            }

            if policy.refresh_auth && !refreshed && error.is_auth_failure() {
                refreshed = true;
                match self.inner.token_provider.refresh(&token).await {
                    Some(fresh) if !fresh.is_empty() && fresh != token => {
                        self.emit_retry(RetryEvent {
                            attempt: attempt + 1,
                            status: error.status().map(|s| s.as_u16()),
                            reason: RetryReason::AuthRefresh,
                            delay: Duration::ZERO,
                        });
                        self.check_cancelled().map_err(|e| (e, attempt))?;
                        token = fresh;
                        attempt += 1;
                        continue;
                    }
                    _ => {
                        tracing::warn!(
                            path = %metadata.path,
                            "Token provider returned no new token after rejection"
                        );
                    }
                }
            }

            return Err((error, attempt));
        }
    }

    /// Makes a GET request under the default read policy and decodes the
    /// JSON body.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use listkeeper::{Client, StaticToken};
    /// use serde::Deserialize;
    ///
    /// #[derive(Deserialize)]
    /// struct Web {
    ///     #[serde(rename = "Title")]
    ///     title: String,
    /// }
    ///
    /// # async fn example() -> Result<(), listkeeper::Error> {
    /// let client = Client::builder()
    ///     .base_url("https://contoso.example.com/sites/hr")?
    ///     .token_provider(StaticToken::new("token"))
    ///     .build()?;
    ///
    /// let web = client.get::<Web>("/_api/web?$select=Title").await?;
    /// println!("Site: {}", web.data.title);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::get(path);
        self.execute(metadata, &self.read_policy()).await?.json()
    }

    async fn acquire_token(&self) -> Result<String> {
        match self.inner.token_provider.token().await {
            Some(token) if !token.is_empty() => Ok(token),
            _ => {
                tracing::error!("Token provider returned no token");
                Err(Error::NoToken)
            }
        }
    }

    /// One attempt: dispatch, then turn non-2xx into `Error::HttpError`.
    async fn attempt(
        &self,
        metadata: &RequestMetadata,
        token: &str,
        attempt: usize,
        started: Instant,
    ) -> Result<Response<()>> {
        self.check_cancelled()?;
        let response = self.dispatch(metadata, token, attempt).await?;
        self.read_response(response, started.elapsed(), attempt).await
    }

    /// Executes a single request attempt.
    async fn dispatch(
        &self,
        metadata: &RequestMetadata,
        token: &str,
        attempt: usize,
    ) -> Result<reqwest::Response> {
        let mut url = self.resolve_url(&metadata.path)?;
        if !metadata.query_params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &metadata.query_params {
                pairs.append_pair(key, value);
            }
        }

        tracing::debug!(
            method = %metadata.method,
            url = %url,
            attempt = attempt,
            "Executing HTTP request"
        );

        let mut request = self.inner.http_client.request(metadata.method.clone(), url);

        for (name, value) in &self.inner.default_headers {
            request = request.header(name, value);
        }
        for (name, value) in &metadata.headers {
            request = request.header(name, value);
        }

        request = request
            .bearer_auth(token)
            .header(header::ACCEPT, ACCEPT_JSON);

        if let Some(timeout) = self.inner.timeout {
            request = request.timeout(timeout);
        }

        match &metadata.body {
            Some(RequestBody::Json(value)) => {
                let bytes = serde_json::to_vec(value)
                    .map_err(|e| Error::SerializationFailed(e.to_string()))?;
                request = request
                    .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON)
                    .body(bytes);
            }
            Some(RequestBody::Raw {
                content_type,
                bytes,
            }) => {
                request = request
                    .header(header::CONTENT_TYPE, content_type.as_str())
                    .body(bytes.clone());
            }
            None if metadata.is_mutation() => {
                request = request.header(header::CONTENT_TYPE, CONTENT_TYPE_JSON);
            }
            None => {}
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Network(e)
            }
        })
    }

    /// Reads the body and returns `Ok` for 2xx, `Error::HttpError` otherwise.
    async fn read_response(
        &self,
        response: reqwest::Response,
        latency: Duration,
        attempts: usize,
    ) -> Result<Response<()>> {
        let status = response.status();
        let headers = response.headers().clone();

        tracing::info!(
            status = status.as_u16(),
            latency_ms = latency.as_millis(),
            attempts = attempts,
            "Received HTTP response"
        );

        let raw_body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Network(e)
            }
        })?;

        if status.is_success() {
            return Ok(Response::new((), raw_body, status, headers, latency, attempts));
        }

        let server = extract_message(status, &raw_body);
        let retry_after = self.inner.rate_limit_config.server_delay(&headers);

        if status.is_client_error() && status.as_u16() != 429 {
            tracing::error!(
                status = status.as_u16(),
                message = %server.message,
                "Client error (4xx)"
            );
        } else {
            tracing::warn!(
                status = status.as_u16(),
                message = %server.message,
                "Server busy or failed"
            );
        }

        Err(Error::HttpError {
            status,
            message: server.message,
            code: server.code,
            raw_response: raw_body,
            headers,
            retry_after,
        })
    }

    /// Resolves a site-relative path, or passes an absolute URL through.
    pub(crate) fn resolve_url(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(Url::parse(path)?);
        }

        let mut url = self.inner.base_url.clone();
        let (path_part, query_part) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };
        let joined = format!(
            "{}/{}",
            self.inner.base_url.path().trim_end_matches('/'),
            path_part.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(query_part);
        Ok(url)
    }

    fn emit_retry(&self, event: RetryEvent) {
        if self.inner.retry_settings.verbose {
            tracing::info!(
                attempt = event.attempt,
                status = ?event.status,
                reason = ?event.reason,
                delay_ms = event.delay.as_millis(),
                "Retrying request"
            );
        } else {
            tracing::debug!(
                attempt = event.attempt,
                status = ?event.status,
                reason = ?event.reason,
                delay_ms = event.delay.as_millis(),
                "Retrying request"
            );
        }
        if let Some(hook) = &self.inner.on_retry {
            hook(&event);
        }
    }

    /// Sleeps for `delay`, returning early with `Error::Cancelled`.
    async fn sleep(&self, delay: Duration) -> Result<()> {
        match &self.cancel {
            Some(cancel) => tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(()),
            },
            None => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use listkeeper::{ClientBuilder, StaticToken, config::RetrySettings};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), listkeeper::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://contoso.example.com/sites/hr")?
///     .token_provider(StaticToken::new("token"))
///     .timeout(Duration::from_secs(30))
///     .retry_settings(RetrySettings { max_attempts: 6, ..Default::default() })
///     .on_retry(|event| eprintln!("retry: {:?}", event))
///     .default_header("User-Agent", "hr-portal/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    token_provider: Option<Arc<dyn TokenProvider>>,
    retry_settings: RetrySettings,
    rate_limit_config: RateLimitConfig,
    timeout: Option<Duration>,
    schema_cache: Option<SchemaCache>,
    classifier: Option<Classifier>,
    on_retry: Option<RetryHook>,
}

impl ClientBuilder {
    /// Creates a new `ClientBuilder` with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            token_provider: None,
            retry_settings: RetrySettings::default(),
            rate_limit_config: RateLimitConfig::default(),
            timeout: None,
            schema_cache: None,
            classifier: None,
            on_retry: None,
        }
    }

    /// Sets the site URL every relative path is resolved under.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or not an http(s) URL.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        let url = Url::parse(url.as_ref())?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(Error::ConfigurationError(format!(
                "Base URL must be an http(s) URL, got `{}`",
                url
            )));
        }
        self.base_url = Some(url);
        Ok(self)
    }

    /// Adds a default header that will be included in all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::ConfigurationError(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the source of bearer tokens.
    pub fn token_provider<P>(mut self, provider: P) -> Self
    where
        P: TokenProvider + 'static,
    {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    /// Sets the retry tuning for reads and batches.
    pub fn retry_settings(mut self, settings: RetrySettings) -> Self {
        self.retry_settings = settings;
        self
    }

    /// Sets how `Retry-After` headers are honoured.
    pub fn rate_limit_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit_config = config;
        self
    }

    /// Sets the per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shares an existing schema cache instead of starting with an empty one.
    pub fn schema_cache(mut self, cache: SchemaCache) -> Self {
        self.schema_cache = Some(cache);
        self
    }

    /// Replaces the error classifier.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Installs a callback invoked once per retry cycle.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Builds the configured `Client`.
    ///
    /// # Errors
    ///
    /// Returns an error if no base URL or token provider was provided, or if
    /// the HTTP client cannot be constructed.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;
        let token_provider = self
            .token_provider
            .ok_or_else(|| Error::ConfigurationError("Token provider is required".to_string()))?;

        let http_client = reqwest::Client::builder().build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;

        Ok(Client {
            inner: Arc::new(ClientInner {
                http_client,
                base_url,
                default_headers: self.default_headers,
                token_provider,
                retry_settings: self.retry_settings,
                rate_limit_config: self.rate_limit_config,
                timeout: self.timeout,
                schema_cache: self.schema_cache.unwrap_or_default(),
                classifier: self.classifier.unwrap_or_default(),
                on_retry: self.on_retry,
            }),
            cancel: None,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
