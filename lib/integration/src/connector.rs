//! Connector trait and the HTTP connector behind every integration node.
//!
//! All integrations are expressed as an [`HttpRequest`]; a [`Connector`]
//! sends it and maps the answer into either an [`HttpResponse`] or a
//! [`ConnectorError`] whose retryability the engine honors.

use crate::error::ConnectorError;
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use flowforge_core::Result;
use flowforge_workflow::HttpMethod;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Longest upstream error body kept in a [`ConnectorError::UpstreamStatus`].
const MAX_ERROR_BODY: usize = 512;

/// How a request authenticates.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Auth {
    #[default]
    None,
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Bearer(_) => write!(f, "Bearer([redacted])"),
            Self::Basic { username, .. } => write!(f, "Basic({username}, [redacted])"),
            Self::Header { name, .. } => write!(f, "Header({name}, [redacted])"),
        }
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(JsonValue),
    Form(Vec<(String, String)>),
    Text(String),
}

/// A fully rendered outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Rate-limit key, e.g. `slack` or `http`.
    pub provider: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub auth: Auth,
    pub body: Option<RequestBody>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(provider: impl Into<String>, method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            query: Vec::new(),
            auth: Auth::None,
            body: None,
        }
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    #[must_use]
    pub fn json(mut self, body: JsonValue) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    #[must_use]
    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(RequestBody::Form(fields));
        self
    }
}

/// A successful (2xx) answer.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, the raw text otherwise.
    pub body: JsonValue,
}

impl HttpResponse {
    /// The shape an `http-request` node emits.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        json!({
            "status": self.status,
            "headers": self.headers,
            "body": self.body,
        })
    }
}

/// Sends requests to external services.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Sends `request`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectorError`] for transport failures, local or remote
    /// rate limiting and non-2xx answers.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ConnectorError>;
}

/// `reqwest`-backed connector with a per-provider rate limiter.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl HttpConnector {
    /// Creates a connector whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(timeout: Duration, limiter: RateLimiter) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flowforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        Ok(Self { client, limiter })
    }

    fn build(&self, request: HttpRequest) -> reqwest::RequestBuilder {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let mut builder = self.client.request(method, &request.url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Header { name, value } => builder.header(name, value),
        };
        match request.body {
            None => builder,
            Some(RequestBody::Json(body)) => builder.json(&body),
            Some(RequestBody::Form(fields)) => builder.form(&fields),
            Some(RequestBody::Text(text)) => builder.body(text),
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    #[instrument(skip(self, request), fields(provider = %request.provider, method = request.method.as_str()))]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ConnectorError> {
        self.limiter.acquire(&request.provider)?;

        let response = self.build(request).send().await.map_err(transport_error)?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let text = response.text().await.map_err(|e| ConnectorError::ProtocolError {
            reason: e.to_string(),
        })?;

        if let Err(e) = check_status(status, &headers, &text) {
            warn!(status, error = %e, "upstream call failed");
            return Err(e.into());
        }

        debug!(status, "upstream call succeeded");
        Ok(HttpResponse {
            status,
            headers,
            body: parse_body(&text),
        })
    }
}

fn transport_error(e: reqwest::Error) -> ConnectorError {
    if e.is_timeout() {
        ConnectorError::Timeout
    } else {
        ConnectorError::ConnectionFailed {
            reason: e.to_string(),
        }
    }
}

/// Maps a status code to success or the matching [`ConnectorError`].
///
/// # Errors
///
/// Returns an error for every non-2xx status.
pub fn check_status(
    status: u16,
    headers: &BTreeMap<String, String>,
    body: &str,
) -> std::result::Result<(), ConnectorError> {
    match status {
        200..=299 => Ok(()),
        401 | 403 => Err(ConnectorError::AuthenticationFailed {
            reason: format!("{status}: {}", truncate(body)),
        }),
        429 => Err(ConnectorError::RateLimited {
            retry_after_secs: headers
                .get("retry-after")
                .and_then(|v| v.trim().parse().ok()),
        }),
        _ => Err(ConnectorError::UpstreamStatus {
            status,
            body: truncate(body),
        }),
    }
}

/// Parses a response body as JSON, falling back to the raw text.
#[must_use]
pub fn parse_body(text: &str) -> JsonValue {
    if text.trim().is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| JsonValue::String(text.to_string()))
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((end, _)) => format!("{}...", &body[..end]),
        None => body.to_string(),
    }
}
