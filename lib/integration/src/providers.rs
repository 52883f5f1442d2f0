//! Request builders for the built-in service integrations.
//!
//! Each builder turns a rendered node config plus an optional credential
//! into an [`HttpRequest`]. Nothing here performs I/O.

use crate::connector::{Auth, HttpRequest};
use crate::credential::CredentialData;
use crate::error::ConnectorError;
use flowforge_workflow::config::{
    EmailConfig, GithubConfig, GithubOperation, GoogleSheetsConfig, HttpRequestConfig,
    NotionConfig, NotionOperation, OpenAiConfig, SheetsOperation, SlackConfig, StripeConfig,
    StripeOperation, TwilioConfig,
};
use flowforge_workflow::HttpMethod;
use serde_json::{Map, Value as JsonValue, json};

type BuildResult = Result<HttpRequest, ConnectorError>;

const NOTION_VERSION: &str = "2022-06-28";
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Base URLs of the hosted APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    pub slack: String,
    pub sendgrid: String,
    pub openai: String,
    pub google_sheets: String,
    pub github: String,
    pub notion: String,
    pub stripe: String,
    pub twilio: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            slack: "https://slack.com/api".to_string(),
            sendgrid: "https://api.sendgrid.com".to_string(),
            openai: "https://api.openai.com".to_string(),
            google_sheets: "https://sheets.googleapis.com".to_string(),
            github: "https://api.github.com".to_string(),
            notion: "https://api.notion.com".to_string(),
            stripe: "https://api.stripe.com".to_string(),
            twilio: "https://api.twilio.com".to_string(),
        }
    }
}

/// The authentication a credential implies when used generically.
#[must_use]
pub fn auth_for(data: &CredentialData) -> Auth {
    match data {
        CredentialData::ApiKey {
            key,
            header_name: Some(header),
        } => Auth::Header {
            name: header.clone(),
            value: key.clone(),
        },
        CredentialData::BasicAuth { username, password } => Auth::Basic {
            username: username.clone(),
            password: password.clone(),
        },
        other => other
            .bearer_secret()
            .map_or(Auth::None, |secret| Auth::Bearer(secret.to_string())),
    }
}

/// A generic `http-request` node.
///
/// # Errors
///
/// Returns an error if the URL is malformed.
pub fn http_request(config: &HttpRequestConfig, credential: Option<&CredentialData>) -> BuildResult {
    reqwest::Url::parse(&config.url).map_err(|e| invalid("http-request", format!("url: {e}")))?;

    let mut request = HttpRequest::new("http", config.method, &config.url);
    for (name, value) in &config.headers {
        request = request.header(name, value);
    }
    for (name, value) in &config.query {
        request = request.query(name, value);
    }
    if let Some(data) = credential {
        request = request.auth(auth_for(data));
    }
    if let Some(body) = &config.body
        && config.method != HttpMethod::Get
        && config.method != HttpMethod::Head
    {
        request = request.json(body.clone());
    }
    Ok(request)
}

/// Slack `chat.postMessage`.
///
/// # Errors
///
/// Returns an error without a token-bearing credential.
pub fn slack(
    endpoints: &ProviderEndpoints,
    config: &SlackConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let token = bearer("slack", credential)?;
    Ok(
        HttpRequest::new("slack", HttpMethod::Post, endpoint(&endpoints.slack, &["chat.postMessage"])?)
            .auth(Auth::Bearer(token))
            .json(json!({ "channel": config.channel, "text": config.text })),
    )
}

/// Slack answers 200 with `{"ok": false}` on failure.
///
/// # Errors
///
/// Returns the error Slack reported, classified for retry.
pub fn check_slack_reply(body: &JsonValue) -> Result<(), ConnectorError> {
    if body.get("ok").and_then(JsonValue::as_bool) == Some(true) {
        return Ok(());
    }
    let error = body
        .get("error")
        .and_then(JsonValue::as_str)
        .unwrap_or("unknown_error");
    Err(match error {
        "ratelimited" => ConnectorError::RateLimited {
            retry_after_secs: None,
        },
        "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => {
            ConnectorError::AuthenticationFailed {
                reason: error.to_string(),
            }
        }
        _ => invalid("chat.postMessage", error),
    })
}

/// Email through the SendGrid v3 mail API.
///
/// The sender is `config.from`, or the `from` field of a custom credential.
///
/// # Errors
///
/// Returns an error without a credential or without a sender address.
pub fn email(
    endpoints: &ProviderEndpoints,
    config: &EmailConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let key = bearer("email", credential)?;
    let from = config
        .from
        .as_deref()
        .or_else(|| credential.and_then(|c| c.custom_field("from")))
        .ok_or_else(|| invalid("email", "no sender: set `from`"))?;

    let body = json!({
        "personalizations": [{
            "to": config.to.split(',').map(str::trim).filter(|s| !s.is_empty())
                .map(|email| json!({ "email": email })).collect::<Vec<_>>()
        }],
        "from": { "email": from },
        "subject": config.subject,
        "content": [{ "type": "text/plain", "value": config.body.clone().unwrap_or_default() }],
    });
    Ok(
        HttpRequest::new("email", HttpMethod::Post, endpoint(&endpoints.sendgrid, &["v3", "mail", "send"])?)
            .auth(Auth::Bearer(key))
            .json(body),
    )
}

/// OpenAI chat completion with the prompt as a single user message.
///
/// # Errors
///
/// Returns an error without a key-bearing credential.
pub fn openai(
    endpoints: &ProviderEndpoints,
    config: &OpenAiConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let key = bearer("openai", credential)?;
    let mut body = Map::new();
    body.insert("model".to_string(), json!(config.model));
    body.insert(
        "messages".to_string(),
        json!([{ "role": "user", "content": config.prompt }]),
    );
    if let Some(temperature) = config.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(max_tokens) = config.max_tokens {
        body.insert("max_tokens".to_string(), json!(max_tokens));
    }
    Ok(HttpRequest::new(
        "openai",
        HttpMethod::Post,
        endpoint(&endpoints.openai, &["v1", "chat", "completions"])?,
    )
    .auth(Auth::Bearer(key))
    .json(JsonValue::Object(body)))
}

/// Reduces a chat completion to `{content, model, usage}`.
///
/// # Errors
///
/// Returns a protocol error if the completion carries no message.
pub fn openai_reply(body: &JsonValue) -> Result<JsonValue, ConnectorError> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ConnectorError::ProtocolError {
            reason: "completion has no message content".to_string(),
        })?;
    Ok(json!({
        "content": content,
        "model": body.get("model").cloned().unwrap_or(JsonValue::Null),
        "usage": body.get("usage").cloned().unwrap_or(JsonValue::Null),
    }))
}

/// Google Sheets values read or append.
///
/// # Errors
///
/// Returns an error without a credential or when append values are not rows.
pub fn google_sheets(
    endpoints: &ProviderEndpoints,
    config: &GoogleSheetsConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let token = bearer("google_sheets", credential)?;
    let values_url = |range: &str| {
        endpoint(
            &endpoints.google_sheets,
            &["v4", "spreadsheets", config.spreadsheet_id.as_str(), "values", range],
        )
    };
    let request = match config.operation {
        SheetsOperation::Read => {
            HttpRequest::new("google_sheets", HttpMethod::Get, values_url(&config.range)?)
        }
        SheetsOperation::Append => {
            let rows = sheet_rows(config.values.as_ref())?;
            HttpRequest::new(
                "google_sheets",
                HttpMethod::Post,
                values_url(&format!("{}:append", config.range))?,
            )
            .query("valueInputOption", "USER_ENTERED")
            .json(json!({ "values": rows }))
        }
    };
    Ok(request.auth(Auth::Bearer(token)))
}

/// A flat array is one row; an array of arrays is many.
fn sheet_rows(values: Option<&JsonValue>) -> Result<JsonValue, ConnectorError> {
    match values {
        Some(JsonValue::Array(items)) if items.iter().all(JsonValue::is_array) => {
            Ok(JsonValue::Array(items.clone()))
        }
        Some(JsonValue::Array(items)) => Ok(json!([items])),
        _ => Err(invalid("google_sheets", "`values` must be an array")),
    }
}

/// GitHub REST. Reads work anonymously; creating an issue needs a token.
///
/// # Errors
///
/// Returns an error when creating an issue without a credential.
pub fn github(
    endpoints: &ProviderEndpoints,
    config: &GithubConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let repo = ["repos", config.owner.as_str(), config.repo.as_str()];
    let issues = ["repos", config.owner.as_str(), config.repo.as_str(), "issues"];
    let request = match config.operation {
        GithubOperation::GetRepo => {
            HttpRequest::new("github", HttpMethod::Get, endpoint(&endpoints.github, &repo)?)
        }
        GithubOperation::ListIssues => {
            HttpRequest::new("github", HttpMethod::Get, endpoint(&endpoints.github, &issues)?)
        }
        GithubOperation::CreateIssue => {
            let title = config
                .title
                .as_deref()
                .ok_or_else(|| invalid("create_issue", "`title` is required"))?;
            bearer("github", credential)?;
            HttpRequest::new("github", HttpMethod::Post, endpoint(&endpoints.github, &issues)?)
            .json(json!({ "title": title, "body": config.body }))
        }
    };

    let request = request
        .header("accept", "application/vnd.github+json")
        .header("x-github-api-version", GITHUB_API_VERSION);
    Ok(match credential.and_then(CredentialData::bearer_secret) {
        Some(token) => request.auth(Auth::Bearer(token.to_string())),
        None => request,
    })
}

/// Notion REST.
///
/// # Errors
///
/// Returns an error without a credential or without the id the operation
/// addresses.
pub fn notion(
    endpoints: &ProviderEndpoints,
    config: &NotionConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let token = bearer("notion", credential)?;
    let request = match config.operation {
        NotionOperation::GetPage => {
            let page = required("get_page", "pageId", config.page_id.as_deref())?;
            HttpRequest::new("notion", HttpMethod::Get, endpoint(&endpoints.notion, &["v1", "pages", page])?)
        }
        NotionOperation::QueryDatabase => {
            let database = required("query_database", "databaseId", config.database_id.as_deref())?;
            HttpRequest::new(
                "notion",
                HttpMethod::Post,
                endpoint(&endpoints.notion, &["v1", "databases", database, "query"])?,
            )
            .json(config.properties.clone().unwrap_or_else(|| json!({})))
        }
        NotionOperation::CreatePage => {
            let database = required("create_page", "databaseId", config.database_id.as_deref())?;
            HttpRequest::new("notion", HttpMethod::Post, endpoint(&endpoints.notion, &["v1", "pages"])?)
                .json(json!({
                    "parent": { "database_id": database },
                    "properties": config.properties.clone().unwrap_or_else(|| json!({})),
                }))
        }
    };
    Ok(request
        .header("notion-version", NOTION_VERSION)
        .auth(Auth::Bearer(token)))
}

/// Stripe REST; bodies are form encoded.
///
/// # Errors
///
/// Returns an error without a secret key or without the fields the
/// operation needs.
pub fn stripe(
    endpoints: &ProviderEndpoints,
    config: &StripeConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let key = bearer("stripe", credential)?;
    let request = match config.operation {
        StripeOperation::GetBalance => {
            HttpRequest::new("stripe", HttpMethod::Get, endpoint(&endpoints.stripe, &["v1", "balance"])?)
        }
        StripeOperation::CreateCustomer => {
            let mut form = Vec::new();
            if let Some(email) = &config.email {
                form.push(("email".to_string(), email.clone()));
            }
            HttpRequest::new("stripe", HttpMethod::Post, endpoint(&endpoints.stripe, &["v1", "customers"])?)
                .form(form)
        }
        StripeOperation::CreatePaymentIntent => {
            let amount = config
                .amount
                .ok_or_else(|| invalid("create_payment_intent", "`amount` is required"))?;
            let currency = required("create_payment_intent", "currency", config.currency.as_deref())?;
            let mut form = vec![
                ("amount".to_string(), amount.to_string()),
                ("currency".to_string(), currency.to_lowercase()),
            ];
            if let Some(customer) = &config.customer {
                form.push(("customer".to_string(), customer.clone()));
            }
            HttpRequest::new(
                "stripe",
                HttpMethod::Post,
                endpoint(&endpoints.stripe, &["v1", "payment_intents"])?,
            )
            .form(form)
        }
    };
    Ok(request.auth(Auth::Bearer(key)))
}

/// Twilio SMS. The credential is basic auth with the account SID as the
/// username; the sender is `config.from` or a custom credential's `from`.
///
/// # Errors
///
/// Returns an error without a basic-auth credential or without a sender.
pub fn twilio(
    endpoints: &ProviderEndpoints,
    config: &TwilioConfig,
    credential: Option<&CredentialData>,
) -> BuildResult {
    let Some(CredentialData::BasicAuth { username, password }) = credential else {
        return Err(invalid("twilio", "requires a basic_auth credential (account SID and token)"));
    };
    let from = config
        .from
        .as_deref()
        .or_else(|| credential.and_then(|c| c.custom_field("from")))
        .ok_or_else(|| invalid("twilio", "no sender: set `from`"))?;
    Ok(HttpRequest::new(
        "twilio",
        HttpMethod::Post,
        endpoint(
            &endpoints.twilio,
            &["2010-04-01", "Accounts", username.as_str(), "Messages.json"],
        )?,
    )
    .auth(Auth::Basic {
        username: username.clone(),
        password: password.clone(),
    })
    .form(vec![
        ("To".to_string(), config.to.clone()),
        ("From".to_string(), from.to_string()),
        ("Body".to_string(), config.body.clone()),
    ]))
}

fn bearer(provider: &str, credential: Option<&CredentialData>) -> Result<String, ConnectorError> {
    credential
        .and_then(CredentialData::bearer_secret)
        .map(str::to_string)
        .ok_or_else(|| invalid(provider, "requires a credential with a token or API key"))
}

fn required<'a>(operation: &str, field: &str, value: Option<&'a str>) -> Result<&'a str, ConnectorError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| invalid(operation, format!("`{field}` is required")))
}

/// Appends percent-encoded path segments to `base`.
fn endpoint(base: &str, segments: &[&str]) -> Result<String, ConnectorError> {
    let mut url = reqwest::Url::parse(base).map_err(|e| invalid("endpoint", e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid("endpoint", format!("'{base}' cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url.to_string())
}

fn invalid(operation: &str, reason: impl Into<String>) -> ConnectorError {
    ConnectorError::InvalidParameters {
        operation: operation.to_string(),
        reason: reason.into(),
    }
}
