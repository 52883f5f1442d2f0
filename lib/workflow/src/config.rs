//! Typed per-node configuration.
//!
//! Stored configs are free-form JSON. At plan time each one is deserialized
//! into the struct for its node type, so a missing field or a wrong shape is
//! reported before any node runs instead of deep inside an executor.

use crate::node::NodeType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// Manual trigger; takes no configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManualTriggerConfig {}

/// Webhook trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookTriggerConfig {
    /// Path suffix under `/webhook/{workflow_id}/` that fires this trigger.
    pub path: String,
}

/// Cron schedule trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleTriggerConfig {
    /// Cron expression with 5, 6 or 7 fields.
    pub cron: String,
    /// `UTC` or a fixed offset such as `+02:00`.
    #[serde(default)]
    pub timezone: Option<String>,
    /// Payload handed to the run as its trigger input.
    #[serde(default)]
    pub payload: Option<JsonValue>,
}

/// HTTP verb for request-making nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "head")]
    Head,
}

impl HttpMethod {
    /// Returns the verb in upper case.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        }
    }
}

/// Generic HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequestConfig {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<JsonValue>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Inline code; evaluated with the engine's expression language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeConfig {
    pub code: String,
}

/// Outbound email through an HTTP mail API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailConfig {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Slack `chat.postMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackConfig {
    pub channel: String,
    pub text: String,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// SQL against a Postgres database named by the credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub query: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Two-way branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfConfig {
    pub condition: String,
}

/// One `switch` case: when the switch value equals `value`, output goes
/// along edges labeled `output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchCase {
    pub value: JsonValue,
    pub output: String,
}

/// Multi-way branch; first matching case wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchConfig {
    pub value: String,
    #[serde(default)]
    pub cases: Vec<SwitchCase>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Aggregating iteration over a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Expression selecting the collection; defaults to the merged input.
    #[serde(default)]
    pub items: Option<String>,
    /// Expression applied per item with `$item` and `$index` bound.
    #[serde(default)]
    pub expression: Option<String>,
}

/// Keeps the items of a collection that satisfy `condition`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    pub condition: String,
    #[serde(default)]
    pub items: Option<String>,
}

/// Writes fields onto the input object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetConfig {
    pub values: BTreeMap<String, JsonValue>,
    #[serde(default = "default_true")]
    pub keep_input: bool,
}

fn default_true() -> bool {
    true
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Sorts a collection of objects by a field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortConfig {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
    #[serde(default)]
    pub items: Option<String>,
}

/// Chat completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiConfig {
    pub prompt: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

/// Google Sheets operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetsOperation {
    #[default]
    Read,
    Append,
}

/// Reads or appends spreadsheet rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoogleSheetsConfig {
    pub spreadsheet_id: String,
    pub range: String,
    #[serde(default)]
    pub operation: SheetsOperation,
    #[serde(default)]
    pub values: Option<JsonValue>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// GitHub REST operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GithubOperation {
    GetRepo,
    ListIssues,
    CreateIssue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfig {
    pub operation: GithubOperation,
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Notion REST operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotionOperation {
    GetPage,
    QueryDatabase,
    CreatePage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotionConfig {
    pub operation: NotionOperation,
    #[serde(default)]
    pub database_id: Option<String>,
    #[serde(default)]
    pub page_id: Option<String>,
    #[serde(default)]
    pub properties: Option<JsonValue>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Suspends the run for `duration` seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitConfig {
    pub duration: f64,
}

/// Stripe REST operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StripeOperation {
    GetBalance,
    CreateCustomer,
    CreatePaymentIntent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StripeConfig {
    pub operation: StripeOperation,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Sends an SMS through Twilio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwilioConfig {
    pub to: String,
    pub body: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

/// Whether a sub-workflow call blocks for the child's result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitMode {
    #[default]
    Sync,
    Async,
}

/// Runs another workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubWorkflowConfig {
    pub workflow_id: String,
    #[serde(default)]
    pub wait_mode: WaitMode,
    /// Payload for the child; defaults to this node's merged input.
    #[serde(default)]
    pub input: Option<JsonValue>,
}

/// How `merge` combines its inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Array of all inputs.
    #[default]
    Combine,
    /// Flattened concatenation of array inputs.
    Append,
    /// One emission per input.
    Multiplex,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConfig {
    #[serde(default)]
    pub mode: MergeMode,
}

/// A node's validated configuration, one variant per node type.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    ManualTrigger(ManualTriggerConfig),
    WebhookTrigger(WebhookTriggerConfig),
    ScheduleTrigger(ScheduleTriggerConfig),
    HttpRequest(HttpRequestConfig),
    Code(CodeConfig),
    Email(EmailConfig),
    Slack(SlackConfig),
    Database(DatabaseConfig),
    If(IfConfig),
    Switch(SwitchConfig),
    Loop(LoopConfig),
    Filter(FilterConfig),
    Set(SetConfig),
    Sort(SortConfig),
    OpenAi(OpenAiConfig),
    GoogleSheets(GoogleSheetsConfig),
    Github(GithubConfig),
    Notion(NotionConfig),
    Wait(WaitConfig),
    Stripe(StripeConfig),
    Twilio(TwilioConfig),
    SubWorkflow(SubWorkflowConfig),
    Merge(MergeConfig),
    Comment,
}

impl NodeConfig {
    /// Validates a stored config against the schema for `node_type`.
    ///
    /// A JSON `null` config is treated as an empty object.
    ///
    /// # Errors
    ///
    /// Returns a message describing the first structural or semantic problem.
    pub fn parse(node_type: NodeType, raw: &JsonValue) -> Result<Self, String> {
        let config = match node_type {
            NodeType::ManualTrigger => Self::ManualTrigger(decode(raw)?),
            NodeType::WebhookTrigger => {
                let config: WebhookTriggerConfig = decode(raw)?;
                require_non_empty("path", &config.path)?;
                Self::WebhookTrigger(config)
            }
            NodeType::ScheduleTrigger => {
                let config: ScheduleTriggerConfig = decode(raw)?;
                let fields = config.cron.split_whitespace().count();
                if !(5..=7).contains(&fields) {
                    return Err(format!(
                        "cron expression '{}' must have 5 to 7 fields, got {fields}",
                        config.cron
                    ));
                }
                Self::ScheduleTrigger(config)
            }
            NodeType::HttpRequest => {
                let config: HttpRequestConfig = decode(raw)?;
                require_non_empty("url", &config.url)?;
                Self::HttpRequest(config)
            }
            NodeType::Code => {
                let config: CodeConfig = decode(raw)?;
                require_non_empty("code", &config.code)?;
                Self::Code(config)
            }
            NodeType::Email => {
                let config: EmailConfig = decode(raw)?;
                require_non_empty("to", &config.to)?;
                Self::Email(config)
            }
            NodeType::Slack => {
                let config: SlackConfig = decode(raw)?;
                require_non_empty("channel", &config.channel)?;
                Self::Slack(config)
            }
            NodeType::Database => {
                let config: DatabaseConfig = decode(raw)?;
                require_non_empty("query", &config.query)?;
                Self::Database(config)
            }
            NodeType::If => {
                let config: IfConfig = decode(raw)?;
                require_non_empty("condition", &config.condition)?;
                Self::If(config)
            }
            NodeType::Switch => {
                let config: SwitchConfig = decode(raw)?;
                require_non_empty("value", &config.value)?;
                if let Some(case) = config.cases.iter().find(|c| c.output.trim().is_empty()) {
                    return Err(format!("switch case {} has an empty output label", case.value));
                }
                Self::Switch(config)
            }
            NodeType::Loop => Self::Loop(decode(raw)?),
            NodeType::Filter => {
                let config: FilterConfig = decode(raw)?;
                require_non_empty("condition", &config.condition)?;
                Self::Filter(config)
            }
            NodeType::Set => Self::Set(decode(raw)?),
            NodeType::Sort => {
                let config: SortConfig = decode(raw)?;
                require_non_empty("field", &config.field)?;
                Self::Sort(config)
            }
            NodeType::OpenAi => {
                let config: OpenAiConfig = decode(raw)?;
                require_non_empty("prompt", &config.prompt)?;
                Self::OpenAi(config)
            }
            NodeType::GoogleSheets => {
                let config: GoogleSheetsConfig = decode(raw)?;
                require_non_empty("spreadsheetId", &config.spreadsheet_id)?;
                require_non_empty("range", &config.range)?;
                if config.operation == SheetsOperation::Append && config.values.is_none() {
                    return Err("append requires `values`".to_string());
                }
                Self::GoogleSheets(config)
            }
            NodeType::Github => {
                let config: GithubConfig = decode(raw)?;
                require_non_empty("owner", &config.owner)?;
                require_non_empty("repo", &config.repo)?;
                if config.operation == GithubOperation::CreateIssue && config.title.is_none() {
                    return Err("create_issue requires `title`".to_string());
                }
                Self::Github(config)
            }
            NodeType::Notion => {
                let config: NotionConfig = decode(raw)?;
                match config.operation {
                    NotionOperation::GetPage if config.page_id.is_none() => {
                        return Err("get_page requires `pageId`".to_string());
                    }
                    NotionOperation::QueryDatabase | NotionOperation::CreatePage
                        if config.database_id.is_none() =>
                    {
                        return Err("operation requires `databaseId`".to_string());
                    }
                    _ => {}
                }
                Self::Notion(config)
            }
            NodeType::Wait => {
                let config: WaitConfig = decode(raw)?;
                if !config.duration.is_finite() || config.duration < 0.0 {
                    return Err(format!(
                        "duration must be a non-negative number of seconds, got {}",
                        config.duration
                    ));
                }
                Self::Wait(config)
            }
            NodeType::Stripe => {
                let config: StripeConfig = decode(raw)?;
                if config.operation == StripeOperation::CreatePaymentIntent
                    && (config.amount.is_none() || config.currency.is_none())
                {
                    return Err("create_payment_intent requires `amount` and `currency`".to_string());
                }
                Self::Stripe(config)
            }
            NodeType::Twilio => {
                let config: TwilioConfig = decode(raw)?;
                require_non_empty("to", &config.to)?;
                Self::Twilio(config)
            }
            NodeType::SubWorkflow => {
                let config: SubWorkflowConfig = decode(raw)?;
                config
                    .workflow_id
                    .parse::<flowforge_core::WorkflowId>()
                    .map_err(|e| format!("workflowId: {e}"))?;
                Self::SubWorkflow(config)
            }
            NodeType::Merge => Self::Merge(decode(raw)?),
            NodeType::Comment => Self::Comment,
        };
        Ok(config)
    }

    /// Returns the credential reference, for node types that take one.
    #[must_use]
    pub fn credential_id(&self) -> Option<&str> {
        let id = match self {
            Self::HttpRequest(c) => &c.credential_id,
            Self::Email(c) => &c.credential_id,
            Self::Slack(c) => &c.credential_id,
            Self::Database(c) => &c.credential_id,
            Self::OpenAi(c) => &c.credential_id,
            Self::GoogleSheets(c) => &c.credential_id,
            Self::Github(c) => &c.credential_id,
            Self::Notion(c) => &c.credential_id,
            Self::Stripe(c) => &c.credential_id,
            Self::Twilio(c) => &c.credential_id,
            _ => return None,
        };
        id.as_deref().filter(|s| !s.is_empty())
    }
}

fn decode<T: DeserializeOwned>(raw: &JsonValue) -> Result<T, String> {
    let value = if raw.is_null() {
        JsonValue::Object(serde_json::Map::new())
    } else {
        raw.clone()
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}

fn require_non_empty(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("`{field}` must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_request_defaults_to_get() {
        let config = NodeConfig::parse(
            NodeType::HttpRequest,
            &json!({ "url": "https://example.com", "credentialId": "" }),
        )
        .expect("valid");
        let NodeConfig::HttpRequest(http) = &config else {
            panic!("wrong variant");
        };
        assert_eq!(http.method, HttpMethod::Get);
        assert_eq!(config.credential_id(), None);
    }

    #[test]
    fn http_request_requires_url() {
        let err = NodeConfig::parse(NodeType::HttpRequest, &json!({ "method": "POST" }))
            .unwrap_err();
        assert!(err.contains("url"), "{err}");
    }

    #[test]
    fn lowercase_method_is_accepted() {
        let config = NodeConfig::parse(
            NodeType::HttpRequest,
            &json!({ "url": "https://example.com", "method": "post" }),
        )
        .expect("valid");
        assert!(matches!(
            config,
            NodeConfig::HttpRequest(HttpRequestConfig {
                method: HttpMethod::Post,
                ..
            })
        ));
    }

    #[test]
    fn null_config_is_empty_object() {
        assert_eq!(
            NodeConfig::parse(NodeType::Merge, &JsonValue::Null),
            Ok(NodeConfig::Merge(MergeConfig::default()))
        );
        assert!(NodeConfig::parse(NodeType::If, &JsonValue::Null).is_err());
    }

    #[test]
    fn wait_rejects_negative_duration() {
        assert!(NodeConfig::parse(NodeType::Wait, &json!({ "duration": -1 })).is_err());
        assert!(NodeConfig::parse(NodeType::Wait, &json!({ "duration": 0.5 })).is_ok());
    }

    #[test]
    fn schedule_checks_field_count() {
        assert!(NodeConfig::parse(NodeType::ScheduleTrigger, &json!({ "cron": "* * *" })).is_err());
        assert!(
            NodeConfig::parse(NodeType::ScheduleTrigger, &json!({ "cron": "*/5 * * * *" })).is_ok()
        );
    }

    #[test]
    fn sub_workflow_requires_parseable_id() {
        let id = flowforge_core::WorkflowId::new();
        assert!(
            NodeConfig::parse(NodeType::SubWorkflow, &json!({ "workflowId": id.to_string() }))
                .is_ok()
        );
        assert!(
            NodeConfig::parse(NodeType::SubWorkflow, &json!({ "workflowId": "nope" })).is_err()
        );
    }

    #[test]
    fn switch_cases_parse_in_order() {
        let config = NodeConfig::parse(
            NodeType::Switch,
            &json!({
                "value": "$json.tier",
                "cases": [
                    { "value": "gold", "output": "vip" },
                    { "value": "silver", "output": "regular" }
                ],
                "default": "other"
            }),
        )
        .expect("valid");
        let NodeConfig::Switch(switch) = config else {
            panic!("wrong variant");
        };
        assert_eq!(switch.cases[0].output, "vip");
        assert_eq!(switch.default.as_deref(), Some("other"));
    }

    #[test]
    fn comment_accepts_anything() {
        assert_eq!(
            NodeConfig::parse(NodeType::Comment, &json!({ "text": 42 })),
            Ok(NodeConfig::Comment)
        );
    }

    #[test]
    fn stripe_payment_intent_needs_amount() {
        let err = NodeConfig::parse(
            NodeType::Stripe,
            &json!({ "operation": "create_payment_intent", "currency": "usd" }),
        )
        .unwrap_err();
        assert!(err.contains("amount"));
    }
}
