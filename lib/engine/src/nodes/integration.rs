//! The executor behind every node that talks to an external service.
//!
//! String fields of the config are rendered as `{{ }}` templates and JSON
//! fields resolved against the node's scope before the provider builder turns
//! them into a request. The credential is resolved once per invocation and
//! dropped when the call returns.

use super::wrong_config;
use crate::executor::{NodeContext, NodeExecutor};
use async_trait::async_trait;
use flowforge_integration::providers::{self, check_slack_reply, openai_reply};
use flowforge_integration::{ConnectorError, CredentialData, HttpRequest};
use flowforge_workflow::config::DatabaseConfig;
use flowforge_workflow::expression::{Sandbox, merge_inputs};
use flowforge_workflow::{NodeConfig, NodeError, NodeOutput};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use tracing::debug;

/// How the provider's answer becomes the node output.
enum Reply {
    /// `{status, headers, body}`.
    Envelope,
    /// The parsed body.
    Body,
    Slack,
    OpenAi,
}

/// Calls the external service a node's config describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrationNode;

#[async_trait]
impl NodeExecutor for IntegrationNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let json = merge_inputs(inputs);
        let credential = ctx.credential(config.credential_id()).await?;
        let data = credential.as_ref().map(|c| &c.data);

        if let NodeConfig::Database(database) = config {
            let params = database_params(database, &ctx.sandbox(&json, inputs), ctx)?;
            return query_database(database, data, params, ctx).await;
        }

        let (request, reply) = build(config, data, &ctx.sandbox(&json, inputs), ctx)?;
        debug!(
            node_id = %ctx.node_id,
            provider = %request.provider,
            method = request.method.as_str(),
            "calling provider"
        );
        let response = ctx
            .services
            .connector
            .send(request)
            .await
            .map_err(|report| ctx.connector_error(report.current_context()))?;

        let output = match reply {
            Reply::Envelope => response.to_json(),
            Reply::Body => response.body,
            Reply::Slack => {
                check_slack_reply(&response.body).map_err(|e| ctx.connector_error(&e))?;
                response.body
            }
            Reply::OpenAi => openai_reply(&response.body).map_err(|e| ctx.connector_error(&e))?,
        };
        Ok(NodeOutput::value(output))
    }
}

fn build(
    config: &NodeConfig,
    data: Option<&CredentialData>,
    sandbox: &Sandbox<'_>,
    ctx: &NodeContext,
) -> Result<(HttpRequest, Reply), NodeError> {
    let render = |template: &str| sandbox.render_template(template).map_err(|e| ctx.evaluation(&e));
    let render_opt = |template: &Option<String>| template.as_deref().map(render).transpose();
    let resolve_opt = |value: &Option<JsonValue>| {
        value
            .as_ref()
            .map(|v| sandbox.resolve_value(v).map_err(|e| ctx.evaluation(&e)))
            .transpose()
    };
    let render_map = |map: &BTreeMap<String, String>| {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), render(v)?)))
            .collect::<Result<BTreeMap<_, _>, NodeError>>()
    };
    let endpoints = &ctx.services.endpoints;

    let built = match config {
        NodeConfig::HttpRequest(c) => {
            let mut c = c.clone();
            c.url = render(&c.url)?;
            c.headers = render_map(&c.headers)?;
            c.query = render_map(&c.query)?;
            c.body = resolve_opt(&c.body)?;
            (providers::http_request(&c, data), Reply::Envelope)
        }
        NodeConfig::Slack(c) => {
            let mut c = c.clone();
            c.channel = render(&c.channel)?;
            c.text = render(&c.text)?;
            (providers::slack(endpoints, &c, data), Reply::Slack)
        }
        NodeConfig::Email(c) => {
            let mut c = c.clone();
            c.to = render(&c.to)?;
            c.subject = render(&c.subject)?;
            c.body = render_opt(&c.body)?;
            c.from = render_opt(&c.from)?;
            (providers::email(endpoints, &c, data), Reply::Envelope)
        }
        NodeConfig::OpenAi(c) => {
            let mut c = c.clone();
            c.prompt = render(&c.prompt)?;
            (providers::openai(endpoints, &c, data), Reply::OpenAi)
        }
        NodeConfig::GoogleSheets(c) => {
            let mut c = c.clone();
            c.spreadsheet_id = render(&c.spreadsheet_id)?;
            c.range = render(&c.range)?;
            c.values = resolve_opt(&c.values)?;
            (providers::google_sheets(endpoints, &c, data), Reply::Body)
        }
        NodeConfig::Github(c) => {
            let mut c = c.clone();
            c.owner = render(&c.owner)?;
            c.repo = render(&c.repo)?;
            c.title = render_opt(&c.title)?;
            c.body = render_opt(&c.body)?;
            (providers::github(endpoints, &c, data), Reply::Body)
        }
        NodeConfig::Notion(c) => {
            let mut c = c.clone();
            c.database_id = render_opt(&c.database_id)?;
            c.page_id = render_opt(&c.page_id)?;
            c.properties = resolve_opt(&c.properties)?;
            (providers::notion(endpoints, &c, data), Reply::Body)
        }
        NodeConfig::Stripe(c) => {
            let mut c = c.clone();
            c.currency = render_opt(&c.currency)?;
            c.customer = render_opt(&c.customer)?;
            c.email = render_opt(&c.email)?;
            (providers::stripe(endpoints, &c, data), Reply::Body)
        }
        NodeConfig::Twilio(c) => {
            let mut c = c.clone();
            c.to = render(&c.to)?;
            c.body = render(&c.body)?;
            c.from = render_opt(&c.from)?;
            (providers::twilio(endpoints, &c, data), Reply::Body)
        }
        _ => return Err(wrong_config(ctx)),
    };

    let (request, reply) = built;
    let request = request.map_err(|e: ConnectorError| ctx.connector_error(&e))?;
    Ok((request, reply))
}

fn database_params(
    config: &DatabaseConfig,
    sandbox: &Sandbox<'_>,
    ctx: &NodeContext,
) -> Result<Vec<JsonValue>, NodeError> {
    config
        .params
        .iter()
        .map(|p| sandbox.resolve_value(p))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ctx.evaluation(&e))
}

async fn query_database(
    config: &DatabaseConfig,
    data: Option<&CredentialData>,
    params: Vec<JsonValue>,
    ctx: &NodeContext,
) -> Result<NodeOutput, NodeError> {
    let Some(CredentialData::ConnectionString { url }) = data else {
        return Err(ctx.config_invalid("database requires a connection_string credential"));
    };
    debug!(node_id = %ctx.node_id, params = params.len(), "running query");
    ctx.services
        .database
        .query(url, &config.query, &params)
        .await
        .map(NodeOutput::value)
        .map_err(|report| ctx.connector_error(report.current_context()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{RecordingConnector, resolver, services_with};
    use flowforge_core::UserId;
    use flowforge_integration::{Auth, RequestBody};
    use flowforge_workflow::{HttpMethod, NodeErrorKind, NodeType};
    use serde_json::json;
    use std::sync::Arc;

    async fn context_with(
        reply: JsonValue,
        credential: Option<(&str, CredentialData)>,
    ) -> (NodeContext, Arc<RecordingConnector>, Option<String>) {
        let connector = Arc::new(RecordingConnector::replying(reply));
        let credentials = resolver();
        let id = match credential {
            Some((provider, data)) => Some(
                credentials
                    .seal(UserId::new(), "test", provider, &data)
                    .await
                    .expect("seal")
                    .id
                    .to_string(),
            ),
            None => None,
        };
        let ctx = NodeContext::detached("call", services_with(connector.clone(), credentials));
        (ctx, connector, id)
    }

    #[tokio::test]
    async fn http_request_renders_templates_and_authenticates() {
        let (ctx, connector, cred) = context_with(
            json!({ "ok": true }),
            Some(("http", CredentialData::BearerToken { token: "tok".into() })),
        )
        .await;
        let config = NodeConfig::parse(
            NodeType::HttpRequest,
            &json!({
                "method": "POST",
                "url": "https://api.example.com/orders/{{ $json.id }}",
                "headers": { "x-trace": "{{ $json.trace }}" },
                "body": { "amount": "{{ $json.amount }}" },
                "credentialId": cred,
            }),
        )
        .expect("valid");

        let output = IntegrationNode
            .execute(&config, &[json!({ "id": 42, "trace": "abc", "amount": 9.5 })], &ctx)
            .await
            .expect("execute");
        assert_eq!(output.to_json()["status"], json!(200));
        assert_eq!(output.to_json()["body"], json!({ "ok": true }));

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].method, HttpMethod::Post);
        assert_eq!(sent[0].url, "https://api.example.com/orders/42");
        assert_eq!(sent[0].headers.get("x-trace").map(String::as_str), Some("abc"));
        assert_eq!(sent[0].auth, Auth::Bearer("tok".into()));
        assert_eq!(sent[0].body, Some(RequestBody::Json(json!({ "amount": 9.5 }))));
    }

    #[tokio::test]
    async fn missing_credential_fails_without_calling_out() {
        let (ctx, connector, _) = context_with(JsonValue::Null, None).await;
        let config = NodeConfig::parse(
            NodeType::Slack,
            &json!({ "channel": "#ops", "text": "hi", "credentialId": "cred_01J00000000000000000000000" }),
        )
        .expect("valid");
        let err = IntegrationNode.execute(&config, &[], &ctx).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::CredentialNotFound);
        assert!(!err.retryable);
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn slack_error_reply_is_mapped() {
        let (ctx, _, cred) = context_with(
            json!({ "ok": false, "error": "ratelimited" }),
            Some(("slack", CredentialData::BearerToken { token: "xoxb".into() })),
        )
        .await;
        let config = NodeConfig::parse(
            NodeType::Slack,
            &json!({ "channel": "#ops", "text": "deploy {{ $json.v }}", "credentialId": cred }),
        )
        .expect("valid");
        let err = IntegrationNode
            .execute(&config, &[json!({ "v": 3 })], &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::RateLimited);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn openai_reply_is_reduced() {
        let (ctx, connector, cred) = context_with(
            json!({
                "model": "gpt-4o-mini",
                "choices": [{ "message": { "role": "assistant", "content": "hello" } }],
                "usage": { "total_tokens": 5 }
            }),
            Some(("openai", CredentialData::api_key("sk-test"))),
        )
        .await;
        let config = NodeConfig::parse(
            NodeType::OpenAi,
            &json!({ "prompt": "Greet {{ $json.name }}", "credentialId": cred }),
        )
        .expect("valid");
        let output = IntegrationNode
            .execute(&config, &[json!({ "name": "Ada" })], &ctx)
            .await
            .expect("execute");
        assert_eq!(output.to_json()["content"], json!("hello"));

        let sent = connector.sent();
        let Some(RequestBody::Json(body)) = &sent[0].body else {
            panic!("expected a json body");
        };
        assert_eq!(body["messages"][0]["content"], json!("Greet Ada"));
    }

    #[tokio::test]
    async fn database_without_connection_string_is_config_error() {
        let (ctx, _, cred) = context_with(
            JsonValue::Null,
            Some(("postgres", CredentialData::api_key("nope"))),
        )
        .await;
        let config = NodeConfig::parse(
            NodeType::Database,
            &json!({ "query": "select 1", "credentialId": cred }),
        )
        .expect("valid");
        let err = IntegrationNode.execute(&config, &[], &ctx).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::ConfigInvalid);
    }
}
