//! Nodes that only transform or route data.

use super::{collection, wrong_config};
use crate::executor::{NodeContext, NodeExecutor};
use async_trait::async_trait;
use flowforge_workflow::config::{MergeMode, SortOrder};
use flowforge_workflow::expression::{Sandbox, Scope, lookup_path, loose_eq, merge_inputs};
use flowforge_workflow::{NodeConfig, NodeError, NodeOutput};
use serde_json::{Map, Value as JsonValue};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Two-way branch on a condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfNode;

#[async_trait]
impl NodeExecutor for IfNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::If(config) = config else {
            return Err(wrong_config(ctx));
        };
        let json = merge_inputs(inputs);
        let taken = ctx
            .sandbox(&json, inputs)
            .condition(&config.condition)
            .map_err(|e| ctx.evaluation(&e))?;
        debug!(node_id = %ctx.node_id, taken, "condition evaluated");
        let branch = if taken { "true" } else { "false" };
        Ok(NodeOutput::branch(json, branch))
    }
}

/// Multi-way branch; the first case equal to the value wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchNode;

#[async_trait]
impl NodeExecutor for SwitchNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Switch(config) = config else {
            return Err(wrong_config(ctx));
        };
        let json = merge_inputs(inputs);
        let value = ctx
            .sandbox(&json, inputs)
            .evaluate(&config.value)
            .map_err(|e| ctx.evaluation(&e))?;

        let output = config
            .cases
            .iter()
            .find(|case| loose_eq(&case.value, &value))
            .map(|case| case.output.as_str())
            .or(config.default.as_deref());
        Ok(match output {
            Some(branch) => NodeOutput::branch(json, branch),
            None => {
                debug!(node_id = %ctx.node_id, %value, "no case matched and no default");
                NodeOutput::none()
            }
        })
    }
}

/// Keeps the items that satisfy a condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterNode;

#[async_trait]
impl NodeExecutor for FilterNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Filter(config) = config else {
            return Err(wrong_config(ctx));
        };
        let json = merge_inputs(inputs);
        let sandbox = ctx.sandbox(&json, inputs);
        let items = collection(ctx, config.items.as_deref(), &sandbox, &json)?;
        let kept = sandbox
            .filter_items(&config.condition, items)
            .map_err(|e| ctx.evaluation(&e))?;
        Ok(NodeOutput::value(JsonValue::Array(kept)))
    }
}

/// Maps every item of a collection; downstream runs once on the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopNode;

#[async_trait]
impl NodeExecutor for LoopNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Loop(config) = config else {
            return Err(wrong_config(ctx));
        };
        let json = merge_inputs(inputs);
        let sandbox = ctx.sandbox(&json, inputs);
        let items = collection(ctx, config.items.as_deref(), &sandbox, &json)?;

        let Some(source) = config.expression.as_deref().filter(|s| !s.trim().is_empty()) else {
            return Ok(NodeOutput::value(JsonValue::Array(items)));
        };
        let mapped = sandbox
            .map_items(source, &items)
            .map_err(|e| ctx.evaluation(&e))?;
        Ok(NodeOutput::value(JsonValue::Array(mapped)))
    }
}

/// Writes computed fields onto the input object.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetNode;

#[async_trait]
impl NodeExecutor for SetNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Set(config) = config else {
            return Err(wrong_config(ctx));
        };
        let json = merge_inputs(inputs);
        let sandbox = ctx.sandbox(&json, inputs);

        let mut object = match (&json, config.keep_input) {
            (JsonValue::Object(map), true) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in &config.values {
            let resolved = sandbox.resolve_value(value).map_err(|e| ctx.evaluation(&e))?;
            object.insert(key.clone(), resolved);
        }
        Ok(NodeOutput::value(JsonValue::Object(object)))
    }
}

/// Stable sort by a field path; items without the field go last.
#[derive(Debug, Clone, Copy, Default)]
pub struct SortNode;

#[async_trait]
impl NodeExecutor for SortNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Sort(config) = config else {
            return Err(wrong_config(ctx));
        };
        let json = merge_inputs(inputs);
        let mut items = collection(ctx, config.items.as_deref(), &ctx.sandbox(&json, inputs), &json)?;

        let field = config.field.trim_start_matches("$item.");
        items.sort_by(|a, b| {
            let left = lookup_path(a, field).filter(|v| !v.is_null());
            let right = lookup_path(b, field).filter(|v| !v.is_null());
            match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(l), Some(r)) => match config.order {
                    SortOrder::Asc => compare(l, r),
                    SortOrder::Desc => compare(r, l),
                },
            }
        });
        Ok(NodeOutput::value(JsonValue::Array(items)))
    }
}

fn rank(value: &JsonValue) -> u8 {
    match value {
        JsonValue::Null => 0,
        JsonValue::Bool(_) => 1,
        JsonValue::Number(_) => 2,
        JsonValue::String(_) => 3,
        JsonValue::Array(_) => 4,
        JsonValue::Object(_) => 5,
    }
}

fn compare(a: &JsonValue, b: &JsonValue) -> Ordering {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (JsonValue::String(x), JsonValue::String(y)) => x.cmp(y),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Runs user JavaScript on a blocking thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeNode;

#[async_trait]
impl NodeExecutor for CodeNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Code(config) = config else {
            return Err(wrong_config(ctx));
        };
        let code = config.code.clone();
        let json = merge_inputs(inputs);
        let inputs = inputs.to_vec();
        let trigger = Arc::clone(&ctx.trigger);
        let nodes = Arc::clone(&ctx.nodes);
        let limits = ctx.services.config.script_limits();

        let result = tokio::task::spawn_blocking(move || {
            let scope = Scope::new(&json)
                .with_inputs(&inputs)
                .with_trigger(&trigger)
                .with_nodes(&nodes);
            Sandbox::new(scope, limits).run_code(&code)
        })
        .await
        .map_err(|e| NodeError::evaluation(ctx.node_id.clone(), format!("script task failed: {e}")))?;

        let output = result.map_err(|e| ctx.evaluation(&e))?;
        debug!(node_id = %ctx.node_id, "code ran");
        Ok(NodeOutput::value(output))
    }
}

/// Joins the outputs of several predecessors.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeNode;

#[async_trait]
impl NodeExecutor for MergeNode {
    async fn execute(
        &self,
        config: &NodeConfig,
        inputs: &[JsonValue],
        ctx: &NodeContext,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Merge(config) = config else {
            return Err(wrong_config(ctx));
        };
        Ok(match config.mode {
            MergeMode::Combine => NodeOutput::value(JsonValue::Array(inputs.to_vec())),
            MergeMode::Append => {
                let mut flat = Vec::new();
                for input in inputs {
                    match input {
                        JsonValue::Array(items) => flat.extend(items.iter().cloned()),
                        other => flat.push(other.clone()),
                    }
                }
                NodeOutput::value(JsonValue::Array(flat))
            }
            MergeMode::Multiplex => NodeOutput::multiplex(inputs.to_vec()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use flowforge_workflow::{NodeErrorKind, NodeType};
    use serde_json::json;

    fn parse(node_type: NodeType, raw: JsonValue) -> NodeConfig {
        NodeConfig::parse(node_type, &raw).expect("valid config")
    }

    async fn run(
        executor: impl NodeExecutor,
        node_type: NodeType,
        raw: JsonValue,
        inputs: &[JsonValue],
    ) -> Result<NodeOutput, NodeError> {
        executor
            .execute(&parse(node_type, raw), inputs, &context("n"))
            .await
    }

    #[tokio::test]
    async fn if_tags_the_taken_branch() {
        let config = json!({ "condition": "$json.amount > 100" });
        let high = run(IfNode, NodeType::If, config.clone(), &[json!({ "amount": 250 })])
            .await
            .expect("run");
        assert_eq!(high.taken_branch(), Some("true"));
        assert_eq!(high.to_json(), json!({ "amount": 250 }));

        let low = run(IfNode, NodeType::If, config, &[json!({ "amount": 5 })])
            .await
            .expect("run");
        assert_eq!(low.taken_branch(), Some("false"));
    }

    #[tokio::test]
    async fn if_with_bad_expression_is_not_retryable() {
        let err = run(IfNode, NodeType::If, json!({ "condition": "$json.a >" }), &[json!({})])
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::EvaluationError);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn switch_picks_first_match_then_default() {
        let config = json!({
            "value": "$json.tier",
            "cases": [
                { "value": "gold", "output": "vip" },
                { "value": "gold", "output": "shadowed" }
            ],
            "default": "other"
        });
        let gold = run(SwitchNode, NodeType::Switch, config.clone(), &[json!({ "tier": "gold" })])
            .await
            .expect("run");
        assert_eq!(gold.taken_branch(), Some("vip"));

        let bronze = run(SwitchNode, NodeType::Switch, config, &[json!({ "tier": "bronze" })])
            .await
            .expect("run");
        assert_eq!(bronze.taken_branch(), Some("other"));
    }

    #[tokio::test]
    async fn switch_matches_numbers_loosely_and_may_emit_nothing() {
        let config = json!({ "value": "$json.code", "cases": [{ "value": 2, "output": "two" }] });
        let two = run(SwitchNode, NodeType::Switch, config.clone(), &[json!({ "code": 2.0 })])
            .await
            .expect("run");
        assert_eq!(two.taken_branch(), Some("two"));

        let none = run(SwitchNode, NodeType::Switch, config, &[json!({ "code": 3 })])
            .await
            .expect("run");
        assert!(none.emissions().is_empty());
    }

    #[tokio::test]
    async fn filter_keeps_matching_items() {
        let output = run(
            FilterNode,
            NodeType::Filter,
            json!({ "condition": "$item.price > 10" }),
            &[json!([{ "price": 5 }, { "price": 12 }, { "price": 30 }])],
        )
        .await
        .expect("run");
        assert_eq!(output.to_json(), json!([{ "price": 12 }, { "price": 30 }]));
    }

    #[tokio::test]
    async fn filter_with_no_matches_is_empty_not_error() {
        let output = run(
            FilterNode,
            NodeType::Filter,
            json!({ "condition": "$item > 100", "items": "$json.values" }),
            &[json!({ "values": [1, 2, 3] })],
        )
        .await
        .expect("run");
        assert_eq!(output.to_json(), json!([]));
    }

    #[tokio::test]
    async fn filter_rejects_non_collections() {
        let err = run(
            FilterNode,
            NodeType::Filter,
            json!({ "condition": "true" }),
            &[json!("text")],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::ConfigInvalid);
    }

    #[tokio::test]
    async fn loop_maps_items_into_one_collection() {
        let output = run(
            LoopNode,
            NodeType::Loop,
            json!({ "expression": "$item * 2 + $index" }),
            &[json!([1, 2, 3])],
        )
        .await
        .expect("run");
        assert!(!output.is_multiplexed());
        assert_eq!(output.to_json(), json!([2, 5, 8]));
    }

    #[tokio::test]
    async fn set_merges_onto_input() {
        let output = run(
            SetNode,
            NodeType::Set,
            json!({ "values": { "total": "{{ $json.price * $json.qty }}", "note": "n={{ $json.qty }}" } }),
            &[json!({ "price": 3, "qty": 4 })],
        )
        .await
        .expect("run");
        assert_eq!(
            output.to_json(),
            json!({ "price": 3, "qty": 4, "total": 12, "note": "n=4" })
        );

        let fresh = run(
            SetNode,
            NodeType::Set,
            json!({ "values": { "only": true }, "keepInput": false }),
            &[json!({ "price": 3 })],
        )
        .await
        .expect("run");
        assert_eq!(fresh.to_json(), json!({ "only": true }));
    }

    #[tokio::test]
    async fn sort_is_stable_with_missing_fields_last() {
        let items = json!([
            { "id": "a", "n": 2 },
            { "id": "b" },
            { "id": "c", "n": 1 },
            { "id": "d", "n": 2 }
        ]);
        let asc = run(SortNode, NodeType::Sort, json!({ "field": "n" }), &[items.clone()])
            .await
            .expect("run");
        let ids: Vec<_> = asc.to_json().as_array().expect("array").iter().map(|i| i["id"].clone()).collect();
        assert_eq!(ids, vec![json!("c"), json!("a"), json!("d"), json!("b")]);

        let desc = run(
            SortNode,
            NodeType::Sort,
            json!({ "field": "n", "order": "desc" }),
            &[items],
        )
        .await
        .expect("run");
        let ids: Vec<_> = desc.to_json().as_array().expect("array").iter().map(|i| i["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("d"), json!("c"), json!("b")]);
    }

    #[tokio::test]
    async fn code_evaluates_expression() {
        let output = run(
            CodeNode,
            NodeType::Code,
            json!({ "code": "upper($json.name)" }),
            &[json!({ "name": "ada" })],
        )
        .await
        .expect("run");
        assert_eq!(output.to_json(), json!("ADA"));
    }

    #[tokio::test]
    async fn code_runs_javascript_statements() {
        let code = r#"
            const totals = {};
            for (const order of $json.orders) {
                totals[order.customer] = (totals[order.customer] ?? 0) + order.amount;
            }
            return Object.entries(totals).map(([customer, total]) => ({ customer, total }));
        "#;
        let output = run(
            CodeNode,
            NodeType::Code,
            json!({ "code": code }),
            &[json!({ "orders": [
                { "customer": "a", "amount": 5 },
                { "customer": "b", "amount": 1 },
                { "customer": "a", "amount": 2 }
            ] })],
        )
        .await
        .expect("run");
        assert_eq!(
            output.to_json(),
            json!([{ "customer": "a", "total": 7 }, { "customer": "b", "total": 1 }])
        );
    }

    #[tokio::test]
    async fn code_exceptions_are_evaluation_errors() {
        let err = run(
            CodeNode,
            NodeType::Code,
            json!({ "code": "if ($json.n < 0) throw new Error('negative'); return $json.n;" }),
            &[json!({ "n": -1 })],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::EvaluationError);
        assert!(!err.retryable);
        assert!(err.message.contains("negative"), "{}", err.message);
    }

    #[tokio::test]
    async fn code_that_never_finishes_is_interrupted() {
        let mut ctx = context("n");
        let mut services = (*ctx.services).clone();
        services.config.script_timeout_ms = 50;
        ctx.services = Arc::new(services);
        let config = parse(NodeType::Code, json!({ "code": "for (;;) {} return 1;" }));

        let err = CodeNode.execute(&config, &[], &ctx).await.unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::EvaluationError);
        assert!(err.message.contains("time budget"), "{}", err.message);
    }

    #[tokio::test]
    async fn deeply_nested_condition_is_an_evaluation_error() {
        let condition = format!("{}true", "!".repeat(200_000));
        let err = run(IfNode, NodeType::If, json!({ "condition": condition }), &[json!({})])
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::EvaluationError);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn merge_modes() {
        let inputs = [json!([1, 2]), json!([3, 4])];
        let combine = run(MergeNode, NodeType::Merge, json!({ "mode": "combine" }), &inputs)
            .await
            .expect("run");
        assert_eq!(combine.to_json(), json!([[1, 2], [3, 4]]));

        let append = run(MergeNode, NodeType::Merge, json!({ "mode": "append" }), &inputs)
            .await
            .expect("run");
        assert_eq!(append.to_json(), json!([1, 2, 3, 4]));

        let multiplex = run(MergeNode, NodeType::Merge, json!({ "mode": "multiplex" }), &inputs)
            .await
            .expect("run");
        assert!(multiplex.is_multiplexed());
        assert_eq!(multiplex.emissions().len(), 2);
    }

    #[tokio::test]
    async fn wrong_config_variant_is_rejected() {
        let err = IfNode
            .execute(&NodeConfig::Comment, &[], &context("n"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, NodeErrorKind::ConfigInvalid);
    }
}
