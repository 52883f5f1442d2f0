//! What a node produces.
//!
//! A node's output is a list of emissions. Most nodes emit one untagged
//! value. Branching nodes tag their emission with the branch they took, and
//! an edge only carries emissions whose tag matches its label. A multiplexed
//! output makes each downstream consumer run once per emission.

use crate::graph::GraphEdge;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One value leaving a node, optionally tagged with a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub value: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// Everything a node emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    emissions: Vec<Emission>,
    #[serde(default)]
    multiplexed: bool,
}

impl NodeOutput {
    /// A single untagged value.
    #[must_use]
    pub fn value(value: JsonValue) -> Self {
        Self {
            emissions: vec![Emission {
                value,
                branch: None,
            }],
            multiplexed: false,
        }
    }

    /// A single value routed along edges labeled `branch`.
    #[must_use]
    pub fn branch(value: JsonValue, branch: impl Into<String>) -> Self {
        Self {
            emissions: vec![Emission {
                value,
                branch: Some(branch.into()),
            }],
            multiplexed: false,
        }
    }

    /// No emissions at all; every outgoing edge is untaken.
    #[must_use]
    pub fn none() -> Self {
        Self {
            emissions: Vec::new(),
            multiplexed: false,
        }
    }

    /// One untagged emission per value; consumers run once per value.
    #[must_use]
    pub fn multiplex(values: Vec<JsonValue>) -> Self {
        Self {
            emissions: values
                .into_iter()
                .map(|value| Emission {
                    value,
                    branch: None,
                })
                .collect(),
            multiplexed: true,
        }
    }

    #[must_use]
    pub fn emissions(&self) -> &[Emission] {
        &self.emissions
    }

    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.multiplexed
    }

    /// The values `edge` carries.
    #[must_use]
    pub fn delivered(&self, edge: &GraphEdge) -> Vec<&JsonValue> {
        self.emissions
            .iter()
            .filter(|e| edge.carries(e.branch.as_deref()))
            .map(|e| &e.value)
            .collect()
    }

    /// The branch of the first tagged emission.
    #[must_use]
    pub fn taken_branch(&self) -> Option<&str> {
        self.emissions.iter().find_map(|e| e.branch.as_deref())
    }

    /// The JSON form used for `$node.<id>`, node-run records and `outputData`.
    ///
    /// A single emission is its value; anything else is the array of values.
    #[must_use]
    pub fn to_json(&self) -> JsonValue {
        match self.emissions.as_slice() {
            [single] if !self.multiplexed => single.value.clone(),
            many => JsonValue::Array(many.iter().map(|e| e.value.clone()).collect()),
        }
    }

    /// Concatenates outputs of repeated invocations of one node.
    ///
    /// The result is multiplexed when more than one invocation happened, so
    /// downstream consumers keep fanning out.
    #[must_use]
    pub fn concat(outputs: Vec<NodeOutput>) -> Self {
        if outputs.len() == 1 {
            return outputs.into_iter().next().unwrap_or_else(Self::none);
        }
        Self {
            emissions: outputs.into_iter().flat_map(|o| o.emissions).collect(),
            multiplexed: true,
        }
    }
}
