//! Execution plans handed to the transport layer

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::types::{Cardinality, PlatformId};

/// Operation a step asks its platform to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Standalone fetch, no upstream key
    Retrieve,
    /// Fetch by key values whose result is merged into an upstream step
    Join,
    /// A whole sub-tree answered by a single call
    FullQuery,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Retrieve => f.write_str("retrieve"),
            Operation::Join => f.write_str("join"),
            Operation::FullQuery => f.write_str("fullquery"),
        }
    }
}

/// Where a step gets the key values it is addressed by
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum KeyBinding {
    Root,
    /// Values of `via_field` in the records of `step`
    Reference {
        step: usize,
        via_field: String,
        cardinality: Cardinality,
    },
    /// Same type served by another platform, merged on equal key values
    Partition { step: usize },
}

impl KeyBinding {
    pub fn upstream(&self) -> Option<usize> {
        match self {
            KeyBinding::Root => None,
            KeyBinding::Reference { step, .. } | KeyBinding::Partition { step } => Some(*step),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Value is an array; the field must equal one of its members
    Included,
}

/// Selection predicate on one field of one type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub type_name: String,
    pub field: String,
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl Filter {
    pub fn new(
        type_name: impl Into<String>,
        field: impl Into<String>,
        op: FilterOp,
        value: serde_json::Value,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            field: field.into(),
            op,
            value,
        }
    }

    /// Evaluate against a record value; absent values never match
    pub fn matches(&self, value: Option<&serde_json::Value>) -> bool {
        use serde_json::Value;

        let Some(value) = value else {
            return false;
        };
        match self.op {
            FilterOp::Eq => value == &self.value,
            FilterOp::Ne => value != &self.value,
            FilterOp::Included => match &self.value {
                Value::Array(items) => items.contains(value),
                other => other == value,
            },
            op => {
                let ordering = match (value, &self.value) {
                    (Value::Number(a), Value::Number(b)) => {
                        a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b))
                    }
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => None,
                };
                match (op, ordering) {
                    (FilterOp::Lt, Some(o)) => o.is_lt(),
                    (FilterOp::Le, Some(o)) => o.is_le(),
                    (FilterOp::Gt, Some(o)) => o.is_gt(),
                    (FilterOp::Ge, Some(o)) => o.is_ge(),
                    _ => false,
                }
            }
        }
    }
}

/// Which optional capabilities a step uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pushdown {
    pub selection: bool,
    pub projection: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: usize,
    pub platform: PlatformId,
    pub type_name: String,
    pub operation: Operation,
    /// Key tuple the step's records are addressed and merged by
    pub key: Vec<String>,
    pub bindings: Vec<KeyBinding>,
    /// Fields to fetch: requested fields, key fields and reference carriers
    pub fields: BTreeSet<String>,
    /// Requested field paths this step answers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub pushdown: Pushdown,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<Filter>,
    /// Supplies keys consumed by a downstream step
    #[serde(default)]
    pub critical: bool,
}

/// Ordered list of per-platform operations answering one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub root_type: String,
    pub requested_fields: Vec<String>,
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Calculate fingerprint (SHA-256) for plan caching
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).expect("plan should always serialize");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn step(&self, id: usize) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn steps_for_type<'a>(&'a self, type_name: &'a str) -> impl Iterator<Item = &'a PlanStep> + 'a {
        self.steps.iter().filter(move |s| s.type_name == type_name)
    }

    /// Steps that consume the keys produced by `id`
    pub fn dependents(&self, id: usize) -> impl Iterator<Item = &PlanStep> + '_ {
        self.steps.iter().filter(move |s| s.depends_on.contains(&id))
    }

    /// Distinct platforms touched by the plan, in step order
    pub fn platforms(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for step in &self.steps {
            if !seen.contains(&step.platform.as_str()) {
                seen.push(step.platform.as_str());
            }
        }
        seen
    }
}
