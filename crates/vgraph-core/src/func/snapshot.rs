//! Immutable function inputs.
//!
//! A snapshot is taken when an invocation is scheduled. The function sees
//! only these values, never the live graph, so a late-running invocation
//! still computes against the state it was scheduled for.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vgraph_state::{ChangeSetPk, Tenancy};

use crate::domain::attribute::DOMAIN_PATH;
use crate::domain::{Component, ComponentId};

use super::error::{ExecutionFault, PipelineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub component_id: ComponentId,
    pub component_name: String,
    pub tenancy: Tenancy,
    pub change_set_pk: ChangeSetPk,
    /// Input values keyed by attribute path.
    pub inputs: BTreeMap<String, serde_json::Value>,
    pub resource: serde_json::Value,
    pub taken_at: DateTime<Utc>,
}

impl InputSnapshot {
    /// Snapshot a component's domain and resource trees.
    pub fn of_component(
        component: &Component,
        tenancy: Tenancy,
        change_set_pk: ChangeSetPk,
    ) -> Self {
        let mut inputs = BTreeMap::new();
        inputs.insert(DOMAIN_PATH.to_string(), component.domain.clone());
        Self {
            component_id: component.id,
            component_name: component.name.clone(),
            tenancy,
            change_set_pk,
            inputs,
            resource: component.resource.clone(),
            taken_at: Utc::now(),
        }
    }

    pub fn with_input(mut self, path: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(path.into(), value);
        self
    }

    pub fn input(&self, path: &str) -> Option<&serde_json::Value> {
        self.inputs.get(path)
    }

    /// The `/root/domain` object; functions that read domain properties
    /// fail with `MalformedInput` without it.
    pub fn domain(&self) -> PipelineResult<&serde_json::Map<String, serde_json::Value>> {
        self.input(DOMAIN_PATH)
            .and_then(|v| v.as_object())
            .ok_or_else(|| ExecutionFault::MalformedInput {
                reason: format!("{DOMAIN_PATH} is missing or not an object"),
            })
    }

    /// A string domain property.
    pub fn domain_str(&self, prop: &str) -> PipelineResult<&str> {
        self.domain()?
            .get(prop)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExecutionFault::MalformedInput {
                reason: format!("domain property {prop} is missing or not a string"),
            })
    }
}
