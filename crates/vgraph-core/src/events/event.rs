//! Event kinds and payloads.
//!
//! [`EventPayload`] is the tagged union of everything the engine announces;
//! [`EventPayload::kind`] is the exhaustive match the dispatcher routes on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vgraph_state::{ChangeSetPk, FixOutcome, Tenancy};

use crate::domain::{AttributeValueId, ComponentId};
use crate::func::CodeFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    ChangeSetCreated,
    ChangeSetApplied,
    ChangeSetCanceled,
    ChangeSetWritten,
    ResourceRefreshed,
    QualificationChecked,
    CodeGenerated,
    DependentValuesUpdated,
    SecretCreated,
    CommandOutput,
    CommandReturn,
    FixReturn,
    FixBatchReturn,
}

impl EventKind {
    pub const ALL: [EventKind; 13] = [
        EventKind::ChangeSetCreated,
        EventKind::ChangeSetApplied,
        EventKind::ChangeSetCanceled,
        EventKind::ChangeSetWritten,
        EventKind::ResourceRefreshed,
        EventKind::QualificationChecked,
        EventKind::CodeGenerated,
        EventKind::DependentValuesUpdated,
        EventKind::SecretCreated,
        EventKind::CommandOutput,
        EventKind::CommandReturn,
        EventKind::FixReturn,
        EventKind::FixBatchReturn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChangeSetCreated => "ChangeSetCreated",
            EventKind::ChangeSetApplied => "ChangeSetApplied",
            EventKind::ChangeSetCanceled => "ChangeSetCanceled",
            EventKind::ChangeSetWritten => "ChangeSetWritten",
            EventKind::ResourceRefreshed => "ResourceRefreshed",
            EventKind::QualificationChecked => "QualificationChecked",
            EventKind::CodeGenerated => "CodeGenerated",
            EventKind::DependentValuesUpdated => "DependentValuesUpdated",
            EventKind::SecretCreated => "SecretCreated",
            EventKind::CommandOutput => "CommandOutput",
            EventKind::CommandReturn => "CommandReturn",
            EventKind::FixReturn => "FixReturn",
            EventKind::FixBatchReturn => "FixBatchReturn",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EventPayload {
    ChangeSetCreated {
        name: String,
    },
    ChangeSetApplied {
        applied_at: DateTime<Utc>,
    },
    ChangeSetCanceled {
        canceled_at: DateTime<Utc>,
    },
    /// User-visible graph state in the change set changed.
    ChangeSetWritten {
        component_ids: Vec<ComponentId>,
    },
    ResourceRefreshed {
        component_id: ComponentId,
        resource: serde_json::Value,
    },
    QualificationChecked {
        component_id: ComponentId,
        attribute_value_id: Option<AttributeValueId>,
        func: String,
        qualified: bool,
        message: Option<String>,
    },
    CodeGenerated {
        component_id: ComponentId,
        attribute_value_id: Option<AttributeValueId>,
        func: String,
        code: String,
        format: CodeFormat,
    },
    /// One aggregate settle per propagation run.
    DependentValuesUpdated {
        resolved: Vec<AttributeValueId>,
        unresolved: Vec<AttributeValueId>,
        failed: Vec<AttributeValueId>,
    },
    SecretCreated {
        secret_id: String,
        name: String,
    },
    CommandOutput {
        execution_id: String,
        func: String,
        stream: OutputStream,
        line: String,
    },
    CommandReturn {
        execution_id: String,
        func: String,
        command: String,
        exit_code: i32,
    },
    FixReturn {
        batch_id: String,
        fix_id: String,
        component_id: String,
        action: String,
        outcome: FixOutcome,
        message: Option<String>,
        attempts: u32,
    },
    FixBatchReturn {
        batch_id: String,
        succeeded: usize,
        failed: usize,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ChangeSetCreated { .. } => EventKind::ChangeSetCreated,
            EventPayload::ChangeSetApplied { .. } => EventKind::ChangeSetApplied,
            EventPayload::ChangeSetCanceled { .. } => EventKind::ChangeSetCanceled,
            EventPayload::ChangeSetWritten { .. } => EventKind::ChangeSetWritten,
            EventPayload::ResourceRefreshed { .. } => EventKind::ResourceRefreshed,
            EventPayload::QualificationChecked { .. } => EventKind::QualificationChecked,
            EventPayload::CodeGenerated { .. } => EventKind::CodeGenerated,
            EventPayload::DependentValuesUpdated { .. } => EventKind::DependentValuesUpdated,
            EventPayload::SecretCreated { .. } => EventKind::SecretCreated,
            EventPayload::CommandOutput { .. } => EventKind::CommandOutput,
            EventPayload::CommandReturn { .. } => EventKind::CommandReturn,
            EventPayload::FixReturn { .. } => EventKind::FixReturn,
            EventPayload::FixBatchReturn { .. } => EventKind::FixBatchReturn,
        }
    }
}

/// An event, stamped with the scope it pertains to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub tenancy: Tenancy,
    pub change_set_pk: ChangeSetPk,
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

impl Event {
    pub fn new(tenancy: Tenancy, change_set_pk: ChangeSetPk, payload: EventPayload) -> Self {
        Self {
            tenancy,
            change_set_pk,
            payload,
            emitted_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_with_kind_tag() {
        let payload = EventPayload::ChangeSetCreated {
            name: "add web".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "ChangeSetCreated");
        assert_eq!(json["data"]["name"], "add web");
    }

    #[test]
    fn test_all_kinds_are_distinct() {
        let mut kinds = EventKind::ALL.to_vec();
        kinds.sort();
        kinds.dedup();
        assert_eq!(kinds.len(), EventKind::ALL.len());
    }
}
