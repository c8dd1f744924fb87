//! Components: graph nodes with a `domain` tree (user intent) and a
//! `resource` tree (observed real-world state).

use serde::{Deserialize, Serialize};

use super::ids::ComponentId;

/// How a component participates in the diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComponentType {
    Component,
    /// A frame whose output sockets configure the components placed in it.
    ConfigurationFrame,
    /// A frame whose input sockets collect values from the components placed in it.
    AggregationFrame,
}

impl ComponentType {
    pub fn label(&self) -> &'static str {
        match self {
            ComponentType::Component => "Component",
            ComponentType::ConfigurationFrame => "Configuration Frame",
            ComponentType::AggregationFrame => "Aggregation Frame",
        }
    }

    pub fn is_frame(&self) -> bool {
        !matches!(self, ComponentType::Component)
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A component. `resource` is only written by pipeline outcomes (fix and
/// refresh results); user edits reach `domain` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub name: String,
    pub schema_variant: String,
    pub component_type: ComponentType,
    pub domain: serde_json::Value,
    #[serde(default)]
    pub resource: serde_json::Value,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        schema_variant: impl Into<String>,
        component_type: ComponentType,
        domain: serde_json::Value,
    ) -> Self {
        Self {
            id: ComponentId::generate(),
            name: name.into(),
            schema_variant: schema_variant.into(),
            component_type,
            domain,
            resource: serde_json::Value::Null,
        }
    }

    pub fn has_resource(&self) -> bool {
        !self.resource.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_type_labels() {
        assert_eq!(ComponentType::ConfigurationFrame.label(), "Configuration Frame");
        assert!(ComponentType::AggregationFrame.is_frame());
        assert!(!ComponentType::Component.is_frame());
    }

    #[test]
    fn test_new_component_has_no_resource() {
        let c = Component::new("web", "aws-ec2-instance", ComponentType::Component, serde_json::json!({}));
        assert!(!c.has_resource());
    }
}
