//! Schema variants: the blueprint that turns a component's domain tree into
//! its attribute value graph.

use serde::{Deserialize, Serialize};

use super::attribute::{
    derive_plain, domain_prop_path, AttributeValue, Derivation, ValueStatus, DOMAIN_PATH,
    INPUT_SOCKET_PREFIX, OUTPUT_SOCKET_PREFIX,
};
use super::component::{Component, ComponentType};
use super::ids::AttributeValueId;
use crate::error::{GraphError, GraphResult};

/// An output socket exposing one domain property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSocket {
    pub name: String,
    pub source_prop: String,
}

/// A function-derived value: `func` runs over the values at `inputs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuncBinding {
    pub path: String,
    pub func: String,
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaVariant {
    pub name: String,
    pub component_type: ComponentType,
    #[serde(default)]
    pub input_sockets: Vec<String>,
    #[serde(default)]
    pub output_sockets: Vec<OutputSocket>,
    #[serde(default)]
    pub funcs: Vec<FuncBinding>,
}

impl SchemaVariant {
    pub fn new(name: impl Into<String>, component_type: ComponentType) -> Self {
        Self {
            name: name.into(),
            component_type,
            input_sockets: Vec::new(),
            output_sockets: Vec::new(),
            funcs: Vec::new(),
        }
    }

    pub fn with_input_socket(mut self, name: impl Into<String>) -> Self {
        self.input_sockets.push(name.into());
        self
    }

    pub fn with_output_socket(mut self, name: impl Into<String>, source_prop: impl Into<String>) -> Self {
        self.output_sockets.push(OutputSocket {
            name: name.into(),
            source_prop: source_prop.into(),
        });
        self
    }

    pub fn with_func(
        mut self,
        path: impl Into<String>,
        func: impl Into<String>,
        inputs: &[&str],
    ) -> Self {
        self.funcs.push(FuncBinding {
            path: path.into(),
            func: func.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Build the attribute values for a new component, in dependency order.
    ///
    /// Function-derived values start `Pending` with a null value; everything
    /// else is resolved immediately.
    pub fn instantiate(&self, component: &Component) -> GraphResult<Vec<AttributeValue>> {
        let domain = component
            .domain
            .as_object()
            .ok_or_else(|| GraphError::InvalidVariant {
                variant: self.name.clone(),
                reason: "domain must be an object".into(),
            })?;

        let mut values: Vec<AttributeValue> = Vec::new();

        let mut props: Vec<&String> = domain.keys().collect();
        for socket in &self.output_sockets {
            if !domain.contains_key(&socket.source_prop) {
                props.push(&socket.source_prop);
            }
        }
        props.sort();
        props.dedup();

        for prop in &props {
            let value = domain.get(*prop).cloned().unwrap_or(serde_json::Value::Null);
            values.push(AttributeValue::new(
                component.id,
                domain_prop_path(prop),
                Derivation::Input,
                value,
            ));
        }
        for socket in &self.input_sockets {
            values.push(AttributeValue::new(
                component.id,
                format!("{INPUT_SOCKET_PREFIX}{socket}"),
                Derivation::Copy,
                serde_json::Value::Null,
            ));
        }

        // `/root/domain` aggregates props first, then input sockets.
        let deps: Vec<usize> = (0..values.len()).collect();
        let domain_av = derived(component, DOMAIN_PATH, Derivation::Object, &values, &deps);
        values.push(domain_av);

        for socket in &self.output_sockets {
            let source = by_path_index(&values, &domain_prop_path(&socket.source_prop))?;
            let av = derived(
                component,
                &format!("{OUTPUT_SOCKET_PREFIX}{}", socket.name),
                Derivation::Copy,
                &values,
                &[source],
            );
            values.push(av);
        }

        for binding in &self.funcs {
            let deps: Vec<AttributeValueId> = binding
                .inputs
                .iter()
                .map(|path| by_path_index(&values, path).map(|i| values[i].id))
                .collect::<GraphResult<_>>()
                .map_err(|_| GraphError::InvalidVariant {
                    variant: self.name.clone(),
                    reason: format!("{} reads an unknown path", binding.path),
                })?;
            let mut av = AttributeValue::new(
                component.id,
                binding.path.clone(),
                Derivation::Func {
                    func: binding.func.clone(),
                },
                serde_json::Value::Null,
            )
            .with_dependencies(deps);
            av.status = ValueStatus::Pending;
            values.push(av);
        }

        Ok(values)
    }
}

fn by_path_index(values: &[AttributeValue], path: &str) -> GraphResult<usize> {
    values
        .iter()
        .position(|v| v.path == path)
        .ok_or_else(|| GraphError::InvalidVariant {
            variant: String::new(),
            reason: format!("no value at {path}"),
        })
}

fn derived(
    component: &Component,
    path: &str,
    derivation: Derivation,
    values: &[AttributeValue],
    deps: &[usize],
) -> AttributeValue {
    let inputs: Vec<(&str, &serde_json::Value)> =
        deps.iter().map(|&i| (values[i].name(), &values[i].value)).collect();
    let value = derive_plain(&derivation, &inputs).unwrap_or(serde_json::Value::Null);
    AttributeValue::new(component.id, path, derivation, value)
        .with_dependencies(deps.iter().map(|&i| values[i].id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variant() -> SchemaVariant {
        SchemaVariant::new("thing", ComponentType::Component)
            .with_input_socket("region")
            .with_output_socket("name", "name")
            .with_func("/root/code", "gen", &[DOMAIN_PATH])
    }

    #[test]
    fn test_instantiate_builds_domain_graph() {
        let c = Component::new(
            "c",
            "thing",
            ComponentType::Component,
            json!({"region": "us-east-1", "name": "web"}),
        );
        let values = variant().instantiate(&c).unwrap();
        let paths: Vec<&str> = values.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/root/domain/name",
                "/root/domain/region",
                "/root/input_socket/region",
                "/root/domain",
                "/root/output_socket/name",
                "/root/code",
            ]
        );

        let domain = &values[3];
        assert_eq!(domain.value, json!({"name": "web", "region": "us-east-1"}));
        assert_eq!(domain.depends_on.len(), 3);

        let code = &values[5];
        assert_eq!(code.status, ValueStatus::Pending);
        assert_eq!(code.depends_on, vec![domain.id]);
    }

    #[test]
    fn test_non_object_domain_rejected() {
        let c = Component::new("c", "thing", ComponentType::Component, json!(3));
        assert!(matches!(
            variant().instantiate(&c),
            Err(GraphError::InvalidVariant { .. })
        ));
    }

    #[test]
    fn test_unknown_func_input_rejected() {
        let v = SchemaVariant::new("bad", ComponentType::Component).with_func(
            "/root/code",
            "gen",
            &["/root/nowhere"],
        );
        let c = Component::new("c", "bad", ComponentType::Component, json!({}));
        assert!(v.instantiate(&c).is_err());
    }
}
