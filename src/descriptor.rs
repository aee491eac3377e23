use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::error::{LibError, Result};

/// Type key of the semantics-free grouping container.
pub const CONTAINER_TYPE_NAME: &str = "container";
/// Display name given to newly created grouping containers.
pub const CONTAINER_DEFAULT_NAME: &str = "Container";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub min: u32,
    /// `None` means unbounded.
    pub max: Option<u32>,
}

impl Occurrence {
    pub const ONE: Occurrence = Occurrence {
        min: 1,
        max: Some(1),
    };
    pub const ZERO_OR_ONE: Occurrence = Occurrence {
        min: 0,
        max: Some(1),
    };
    pub const ONE_OR_MANY: Occurrence = Occurrence { min: 1, max: None };
    pub const ZERO_OR_MANY: Occurrence = Occurrence { min: 0, max: None };

    pub fn allows(&self, count: usize) -> bool {
        count >= self.min as usize && self.max.is_none_or(|max| count <= max as usize)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// Copies get this property reset to its default (or dropped without one).
    #[serde(default)]
    pub reset_value_on_copy: bool,
}

impl PropertyDescriptor {
    pub fn with_default(name: &str, default_value: Value) -> Self {
        Self {
            name: name.to_string(),
            default_value: Some(default_value),
            reset_value_on_copy: false,
        }
    }

    pub fn plain(name: &str) -> Self {
        Self {
            name: name.to_string(),
            default_value: None,
            reset_value_on_copy: false,
        }
    }

    pub fn reset_on_copy(mut self) -> Self {
        self.reset_value_on_copy = true;
        self
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub container: bool,
    /// Siblings of this type carry a priority in `priority_property`.
    #[serde(default)]
    pub ordered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_property: Option<String>,
    /// Empty means any child type is accepted.
    #[serde(default)]
    pub allowed_children: BTreeMap<String, Occurrence>,
    #[serde(default = "default_true")]
    pub input_enabled: bool,
    #[serde(default)]
    pub properties: Vec<PropertyDescriptor>,
    /// Property that must always hold the element's own id (set on create and copy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_reference_property: Option<String>,
}

impl ElementDescriptor {
    pub fn leaf(name: &str, title: &str) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            container: false,
            ordered: false,
            priority_property: None,
            allowed_children: BTreeMap::new(),
            input_enabled: true,
            properties: Vec::new(),
            self_reference_property: None,
        }
    }

    pub fn container(name: &str, title: &str) -> Self {
        Self {
            container: true,
            ..Self::leaf(name, title)
        }
    }

    pub fn with_child(mut self, child_type: &str, occurrence: Occurrence) -> Self {
        self.allowed_children
            .insert(child_type.to_string(), occurrence);
        self
    }

    pub fn with_property(mut self, property: PropertyDescriptor) -> Self {
        self.properties.push(property);
        self
    }

    pub fn ordered_by(mut self, priority_property: &str) -> Self {
        self.ordered = true;
        self.priority_property = Some(priority_property.to_string());
        self
    }

    pub fn without_input(mut self) -> Self {
        self.input_enabled = false;
        self
    }

    pub fn self_referencing(mut self, property: &str) -> Self {
        self.self_reference_property = Some(property.to_string());
        self
    }

    pub fn accepts_any_child(&self) -> bool {
        self.allowed_children.is_empty()
    }

    pub fn occurrence_of(&self, child_type: &str) -> Option<Occurrence> {
        self.allowed_children.get(child_type).copied()
    }

    /// Properties that have a declared default value.
    pub fn default_properties(&self) -> Map<String, Value> {
        self.properties
            .iter()
            .filter_map(|property| {
                property
                    .default_value
                    .as_ref()
                    .map(|value| (property.name.clone(), value.clone()))
            })
            .collect()
    }

    pub fn priority_key(&self) -> Option<&str> {
        if self.ordered {
            self.priority_property.as_deref()
        } else {
            None
        }
    }
}

pub trait DescriptorRegistry: Send + Sync {
    fn descriptor(&self, element_type: &str) -> Option<&ElementDescriptor>;

    fn get(&self, element_type: &str) -> Result<&ElementDescriptor> {
        self.descriptor(element_type).ok_or_else(|| {
            LibError::invalid_with_code(
                "unknown_element_type",
                "Unknown element type",
                anyhow!("no descriptor registered for element type '{}'", element_type),
            )
        })
    }
}

/// Read-only descriptor library keyed by element type.
#[derive(Debug, Clone, Default)]
pub struct ElementLibrary {
    descriptors: HashMap<String, ElementDescriptor>,
}

impl ElementLibrary {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ElementDescriptor>) -> Self {
        Self {
            descriptors: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
        }
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let descriptors: Vec<ElementDescriptor> =
            serde_json::from_str(raw).context("invalid element library JSON")?;
        Ok(Self::from_descriptors(descriptors))
    }

    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read element library {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Library of the element types the designer ships with.
    pub fn builtin() -> Self {
        Self::from_descriptors([
            ElementDescriptor::container(CONTAINER_TYPE_NAME, CONTAINER_DEFAULT_NAME),
            ElementDescriptor::container("switch", "Switch")
                .with_child("case", Occurrence::ONE_OR_MANY)
                .with_child("default", Occurrence::ONE),
            ElementDescriptor::container("case", "Case")
                .ordered_by("priority")
                .with_property(PropertyDescriptor::with_default("condition", json!(""))),
            ElementDescriptor::container("default", "Default"),
            ElementDescriptor::container("try-catch-finally-2", "Try-Catch-Finally")
                .with_child("try-2", Occurrence::ONE)
                .with_child("catch-2", Occurrence::ZERO_OR_MANY)
                .with_child("finally-2", Occurrence::ZERO_OR_ONE),
            ElementDescriptor::container("try-2", "Try"),
            ElementDescriptor::container("catch-2", "Catch").ordered_by("priority"),
            ElementDescriptor::container("finally-2", "Finally"),
            ElementDescriptor::leaf("http-trigger", "HTTP Trigger")
                .without_input()
                .with_property(PropertyDescriptor::with_default("httpMethodRestrict", json!("POST")))
                .with_property(PropertyDescriptor::plain("contextPath").reset_on_copy()),
            ElementDescriptor::leaf("chain-trigger-2", "Chain Trigger")
                .without_input()
                .self_referencing("elementId"),
            ElementDescriptor::leaf("service-call", "Service Call")
                .with_property(PropertyDescriptor::with_default("retryCount", json!(0)))
                .with_property(PropertyDescriptor::with_default("retryDelay", json!(5000)))
                .with_property(PropertyDescriptor::plain("integrationOperationId")),
            ElementDescriptor::leaf("script", "Script")
                .with_property(PropertyDescriptor::with_default("script", json!(""))),
            ElementDescriptor::leaf("log-record", "Log Record")
                .with_property(PropertyDescriptor::with_default("logLevel", json!("INFO"))),
        ])
    }
}

impl DescriptorRegistry for ElementLibrary {
    fn descriptor(&self, element_type: &str) -> Option<&ElementDescriptor> {
        self.descriptors.get(element_type)
    }
}

#[cfg(test)]
pub(crate) fn test_library() -> ElementLibrary {
    ElementLibrary::from_descriptors([
        ElementDescriptor::container(CONTAINER_TYPE_NAME, CONTAINER_DEFAULT_NAME),
        ElementDescriptor::leaf("sender", "Sender")
            .with_property(PropertyDescriptor::with_default("retryCount", json!(3)))
            .with_property(PropertyDescriptor::plain("url").reset_on_copy()),
        ElementDescriptor::leaf("trigger", "Trigger")
            .without_input()
            .self_referencing("elementId"),
        ElementDescriptor::container("switch", "Switch")
            .with_child("case", Occurrence::ONE_OR_MANY)
            .with_child("default", Occurrence::ONE),
        ElementDescriptor::container("case", "Case")
            .ordered_by("priority")
            .with_property(PropertyDescriptor::with_default("condition", json!("true"))),
        ElementDescriptor::container("default", "Default"),
        ElementDescriptor::container("fork", "Fork")
            .with_child("case", Occurrence { min: 2, max: None })
            .with_child("default", Occurrence::ONE_OR_MANY)
            .with_child("sender", Occurrence::ONE),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occurrence_bounds() {
        assert!(Occurrence::ONE.allows(1));
        assert!(!Occurrence::ONE.allows(2));
        assert!(!Occurrence::ONE.allows(0));
        assert!(Occurrence::ZERO_OR_MANY.allows(0));
        assert!(Occurrence::ONE_OR_MANY.allows(40));
    }

    #[test]
    fn default_properties_only_include_declared_defaults() {
        let library = test_library();
        let sender = library.get("sender").expect("sender should exist");
        let defaults = sender.default_properties();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults["retryCount"], json!(3));
    }

    #[test]
    fn unknown_type_is_a_validation_error() {
        let library = test_library();
        let err = library.get("unknown").expect_err("unknown type should fail");
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidInput);
        assert_eq!(err.code, "unknown_element_type");
    }

    #[test]
    fn priority_key_requires_ordered_flag() {
        let mut descriptor = ElementDescriptor::container("case", "Case").ordered_by("priority");
        assert_eq!(descriptor.priority_key(), Some("priority"));
        descriptor.ordered = false;
        assert_eq!(descriptor.priority_key(), None);
    }

    #[test]
    fn library_loads_from_json() {
        let library = ElementLibrary::from_json_str(
            r#"[
                {"name": "switch", "title": "Switch", "container": true,
                 "allowedChildren": {"case": {"min": 1, "max": null}}},
                {"name": "case", "title": "Case", "container": true, "ordered": true,
                 "priorityProperty": "priority"},
                {"name": "http-trigger", "title": "HTTP Trigger", "inputEnabled": false,
                 "properties": [{"name": "contextPath", "resetValueOnCopy": true}]}
            ]"#,
        )
        .expect("library should parse");

        assert_eq!(library.len(), 3);
        let case = library.get("case").expect("case should exist");
        assert!(case.input_enabled);
        assert_eq!(case.priority_key(), Some("priority"));
        let trigger = library.get("http-trigger").expect("trigger should exist");
        assert!(!trigger.input_enabled);
        assert!(trigger.properties[0].reset_value_on_copy);
        let switch = library.get("switch").expect("switch should exist");
        assert_eq!(switch.occurrence_of("case"), Some(Occurrence::ONE_OR_MANY));
    }

    #[test]
    fn builtin_library_has_grouping_container() {
        let library = ElementLibrary::builtin();
        let container = library
            .get(CONTAINER_TYPE_NAME)
            .expect("grouping container should exist");
        assert!(container.container);
        assert!(container.accepts_any_child());
    }
}
