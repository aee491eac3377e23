use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::labels::{ChainLabel, SpecificationGroupLabel, SystemModelLabel};

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::from_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(ChainId);
uuid_id!(FolderId);
uuid_id!(ElementId);
uuid_id!(DependencyId);
uuid_id!(SpecificationGroupId);
uuid_id!(SystemModelId);

pub(crate) fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

/// Leaf elements carry no children; containers own an ordered child list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementBody {
    Leaf,
    Container { children: Vec<ElementId> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainElement {
    pub id: ElementId,
    pub chain_id: ChainId,
    #[serde(rename = "type")]
    pub element_type: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub properties: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<ElementId>,
    pub input_dependencies: Vec<DependencyId>,
    pub output_dependencies: Vec<DependencyId>,
    pub created_when: Option<NaiveDateTime>,
    pub modified_when: Option<NaiveDateTime>,
    #[serde(flatten)]
    pub body: ElementBody,
}

impl ChainElement {
    pub fn leaf(id: ElementId, chain_id: ChainId, element_type: &str, name: &str) -> Self {
        Self {
            id,
            chain_id,
            element_type: element_type.to_string(),
            name: name.to_string(),
            description: None,
            properties: Map::new(),
            parent: None,
            input_dependencies: Vec::new(),
            output_dependencies: Vec::new(),
            created_when: None,
            modified_when: None,
            body: ElementBody::Leaf,
        }
    }

    pub fn container(id: ElementId, chain_id: ChainId, element_type: &str, name: &str) -> Self {
        Self {
            body: ElementBody::Container {
                children: Vec::new(),
            },
            ..Self::leaf(id, chain_id, element_type, name)
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.body, ElementBody::Container { .. })
    }

    pub fn children(&self) -> &[ElementId] {
        match &self.body {
            ElementBody::Leaf => &[],
            ElementBody::Container { children } => children,
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<ElementId>> {
        match &mut self.body {
            ElementBody::Leaf => None,
            ElementBody::Container { children } => Some(children),
        }
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: &str, value: Value) {
        self.properties.insert(name.to_string(), value);
    }

    /// Reads a priority property stored either as a JSON number or a numeric string.
    pub fn priority(&self, property: &str) -> Option<i64> {
        match self.properties.get(property)? {
            Value::Number(number) => number.as_i64(),
            Value::String(raw) => raw.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn touch(&mut self) {
        self.modified_when = Some(now());
    }

    /// Timestamps as a store writes them: missing values become "now", and an
    /// element with both cleared gets equal ones.
    pub(crate) fn stored_timestamps(&self) -> (NaiveDateTime, NaiveDateTime) {
        let created = self.created_when.unwrap_or_else(now);
        (created, self.modified_when.unwrap_or(created))
    }

    pub fn dependency_ids(&self) -> impl Iterator<Item = DependencyId> + '_ {
        self.input_dependencies
            .iter()
            .chain(self.output_dependencies.iter())
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub id: DependencyId,
    pub element_from: ElementId,
    pub element_to: ElementId,
}

impl Dependency {
    pub fn of(element_from: ElementId, element_to: ElementId) -> Self {
        Self {
            id: DependencyId::generate(),
            element_from,
            element_to,
        }
    }

    pub fn touches(&self, element_id: ElementId) -> bool {
        self.element_from == element_id || self.element_to == element_id
    }
}

/// A chain together with its element arena. Elements and dependencies are
/// keyed by id; parent/child links and edge endpoints are id references.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub id: ChainId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_folder: Option<FolderId>,
    pub labels: Vec<ChainLabel>,
    pub elements: BTreeMap<ElementId, ChainElement>,
    pub dependencies: BTreeMap<DependencyId, Dependency>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overrides_chain: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overridden_by_chain: Option<ChainId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_snapshot: Option<Uuid>,
    pub snapshots: Vec<Uuid>,
    pub deployments: Vec<Uuid>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Chain {
    pub fn new(name: &str, parent_folder: Option<FolderId>) -> Self {
        let timestamp = now();
        Self {
            id: ChainId::generate(),
            name: name.to_string(),
            description: None,
            parent_folder,
            labels: Vec::new(),
            elements: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            overrides_chain: None,
            overridden_by_chain: None,
            current_snapshot: None,
            snapshots: Vec::new(),
            deployments: Vec::new(),
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn element(&self, element_id: ElementId) -> Result<&ChainElement> {
        self.elements.get(&element_id).ok_or_else(|| {
            LibError::not_found_with_code(
                "element_not_found",
                "Element not found",
                anyhow!("element {} not found in chain {}", element_id, self.id),
            )
        })
    }

    pub fn element_mut(&mut self, element_id: ElementId) -> Result<&mut ChainElement> {
        let chain_id = self.id;
        self.elements.get_mut(&element_id).ok_or_else(|| {
            LibError::not_found_with_code(
                "element_not_found",
                "Element not found",
                anyhow!("element {} not found in chain {}", element_id, chain_id),
            )
        })
    }

    pub fn root_elements(&self) -> impl Iterator<Item = &ChainElement> {
        self.elements.values().filter(|element| element.parent.is_none())
    }

    /// Inserts an edge and registers it on both endpoints' adjacency lists.
    pub fn connect(&mut self, dependency: Dependency) -> Result<()> {
        for endpoint in [dependency.element_from, dependency.element_to] {
            if !self.elements.contains_key(&endpoint) {
                return Err(LibError::invalid_with_code(
                    "dependency_foreign_endpoint",
                    "Dependency endpoints must belong to the same chain",
                    anyhow!(
                        "dependency {} endpoint {} is not in chain {}",
                        dependency.id,
                        endpoint,
                        self.id
                    ),
                ));
            }
        }
        if let Some(from) = self.elements.get_mut(&dependency.element_from) {
            from.output_dependencies.push(dependency.id);
        }
        if let Some(to) = self.elements.get_mut(&dependency.element_to) {
            to.input_dependencies.push(dependency.id);
        }
        self.dependencies.insert(dependency.id, dependency);
        Ok(())
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|label| label.name == name)
    }

    pub fn element_types(&self) -> HashSet<&str> {
        self.elements
            .values()
            .map(|element| element.element_type.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_folder: Option<FolderId>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Folder {
    pub fn new(name: &str, parent_folder: Option<FolderId>) -> Self {
        let timestamp = now();
        Self {
            id: FolderId::generate(),
            name: name.to_string(),
            description: None,
            parent_folder,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecificationGroup {
    pub id: SpecificationGroupId,
    pub name: String,
    pub system_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub synchronization: bool,
    pub labels: Vec<SpecificationGroupLabel>,
}

impl SpecificationGroup {
    pub fn new(name: &str, system_id: &str) -> Self {
        Self {
            id: SpecificationGroupId::generate(),
            name: name.to_string(),
            system_id: system_id.to_string(),
            description: None,
            url: None,
            synchronization: false,
            labels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemModel {
    pub id: SystemModelId,
    pub name: String,
    pub specification_group_id: SpecificationGroupId,
    pub labels: Vec<SystemModelLabel>,
}

/// Structural changes produced by one engine operation. The four element and
/// dependency lists are disjoint by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainDiff {
    pub created_elements: Vec<ChainElement>,
    pub updated_elements: Vec<ChainElement>,
    pub removed_elements: Vec<ChainElement>,
    pub created_dependencies: Vec<Dependency>,
    pub removed_dependencies: Vec<Dependency>,
}

impl ChainDiff {
    pub fn is_empty(&self) -> bool {
        self.created_elements.is_empty()
            && self.updated_elements.is_empty()
            && self.removed_elements.is_empty()
            && self.created_dependencies.is_empty()
            && self.removed_dependencies.is_empty()
    }

    pub fn created_element_ids(&self) -> Vec<ElementId> {
        self.created_elements.iter().map(|element| element.id).collect()
    }

    pub fn updated_element_ids(&self) -> Vec<ElementId> {
        self.updated_elements.iter().map(|element| element.id).collect()
    }

    pub fn removed_element_ids(&self) -> Vec<ElementId> {
        self.removed_elements.iter().map(|element| element.id).collect()
    }

    pub fn removed_dependency_ids(&self) -> Vec<DependencyId> {
        self.removed_dependencies
            .iter()
            .map(|dependency| dependency.id)
            .collect()
    }
}

/// Collects ids while an engine operation runs and materialises a
/// [`ChainDiff`] from the final arena state.
#[derive(Debug, Default)]
pub(crate) struct ChainDiffBuilder {
    created: Vec<ElementId>,
    updated: Vec<ElementId>,
    removed: Vec<ChainElement>,
    removed_dependencies: Vec<Dependency>,
}

impl ChainDiffBuilder {
    pub(crate) fn created(&mut self, element_id: ElementId) {
        if !self.created.contains(&element_id) {
            self.created.push(element_id);
        }
        self.updated.retain(|id| *id != element_id);
    }

    pub(crate) fn updated(&mut self, element_id: ElementId) {
        let known = self.created.contains(&element_id)
            || self.updated.contains(&element_id)
            || self.removed.iter().any(|element| element.id == element_id);
        if !known {
            self.updated.push(element_id);
        }
    }

    pub(crate) fn removed(&mut self, element: ChainElement) {
        self.updated.retain(|id| *id != element.id);
        self.created.retain(|id| *id != element.id);
        if !self.removed.iter().any(|removed| removed.id == element.id) {
            self.removed.push(element);
        }
    }

    pub(crate) fn removed_dependency(&mut self, dependency: Dependency) {
        if !self
            .removed_dependencies
            .iter()
            .any(|removed| removed.id == dependency.id)
        {
            self.removed_dependencies.push(dependency);
        }
    }

    pub(crate) fn finish(self, chain: &Chain) -> ChainDiff {
        let pick = |ids: &[ElementId]| {
            ids.iter()
                .filter_map(|id| chain.elements.get(id).cloned())
                .collect::<Vec<_>>()
        };
        ChainDiff {
            created_elements: pick(&self.created),
            updated_elements: pick(&self.updated),
            removed_elements: self.removed,
            created_dependencies: Vec::new(),
            removed_dependencies: self.removed_dependencies,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateElementPayload {
    #[serde(rename = "type")]
    pub element_type: String,
    pub parent_element_id: Option<ElementId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeParentPayload {
    pub parent_element_id: Option<ElementId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupElementsPayload {
    pub element_ids: Vec<ElementId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChainPayload {
    pub name: String,
    pub description: Option<String>,
    pub parent_folder_id: Option<FolderId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChainPayload {
    pub name: String,
    pub description: Option<String>,
    pub labels: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFolderPayload {
    pub name: String,
    pub description: Option<String>,
    pub parent_folder_id: Option<FolderId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSpecificationGroupPayload {
    pub system_id: String,
    pub name: String,
    pub description: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub synchronization: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePayload {
    pub target_folder_id: Option<FolderId>,
}

pub(crate) fn normalize_name(name: &str, entity: &'static str) -> Result<String> {
    let name = name.trim().to_string();
    if name.is_empty() {
        return Err(LibError::invalid(
            "Name is required",
            anyhow!("empty {} name", entity),
        ));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn priority_accepts_numbers_and_numeric_strings() {
        let chain_id = ChainId::generate();
        let mut element = ChainElement::leaf(ElementId::generate(), chain_id, "case", "Case");
        element.set_property("priority", json!(3));
        assert_eq!(element.priority("priority"), Some(3));

        element.set_property("priority", json!(" 7 "));
        assert_eq!(element.priority("priority"), Some(7));

        element.set_property("priority", json!(true));
        assert_eq!(element.priority("priority"), None);
    }

    #[test]
    fn connect_registers_both_adjacency_lists() {
        let mut chain = Chain::new("Orders", None);
        let a = ElementId::generate();
        let b = ElementId::generate();
        chain
            .elements
            .insert(a, ChainElement::leaf(a, chain.id, "script", "A"));
        chain
            .elements
            .insert(b, ChainElement::leaf(b, chain.id, "script", "B"));

        let dependency = Dependency::of(a, b);
        let dependency_id = dependency.id;
        chain.connect(dependency).expect("edge should connect");

        assert_eq!(chain.elements[&a].output_dependencies, vec![dependency_id]);
        assert_eq!(chain.elements[&b].input_dependencies, vec![dependency_id]);
    }

    #[test]
    fn connect_rejects_endpoint_outside_chain() {
        let mut chain = Chain::new("Orders", None);
        let a = ElementId::generate();
        chain
            .elements
            .insert(a, ChainElement::leaf(a, chain.id, "script", "A"));

        let err = chain
            .connect(Dependency::of(a, ElementId::generate()))
            .expect_err("foreign endpoint should fail");
        assert_eq!(err.code, "dependency_foreign_endpoint");
        assert!(chain.dependencies.is_empty());
    }

    #[test]
    fn diff_builder_keeps_sets_disjoint() {
        let mut chain = Chain::new("Orders", None);
        let a = ElementId::generate();
        let b = ElementId::generate();
        chain
            .elements
            .insert(a, ChainElement::leaf(a, chain.id, "script", "A"));
        chain
            .elements
            .insert(b, ChainElement::leaf(b, chain.id, "script", "B"));

        let mut builder = ChainDiffBuilder::default();
        builder.created(a);
        builder.updated(a);
        builder.updated(b);
        builder.updated(b);

        let diff = builder.finish(&chain);
        assert_eq!(diff.created_element_ids(), vec![a]);
        assert_eq!(diff.updated_element_ids(), vec![b]);
    }

    #[test]
    fn element_serializes_type_and_kind() {
        let element = ChainElement::container(
            ElementId::generate(),
            ChainId::generate(),
            "switch",
            "Switch",
        );
        let value = serde_json::to_value(&element).expect("element should serialize");
        assert_eq!(value["type"], json!("switch"));
        assert_eq!(value["kind"], json!("container"));
        assert_eq!(value["children"], json!([]));
    }
}
