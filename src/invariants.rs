use std::collections::HashSet;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::algorithms::{ancestors, children_of_type};
use crate::descriptor::{DescriptorRegistry, ElementDescriptor};
use crate::error::{LibError, Result};
use crate::models::{Chain, ChainElement, DependencyId, ElementId};

/// Arena consistency problems: broken parent/child links or adjacency lists
/// out of sync with the dependency table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainInvariantViolation {
    ForeignElement {
        element_id: ElementId,
    },
    UnknownParent {
        element_id: ElementId,
        parent_id: ElementId,
    },
    ParentNotContainer {
        element_id: ElementId,
        parent_id: ElementId,
    },
    ChildNotListed {
        element_id: ElementId,
        parent_id: ElementId,
    },
    ChildParentMismatch {
        parent_id: ElementId,
        child_id: ElementId,
    },
    ParentCycle {
        element_id: ElementId,
    },
    UnknownDependencyEndpoint {
        dependency_id: DependencyId,
        missing_element_id: ElementId,
    },
    AdjacencyMismatch {
        element_id: ElementId,
        dependency_id: DependencyId,
    },
}

impl ChainInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            ChainInvariantViolation::ForeignElement { .. } => "chain_foreign_element",
            ChainInvariantViolation::UnknownParent { .. } => "chain_unknown_parent",
            ChainInvariantViolation::ParentNotContainer { .. } => "chain_parent_not_container",
            ChainInvariantViolation::ChildNotListed { .. } => "chain_child_not_listed",
            ChainInvariantViolation::ChildParentMismatch { .. } => "chain_child_parent_mismatch",
            ChainInvariantViolation::ParentCycle { .. } => "chain_parent_cycle",
            ChainInvariantViolation::UnknownDependencyEndpoint { .. } => {
                "chain_unknown_dependency_endpoint"
            }
            ChainInvariantViolation::AdjacencyMismatch { .. } => "chain_adjacency_mismatch",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            ChainInvariantViolation::ForeignElement { .. } => {
                "Element belongs to a different chain"
            }
            ChainInvariantViolation::UnknownParent { .. } => {
                "Element references a parent that does not exist"
            }
            ChainInvariantViolation::ParentNotContainer { .. } => {
                "Element parent must be a container"
            }
            ChainInvariantViolation::ChildNotListed { .. } => {
                "Element is missing from its parent's children"
            }
            ChainInvariantViolation::ChildParentMismatch { .. } => {
                "Container lists a child that does not point back to it"
            }
            ChainInvariantViolation::ParentCycle { .. } => "Element hierarchy must be acyclic",
            ChainInvariantViolation::UnknownDependencyEndpoint { .. } => {
                "Dependency references an element that does not exist"
            }
            ChainInvariantViolation::AdjacencyMismatch { .. } => {
                "Element dependency lists are out of sync"
            }
        }
    }
}

pub fn chain_invariant_violations(chain: &Chain) -> Vec<ChainInvariantViolation> {
    let mut violations = Vec::new();

    for element in chain.elements.values() {
        if element.chain_id != chain.id {
            violations.push(ChainInvariantViolation::ForeignElement {
                element_id: element.id,
            });
        }

        if let Some(parent_id) = element.parent {
            match chain.elements.get(&parent_id) {
                None => violations.push(ChainInvariantViolation::UnknownParent {
                    element_id: element.id,
                    parent_id,
                }),
                Some(parent) if !parent.is_container() => {
                    violations.push(ChainInvariantViolation::ParentNotContainer {
                        element_id: element.id,
                        parent_id,
                    })
                }
                Some(parent) if !parent.children().contains(&element.id) => {
                    violations.push(ChainInvariantViolation::ChildNotListed {
                        element_id: element.id,
                        parent_id,
                    })
                }
                Some(_) => {}
            }

            if ancestors(chain, element.id).last().is_some_and(|root| {
                chain
                    .elements
                    .get(root)
                    .is_some_and(|root| root.parent.is_some())
            }) {
                violations.push(ChainInvariantViolation::ParentCycle {
                    element_id: element.id,
                });
            }
        }

        for child_id in element.children() {
            let points_back = chain
                .elements
                .get(child_id)
                .is_some_and(|child| child.parent == Some(element.id));
            if !points_back {
                violations.push(ChainInvariantViolation::ChildParentMismatch {
                    parent_id: element.id,
                    child_id: *child_id,
                });
            }
        }

        for dependency_id in &element.output_dependencies {
            let matches = chain
                .dependencies
                .get(dependency_id)
                .is_some_and(|dependency| dependency.element_from == element.id);
            if !matches {
                violations.push(ChainInvariantViolation::AdjacencyMismatch {
                    element_id: element.id,
                    dependency_id: *dependency_id,
                });
            }
        }
        for dependency_id in &element.input_dependencies {
            let matches = chain
                .dependencies
                .get(dependency_id)
                .is_some_and(|dependency| dependency.element_to == element.id);
            if !matches {
                violations.push(ChainInvariantViolation::AdjacencyMismatch {
                    element_id: element.id,
                    dependency_id: *dependency_id,
                });
            }
        }
    }

    for dependency in chain.dependencies.values() {
        for (endpoint, registered) in [
            (dependency.element_from, true),
            (dependency.element_to, false),
        ] {
            let Some(element) = chain.elements.get(&endpoint) else {
                violations.push(ChainInvariantViolation::UnknownDependencyEndpoint {
                    dependency_id: dependency.id,
                    missing_element_id: endpoint,
                });
                continue;
            };
            let adjacency = if registered {
                &element.output_dependencies
            } else {
                &element.input_dependencies
            };
            if !adjacency.contains(&dependency.id) {
                violations.push(ChainInvariantViolation::AdjacencyMismatch {
                    element_id: endpoint,
                    dependency_id: dependency.id,
                });
            }
        }
    }

    violations
}

pub fn ensure_chain_invariants(chain: &Chain) -> Result<()> {
    let violations = chain_invariant_violations(chain);
    if let Some(first) = violations.first() {
        return Err(LibError::invalid_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!(
                "chain invariant validation failed for chain {}: {:?}",
                chain.id,
                violations
            ),
        ));
    }

    Ok(())
}

/// Checks that an element of `child` type may be placed under `parent_id`.
pub fn ensure_child_insertable(
    chain: &Chain,
    parent_id: ElementId,
    child: &ElementDescriptor,
    registry: &dyn DescriptorRegistry,
) -> Result<()> {
    let parent = chain.element(parent_id)?;
    if !parent.is_container() {
        return Err(LibError::invalid_with_code(
            "parent_not_container",
            "Parent element is not a container",
            anyhow!(
                "element {} of type '{}' cannot hold children",
                parent.id,
                parent.element_type
            ),
        ));
    }

    let parent_descriptor = registry.get(&parent.element_type)?;
    if parent_descriptor.accepts_any_child() {
        if !child.input_enabled {
            return Err(LibError::invalid_with_code(
                "child_input_disabled",
                "Element with disabled input cannot be placed in this container",
                anyhow!(
                    "type '{}' has no input and '{}' accepts only input-enabled children",
                    child.name,
                    parent_descriptor.name
                ),
            ));
        }
        return Ok(());
    }

    let Some(occurrence) = parent_descriptor.occurrence_of(&child.name) else {
        return Err(LibError::invalid_with_code(
            "parent_type_mismatch",
            "Element type is not allowed in this parent",
            anyhow!(
                "'{}' does not accept children of type '{}'",
                parent_descriptor.name,
                child.name
            ),
        ));
    };

    let existing = children_of_type(chain, parent_id, &child.name).len();
    if occurrence.max.is_some_and(|max| existing >= max as usize) {
        return Err(LibError::invalid_with_code(
            "child_limit_exceeded",
            "Exceeded number of elements of the same type",
            anyhow!(
                "'{}' already holds {} children of type '{}'",
                parent_descriptor.name,
                existing,
                child.name
            ),
        ));
    }

    Ok(())
}

/// Checks that removing `element` keeps its parent above the minimum
/// occurrence for the element's type.
pub fn ensure_child_removable(
    chain: &Chain,
    element: &ChainElement,
    registry: &dyn DescriptorRegistry,
) -> Result<()> {
    let Some(parent) = element.parent.and_then(|parent| chain.elements.get(&parent)) else {
        return Ok(());
    };
    let Some(parent_descriptor) = registry.descriptor(&parent.element_type) else {
        return Ok(());
    };
    let Some(occurrence) = parent_descriptor.occurrence_of(&element.element_type) else {
        return Ok(());
    };

    let remaining = children_of_type(chain, parent.id, &element.element_type)
        .len()
        .saturating_sub(1);
    if remaining < occurrence.min as usize {
        return Err(LibError::invalid_with_code(
            "last_allowed_child",
            "Cannot delete last allowed child",
            anyhow!(
                "'{}' requires at least {} children of type '{}'",
                parent_descriptor.name,
                occurrence.min,
                element.element_type
            ),
        ));
    }

    Ok(())
}

/// Checks that none of `elements` currently has a parent.
pub fn ensure_root_level(chain: &Chain, elements: &[ElementId]) -> Result<()> {
    let mut seen = HashSet::new();
    for element_id in elements {
        let element = chain.element(*element_id)?;
        if !seen.insert(*element_id) {
            return Err(LibError::invalid_with_code(
                "duplicate_element",
                "Element listed more than once",
                anyhow!("element {} listed twice", element_id),
            ));
        }
        if let Some(parent) = element.parent {
            return Err(LibError::invalid_with_code(
                "element_has_parent",
                "Only elements without a parent can be grouped",
                anyhow!("element {} is nested under {}", element_id, parent),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::test_library;
    use crate::error::ErrorKind;
    use crate::models::Dependency;

    fn insert(
        chain: &mut Chain,
        element: ChainElement,
        parent: Option<ElementId>,
    ) -> ElementId {
        let id = element.id;
        let mut element = element;
        element.parent = parent;
        chain.elements.insert(id, element);
        if let Some(parent) = parent {
            if let Some(children) = chain
                .elements
                .get_mut(&parent)
                .and_then(|parent| parent.children_mut())
            {
                children.push(id);
            }
        }
        id
    }

    fn container(chain: &mut Chain, element_type: &str, parent: Option<ElementId>) -> ElementId {
        let element = ChainElement::container(ElementId::generate(), chain.id, element_type, element_type);
        insert(chain, element, parent)
    }

    fn leaf(chain: &mut Chain, element_type: &str, parent: Option<ElementId>) -> ElementId {
        let element = ChainElement::leaf(ElementId::generate(), chain.id, element_type, element_type);
        insert(chain, element, parent)
    }

    #[test]
    fn consistent_chain_has_no_violations() {
        let mut chain = Chain::new("Orders", None);
        let switch = container(&mut chain, "switch", None);
        let case = container(&mut chain, "case", Some(switch));
        let sender = leaf(&mut chain, "sender", Some(case));
        let trigger = leaf(&mut chain, "trigger", None);
        chain
            .connect(Dependency::of(trigger, switch))
            .expect("edge should connect");
        chain
            .connect(Dependency::of(trigger, sender))
            .expect("edge should connect");

        assert!(chain_invariant_violations(&chain).is_empty());
        ensure_chain_invariants(&chain).expect("chain should be consistent");
    }

    #[test]
    fn broken_parent_links_are_reported() {
        let mut chain = Chain::new("Orders", None);
        let switch = container(&mut chain, "switch", None);
        let case = container(&mut chain, "case", Some(switch));
        chain
            .elements
            .get_mut(&switch)
            .and_then(|switch| switch.children_mut())
            .expect("switch is a container")
            .clear();
        let orphan = leaf(&mut chain, "sender", None);
        let ghost = ElementId::generate();
        chain.elements.get_mut(&orphan).expect("orphan exists").parent = Some(ghost);

        let violations = chain_invariant_violations(&chain);
        assert!(violations.contains(&ChainInvariantViolation::ChildNotListed {
            element_id: case,
            parent_id: switch,
        }));
        assert!(violations.contains(&ChainInvariantViolation::UnknownParent {
            element_id: orphan,
            parent_id: ghost,
        }));
    }

    #[test]
    fn stale_adjacency_is_reported() {
        let mut chain = Chain::new("Orders", None);
        let a = leaf(&mut chain, "sender", None);
        let b = leaf(&mut chain, "sender", None);
        let dependency = Dependency::of(a, b);
        let dependency_id = dependency.id;
        chain.connect(dependency).expect("edge should connect");
        chain.dependencies.clear();

        let err = ensure_chain_invariants(&chain).expect_err("stale adjacency should fail");
        assert_eq!(err.code, "chain_adjacency_mismatch");
        assert!(
            chain_invariant_violations(&chain).contains(
                &ChainInvariantViolation::AdjacencyMismatch {
                    element_id: a,
                    dependency_id,
                }
            )
        );
    }

    #[test]
    fn parent_cycle_is_reported() {
        let mut chain = Chain::new("Orders", None);
        let outer = container(&mut chain, "container", None);
        let inner = container(&mut chain, "container", Some(outer));
        chain.elements.get_mut(&outer).expect("outer exists").parent = Some(inner);
        chain
            .elements
            .get_mut(&inner)
            .and_then(|inner| inner.children_mut())
            .expect("inner is a container")
            .push(outer);

        assert!(
            chain_invariant_violations(&chain)
                .iter()
                .any(|violation| matches!(violation, ChainInvariantViolation::ParentCycle { .. }))
        );
    }

    #[test]
    fn insertable_checks_parent_kind_type_and_limit() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let switch = container(&mut chain, "switch", None);
        let sender = leaf(&mut chain, "sender", None);
        let generic = container(&mut chain, "container", None);

        let sender_descriptor = library.get("sender").expect("sender exists");
        let err = ensure_child_insertable(&chain, sender, sender_descriptor, &library)
            .expect_err("leaf parent should fail");
        assert_eq!(err.code, "parent_not_container");

        let err = ensure_child_insertable(&chain, switch, sender_descriptor, &library)
            .expect_err("switch should reject sender");
        assert_eq!(err.code, "parent_type_mismatch");

        let default_descriptor = library.get("default").expect("default exists");
        ensure_child_insertable(&chain, switch, default_descriptor, &library)
            .expect("first default is allowed");
        container(&mut chain, "default", Some(switch));
        let err = ensure_child_insertable(&chain, switch, default_descriptor, &library)
            .expect_err("second default should fail");
        assert_eq!(err.code, "child_limit_exceeded");

        let trigger_descriptor = library.get("trigger").expect("trigger exists");
        let err = ensure_child_insertable(&chain, generic, trigger_descriptor, &library)
            .expect_err("trigger has no input");
        assert_eq!(err.code, "child_input_disabled");
        ensure_child_insertable(&chain, generic, sender_descriptor, &library)
            .expect("generic container accepts input-enabled children");

        let err = ensure_child_insertable(&chain, ElementId::generate(), sender_descriptor, &library)
            .expect_err("missing parent should fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn removable_respects_minimum_occurrence() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let switch = container(&mut chain, "switch", None);
        let first = container(&mut chain, "case", Some(switch));
        let default = container(&mut chain, "default", Some(switch));

        let err = ensure_child_removable(&chain, &chain.elements[&first], &library)
            .expect_err("single case is required");
        assert_eq!(err.code, "last_allowed_child");
        assert!(ensure_child_removable(&chain, &chain.elements[&default], &library).is_err());

        container(&mut chain, "case", Some(switch));
        ensure_child_removable(&chain, &chain.elements[&first], &library)
            .expect("one case remains");
    }

    #[test]
    fn root_level_rejects_nested_elements() {
        let mut chain = Chain::new("Orders", None);
        let group = container(&mut chain, "container", None);
        let nested = leaf(&mut chain, "sender", Some(group));
        let free = leaf(&mut chain, "sender", None);

        ensure_root_level(&chain, &[free, group]).expect("root elements are fine");
        let err = ensure_root_level(&chain, &[free, nested]).expect_err("nested should fail");
        assert_eq!(err.code, "element_has_parent");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
