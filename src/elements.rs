//! Every operation validates before it touches the arena, so a failed call
//! leaves the chain unchanged.

use std::collections::HashSet;

use anyhow::anyhow;
use serde_json::json;
use tracing::debug;

use crate::algorithms::{
    children_of_type, collect_descendants, incident_dependencies, is_self_or_descendant,
    next_priority,
};
use crate::descriptor::{
    CONTAINER_DEFAULT_NAME, CONTAINER_TYPE_NAME, DescriptorRegistry, ElementDescriptor,
};
use crate::error::{LibError, Result};
use crate::invariants::{ensure_child_insertable, ensure_child_removable, ensure_root_level};
use crate::models::{Chain, ChainDiff, ChainDiffBuilder, ChainElement, ElementId, now};

/// Guards against descriptor libraries whose mandatory children require
/// each other.
const MAX_DEFAULT_CHILD_DEPTH: usize = 32;

/// Creates an element of `element_type`, optionally under `parent_id`.
///
/// The requested element is always the first entry of `created_elements`,
/// followed by any default children the descriptor mandates.
pub fn create_element(
    chain: &mut Chain,
    registry: &dyn DescriptorRegistry,
    element_type: &str,
    parent_id: Option<ElementId>,
) -> Result<ChainDiff> {
    let descriptor = registry.get(element_type)?;
    if let Some(parent_id) = parent_id {
        ensure_child_insertable(chain, parent_id, descriptor, registry)?;
    }

    let priority = match (parent_id, descriptor.priority_key()) {
        (Some(parent_id), Some(key)) => Some(next_priority(chain, parent_id, element_type, key)),
        _ => None,
    };

    let mut staged = Vec::new();
    let element_id = instantiate(
        chain,
        registry,
        descriptor,
        parent_id,
        priority,
        &mut staged,
        0,
    )?;

    let mut builder = ChainDiffBuilder::default();
    for element in staged {
        builder.created(element.id);
        chain.elements.insert(element.id, element);
    }
    if let Some(parent_id) = parent_id {
        attach_child(chain, parent_id, element_id)?;
        builder.updated(parent_id);
    }

    debug!(
        chain_id = %chain.id,
        element_id = %element_id,
        element_type,
        "created element"
    );
    Ok(builder.finish(chain))
}

/// Removes an element with every nested descendant and incident dependency.
pub fn delete_element(
    chain: &mut Chain,
    registry: &dyn DescriptorRegistry,
    element_id: ElementId,
) -> Result<ChainDiff> {
    let element = chain.element(element_id)?.clone();
    ensure_child_removable(chain, &element, registry)?;

    let mut builder = ChainDiffBuilder::default();
    let removal = collect_descendants(chain, element_id);
    let removal_set: HashSet<ElementId> = removal.iter().copied().collect();

    for dependency_id in incident_dependencies(chain, &removal_set) {
        let Some(dependency) = chain.dependencies.remove(&dependency_id) else {
            continue;
        };
        for endpoint in [dependency.element_from, dependency.element_to] {
            if removal_set.contains(&endpoint) {
                continue;
            }
            if let Some(neighbor) = chain.elements.get_mut(&endpoint) {
                neighbor.input_dependencies.retain(|id| *id != dependency_id);
                neighbor.output_dependencies.retain(|id| *id != dependency_id);
            }
        }
        builder.removed_dependency(dependency);
    }

    if let Some(parent_id) = element.parent {
        if let Some(key) = priority_key_of(registry, &element.element_type) {
            if let Some(removed_priority) = element.priority(&key) {
                shift_priorities_down(
                    chain,
                    parent_id,
                    &element,
                    &key,
                    removed_priority,
                    &mut builder,
                );
            }
        }
        detach_child(chain, parent_id, element_id);
        builder.updated(parent_id);
    }

    for removed_id in removal {
        if let Some(removed) = chain.elements.remove(&removed_id) {
            builder.removed(removed);
        }
    }

    let diff = builder.finish(chain);
    debug!(
        chain_id = %chain.id,
        element_id = %element_id,
        removed_elements = diff.removed_elements.len(),
        removed_dependencies = diff.removed_dependencies.len(),
        "deleted element"
    );
    Ok(diff)
}

/// Moves an element under `new_parent_id`, or to the chain root when `None`.
pub fn change_parent(
    chain: &mut Chain,
    registry: &dyn DescriptorRegistry,
    element_id: ElementId,
    new_parent_id: Option<ElementId>,
) -> Result<ChainDiff> {
    let element = chain.element(element_id)?.clone();
    let old_parent_id = element.parent;

    if let Some(new_parent_id) = new_parent_id {
        let new_parent = chain.element(new_parent_id)?;
        if is_self_or_descendant(chain, element_id, new_parent_id) {
            return Err(LibError::invalid_with_code(
                "element_parent_cycle",
                "Element cannot be moved into itself or its own descendant",
                anyhow!("element {} is an ancestor of {}", element_id, new_parent_id),
            ));
        }
        if old_parent_id == Some(new_parent_id) {
            if !new_parent.is_container() {
                return Err(LibError::invalid_with_code(
                    "parent_not_container",
                    "Parent element is not a container",
                    anyhow!("element {} cannot hold children", new_parent_id),
                ));
            }
        } else {
            let descriptor = registry.get(&element.element_type)?;
            ensure_child_insertable(chain, new_parent_id, descriptor, registry)?;
        }
    }
    if old_parent_id != new_parent_id {
        ensure_child_removable(chain, &element, registry)?;
    }

    let mut builder = ChainDiffBuilder::default();
    if old_parent_id == new_parent_id {
        if let Some(parent_id) = old_parent_id {
            touch(chain, parent_id);
            builder.updated(parent_id);
        }
        touch(chain, element_id);
        builder.updated(element_id);
        return Ok(builder.finish(chain));
    }

    let priority_key = priority_key_of(registry, &element.element_type);
    if let Some(parent_id) = old_parent_id {
        if let Some(key) = priority_key.as_deref() {
            if let Some(removed_priority) = element.priority(key) {
                shift_priorities_down(
                    chain,
                    parent_id,
                    &element,
                    key,
                    removed_priority,
                    &mut builder,
                );
            }
        }
        detach_child(chain, parent_id, element_id);
        builder.updated(parent_id);
    }

    if let Some(parent_id) = new_parent_id {
        if let Some(key) = priority_key.as_deref() {
            let priority = next_priority(chain, parent_id, &element.element_type, key);
            chain.element_mut(element_id)?.set_property(key, json!(priority));
        }
        attach_child(chain, parent_id, element_id)?;
        builder.updated(parent_id);
    }

    let moved = chain.element_mut(element_id)?;
    moved.parent = new_parent_id;
    moved.touch();
    builder.updated(element_id);

    debug!(
        chain_id = %chain.id,
        element_id = %element_id,
        old_parent = ?old_parent_id,
        new_parent = ?new_parent_id,
        "changed element parent"
    );
    Ok(builder.finish(chain))
}

/// Wraps root-level elements into a new grouping container, reported as the
/// first created element.
pub fn group_elements(
    chain: &mut Chain,
    registry: &dyn DescriptorRegistry,
    element_ids: &[ElementId],
) -> Result<ChainDiff> {
    if element_ids.is_empty() {
        return Err(LibError::invalid_with_code(
            "group_empty",
            "At least one element is required to create a group",
            anyhow!("group requested without elements in chain {}", chain.id),
        ));
    }
    ensure_root_level(chain, element_ids)?;

    let group_id = fresh_element_id(chain, &[]);
    let mut group =
        ChainElement::container(group_id, chain.id, CONTAINER_TYPE_NAME, CONTAINER_DEFAULT_NAME);
    if let Some(descriptor) = registry.descriptor(CONTAINER_TYPE_NAME) {
        group.properties = descriptor.default_properties();
    }
    stamp(&mut group);
    if let Some(children) = group.children_mut() {
        children.extend_from_slice(element_ids);
    }
    chain.elements.insert(group_id, group);

    let mut builder = ChainDiffBuilder::default();
    builder.created(group_id);
    for element_id in element_ids {
        let element = chain.element_mut(*element_id)?;
        element.parent = Some(group_id);
        element.touch();
        builder.updated(*element_id);
    }

    debug!(
        chain_id = %chain.id,
        group_id = %group_id,
        grouped = element_ids.len(),
        "grouped elements"
    );
    Ok(builder.finish(chain))
}

/// Dissolves a grouping container: its children become root elements and
/// the group with its own dependencies is removed.
pub fn ungroup_elements(chain: &mut Chain, group_id: ElementId) -> Result<ChainDiff> {
    let group = chain.element(group_id)?.clone();
    if !group.is_container() || group.element_type != CONTAINER_TYPE_NAME {
        return Err(LibError::invalid_with_code(
            "not_a_group",
            "Only grouping containers can be ungrouped",
            anyhow!(
                "element {} has type '{}', expected '{}'",
                group_id,
                group.element_type,
                CONTAINER_TYPE_NAME
            ),
        ));
    }

    let mut builder = ChainDiffBuilder::default();
    for child_id in group.children() {
        if let Some(child) = chain.elements.get_mut(child_id) {
            child.parent = None;
            child.touch();
            builder.updated(*child_id);
        }
    }

    if let Some(parent_id) = group.parent {
        detach_child(chain, parent_id, group_id);
        builder.updated(parent_id);
    }

    for dependency_id in incident_dependencies(chain, &HashSet::from([group_id])) {
        let Some(dependency) = chain.dependencies.remove(&dependency_id) else {
            continue;
        };
        for endpoint in [dependency.element_from, dependency.element_to] {
            if let Some(neighbor) = chain.elements.get_mut(&endpoint) {
                neighbor.input_dependencies.retain(|id| *id != dependency_id);
                neighbor.output_dependencies.retain(|id| *id != dependency_id);
            }
        }
        builder.removed_dependency(dependency);
    }

    if let Some(removed) = chain.elements.remove(&group_id) {
        builder.removed(removed);
    }

    debug!(chain_id = %chain.id, group_id = %group_id, "ungrouped elements");
    Ok(builder.finish(chain))
}

fn instantiate(
    chain: &Chain,
    registry: &dyn DescriptorRegistry,
    descriptor: &ElementDescriptor,
    parent_id: Option<ElementId>,
    priority: Option<i64>,
    staged: &mut Vec<ChainElement>,
    depth: usize,
) -> Result<ElementId> {
    if depth > MAX_DEFAULT_CHILD_DEPTH {
        return Err(LibError::invalid_with_code(
            "descriptor_default_children_cycle",
            "Element library defines endlessly nested default children",
            anyhow!(
                "default children of '{}' exceed depth {}",
                descriptor.name,
                MAX_DEFAULT_CHILD_DEPTH
            ),
        ));
    }

    let element_id = fresh_element_id(chain, staged);
    let mut element = if descriptor.container {
        ChainElement::container(element_id, chain.id, &descriptor.name, &descriptor.title)
    } else {
        ChainElement::leaf(element_id, chain.id, &descriptor.name, &descriptor.title)
    };
    element.parent = parent_id;
    element.properties = descriptor.default_properties();
    if let Some(property) = &descriptor.self_reference_property {
        element.set_property(property, json!(element_id.to_string()));
    }
    if let (Some(key), Some(priority)) = (descriptor.priority_key(), priority) {
        element.set_property(key, json!(priority));
    }
    stamp(&mut element);

    let index = staged.len();
    staged.push(element);

    if descriptor.container {
        for (child_type, occurrence) in &descriptor.allowed_children {
            if occurrence.min == 0 {
                continue;
            }
            let child_descriptor = registry.get(child_type)?;
            for position in 0..occurrence.min {
                let child_priority = child_descriptor
                    .priority_key()
                    .map(|_| i64::from(position));
                let child_id = instantiate(
                    chain,
                    registry,
                    child_descriptor,
                    Some(element_id),
                    child_priority,
                    staged,
                    depth + 1,
                )?;
                if let Some(children) = staged[index].children_mut() {
                    children.push(child_id);
                }
            }
        }
    }

    Ok(element_id)
}

fn fresh_element_id(chain: &Chain, staged: &[ChainElement]) -> ElementId {
    loop {
        let candidate = ElementId::generate();
        let taken = chain.elements.contains_key(&candidate)
            || staged.iter().any(|element| element.id == candidate);
        if !taken {
            return candidate;
        }
    }
}

fn stamp(element: &mut ChainElement) {
    let timestamp = now();
    element.created_when = Some(timestamp);
    element.modified_when = Some(timestamp);
}

fn touch(chain: &mut Chain, element_id: ElementId) {
    if let Some(element) = chain.elements.get_mut(&element_id) {
        element.touch();
    }
}

fn priority_key_of(registry: &dyn DescriptorRegistry, element_type: &str) -> Option<String> {
    registry
        .descriptor(element_type)
        .and_then(|descriptor| descriptor.priority_key())
        .map(str::to_string)
}

fn attach_child(chain: &mut Chain, parent_id: ElementId, child_id: ElementId) -> Result<()> {
    let parent = chain.element_mut(parent_id)?;
    let Some(children) = parent.children_mut() else {
        return Err(LibError::invalid_with_code(
            "parent_not_container",
            "Parent element is not a container",
            anyhow!("element {} cannot hold children", parent_id),
        ));
    };
    children.push(child_id);
    parent.touch();
    Ok(())
}

fn detach_child(chain: &mut Chain, parent_id: ElementId, child_id: ElementId) {
    if let Some(parent) = chain.elements.get_mut(&parent_id) {
        if let Some(children) = parent.children_mut() {
            children.retain(|id| *id != child_id);
        }
        parent.touch();
    }
}

/// Closes the priority gap left by `removed` among its same-type siblings.
fn shift_priorities_down(
    chain: &mut Chain,
    parent_id: ElementId,
    removed: &ChainElement,
    key: &str,
    removed_priority: i64,
    builder: &mut ChainDiffBuilder,
) {
    for sibling_id in children_of_type(chain, parent_id, &removed.element_type) {
        if sibling_id == removed.id {
            continue;
        }
        let Some(sibling) = chain.elements.get_mut(&sibling_id) else {
            continue;
        };
        let Some(priority) = sibling.priority(key) else {
            continue;
        };
        if priority > removed_priority {
            sibling.set_property(key, json!(priority - 1));
            sibling.touch();
            builder.updated(sibling_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::descriptor::{ElementLibrary, test_library};
    use crate::error::ErrorKind;
    use crate::invariants::ensure_chain_invariants;
    use crate::models::Dependency;

    fn create(chain: &mut Chain, library: &ElementLibrary, element_type: &str) -> ElementId {
        create_element(chain, library, element_type, None)
            .expect("element should be created")
            .created_elements[0]
            .id
    }

    fn create_in(
        chain: &mut Chain,
        library: &ElementLibrary,
        element_type: &str,
        parent: ElementId,
    ) -> ElementId {
        create_element(chain, library, element_type, Some(parent))
            .expect("child should be created")
            .created_elements[0]
            .id
    }

    fn children_of(chain: &Chain, parent: ElementId, element_type: &str) -> Vec<ElementId> {
        children_of_type(chain, parent, element_type)
    }

    #[test]
    fn create_leaf_uses_descriptor_defaults() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);

        let diff = create_element(&mut chain, &library, "sender", None)
            .expect("sender should be created");

        assert_eq!(diff.created_elements.len(), 1);
        assert!(diff.updated_elements.is_empty());
        let sender = &diff.created_elements[0];
        assert_eq!(sender.element_type, "sender");
        assert_eq!(sender.name, "Sender");
        assert_eq!(sender.properties.len(), 1);
        assert_eq!(sender.properties["retryCount"], json!(3));
        assert_eq!(sender.created_when, sender.modified_when);
        assert!(chain.elements.contains_key(&sender.id));
    }

    #[test]
    fn create_trigger_points_at_itself() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let trigger = create(&mut chain, &library, "trigger");
        assert_eq!(
            chain.elements[&trigger].property("elementId"),
            Some(&json!(trigger.to_string()))
        );
    }

    #[test]
    fn create_container_instantiates_mandatory_children() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);

        let diff = create_element(&mut chain, &library, "switch", None)
            .expect("switch should be created");

        assert_eq!(diff.created_elements.len(), 3);
        let switch = &diff.created_elements[0];
        assert_eq!(switch.children().len(), 2);
        let mut types: Vec<&str> = diff.created_elements[1..]
            .iter()
            .map(|element| element.element_type.as_str())
            .collect();
        types.sort_unstable();
        assert_eq!(types, vec!["case", "default"]);
        for child in &diff.created_elements[1..] {
            assert_eq!(child.parent, Some(switch.id));
        }
        let case = chain.elements[&children_of(&chain, switch.id, "case")[0]].clone();
        assert_eq!(case.priority("priority"), Some(0));
        ensure_chain_invariants(&chain).expect("chain should stay consistent");
    }

    #[test]
    fn create_with_parent_updates_parent_once() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let group = create(&mut chain, &library, "container");

        let diff = create_element(&mut chain, &library, "sender", Some(group))
            .expect("sender should be created in group");

        assert_eq!(diff.updated_element_ids(), vec![group]);
        let sender = &diff.created_elements[0];
        assert_eq!(sender.parent, Some(group));
        assert_eq!(diff.updated_elements[0].children(), &[sender.id]);
    }

    #[test]
    fn create_ordered_child_takes_next_priority() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let switch = create(&mut chain, &library, "switch");

        let second = create_in(&mut chain, &library, "case", switch);
        let third = create_in(&mut chain, &library, "case", switch);

        assert_eq!(chain.elements[&second].priority("priority"), Some(1));
        assert_eq!(chain.elements[&third].priority("priority"), Some(2));
    }

    #[test]
    fn create_rejects_invalid_placements_without_mutation() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let sender = create(&mut chain, &library, "sender");
        let switch = create(&mut chain, &library, "switch");
        let group = create(&mut chain, &library, "container");
        let before = chain.elements.len();

        let cases = [
            ("sender", Some(sender), "parent_not_container"),
            ("unknown", None, "unknown_element_type"),
            ("sender", Some(switch), "parent_type_mismatch"),
            ("trigger", Some(group), "child_input_disabled"),
            ("default", Some(switch), "child_limit_exceeded"),
        ];
        for (element_type, parent, code) in cases {
            let err = create_element(&mut chain, &library, element_type, parent)
                .expect_err("placement should be rejected");
            assert_eq!(err.kind, ErrorKind::InvalidInput, "{element_type}");
            assert_eq!(err.code, code);
        }

        let err = create_element(&mut chain, &library, "sender", Some(ElementId::generate()))
            .expect_err("missing parent should fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(chain.elements.len(), before);
    }

    #[test]
    fn create_rejects_parent_with_unregistered_type() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let odd = ElementId::generate();
        chain
            .elements
            .insert(odd, ChainElement::container(odd, chain.id, "", "Odd"));

        let err = create_element(&mut chain, &library, "sender", Some(odd))
            .expect_err("parent without descriptor should fail");
        assert_eq!(err.code, "unknown_element_type");
    }

    #[test]
    fn delete_cascades_to_descendants_and_dependencies() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let switch = create(&mut chain, &library, "switch");
        let case = children_of(&chain, switch, "case")[0];
        let sender = create_in(&mut chain, &library, "sender", case);
        let trigger = create(&mut chain, &library, "trigger");
        let tail = create(&mut chain, &library, "sender");
        chain
            .connect(Dependency::of(trigger, switch))
            .expect("edge should connect");
        chain
            .connect(Dependency::of(sender, tail))
            .expect("edge should connect");

        let diff = delete_element(&mut chain, &library, switch).expect("switch should be deleted");

        assert_eq!(diff.removed_elements.len(), 4);
        assert_eq!(diff.removed_element_ids()[0], switch);
        assert!(diff.removed_element_ids().contains(&sender));
        assert_eq!(diff.removed_dependencies.len(), 2);
        assert!(chain.dependencies.is_empty());
        assert!(chain.elements[&trigger].output_dependencies.is_empty());
        assert!(chain.elements[&tail].input_dependencies.is_empty());
        assert!(diff.updated_elements.is_empty());
        ensure_chain_invariants(&chain).expect("chain should stay consistent");
    }

    #[test]
    fn delete_ordered_child_reindexes_siblings() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let switch = create(&mut chain, &library, "switch");
        let case0 = children_of(&chain, switch, "case")[0];
        let case1 = create_in(&mut chain, &library, "case", switch);
        let case2 = create_in(&mut chain, &library, "case", switch);
        let trigger = create(&mut chain, &library, "trigger");
        chain
            .connect(Dependency::of(trigger, case0))
            .expect("edge should connect");

        let diff = delete_element(&mut chain, &library, case0).expect("case should be deleted");

        assert_eq!(diff.removed_element_ids(), vec![case0]);
        assert_eq!(diff.removed_dependencies.len(), 1);
        let mut updated = diff.updated_element_ids();
        updated.sort();
        let mut expected = vec![case1, case2, switch];
        expected.sort();
        assert_eq!(updated, expected);
        assert_eq!(chain.elements[&case1].priority("priority"), Some(0));
        assert_eq!(chain.elements[&case2].priority("priority"), Some(1));
        assert_eq!(children_of(&chain, switch, "case"), vec![case1, case2]);
    }

    #[test]
    fn delete_last_allowed_child_is_rejected_before_mutation() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let fork = create(&mut chain, &library, "fork");
        let cases = children_of(&chain, fork, "case");
        let default = children_of(&chain, fork, "default")[0];
        let sender = children_of(&chain, fork, "sender")[0];
        assert_eq!(cases.len(), 2);
        let snapshot = chain.elements.clone();

        for element_id in [cases[0], default, sender] {
            let err = delete_element(&mut chain, &library, element_id)
                .expect_err("minimum occurrence should block delete");
            assert_eq!(err.code, "last_allowed_child");
            assert_eq!(err.kind, ErrorKind::InvalidInput);
        }
        assert_eq!(chain.elements, snapshot);

        let extra = create_in(&mut chain, &library, "case", fork);
        delete_element(&mut chain, &library, extra).expect("third case can go");
    }

    #[test]
    fn delete_unknown_element_is_not_found() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let err = delete_element(&mut chain, &library, ElementId::generate())
            .expect_err("missing element should fail");
        assert_eq!(err.code, "element_not_found");
    }

    #[test]
    fn change_parent_moves_between_containers() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let first = create(&mut chain, &library, "container");
        let second = create(&mut chain, &library, "container");
        let sender = create_in(&mut chain, &library, "sender", first);

        let diff = change_parent(&mut chain, &library, sender, Some(second))
            .expect("parent should change");

        assert!(chain.elements[&first].children().is_empty());
        assert_eq!(chain.elements[&second].children(), &[sender]);
        assert_eq!(chain.elements[&sender].parent, Some(second));
        let mut updated = diff.updated_element_ids();
        updated.sort();
        let mut expected = vec![first, second, sender];
        expected.sort();
        assert_eq!(updated, expected);

        change_parent(&mut chain, &library, sender, None).expect("move to root");
        assert_eq!(chain.elements[&sender].parent, None);
        assert!(chain.elements[&second].children().is_empty());
        ensure_chain_invariants(&chain).expect("chain should stay consistent");
    }

    #[test]
    fn change_parent_to_same_parent_keeps_position() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let group = create(&mut chain, &library, "container");
        let a = create_in(&mut chain, &library, "sender", group);
        let b = create_in(&mut chain, &library, "sender", group);

        let diff = change_parent(&mut chain, &library, a, Some(group)).expect("same parent");

        assert_eq!(chain.elements[&group].children(), &[a, b]);
        assert_eq!(diff.updated_elements.len(), 2);
    }

    #[test]
    fn change_parent_rejects_cycles_and_leaf_parents() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let outer = create(&mut chain, &library, "container");
        let inner = create_in(&mut chain, &library, "container", outer);
        let sender = create(&mut chain, &library, "sender");

        let err = change_parent(&mut chain, &library, outer, Some(inner))
            .expect_err("descendant parent should fail");
        assert_eq!(err.code, "element_parent_cycle");
        let err = change_parent(&mut chain, &library, outer, Some(outer))
            .expect_err("self parent should fail");
        assert_eq!(err.code, "element_parent_cycle");
        let err = change_parent(&mut chain, &library, inner, Some(sender))
            .expect_err("leaf parent should fail");
        assert_eq!(err.code, "parent_not_container");
        let err = change_parent(&mut chain, &library, sender, Some(ElementId::generate()))
            .expect_err("missing parent should fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn change_parent_reprioritises_ordered_elements() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let left = create(&mut chain, &library, "switch");
        let right = create(&mut chain, &library, "switch");
        let left_first = children_of(&chain, left, "case")[0];
        let left_second = create_in(&mut chain, &library, "case", left);

        change_parent(&mut chain, &library, left_first, Some(right)).expect("case should move");

        assert_eq!(chain.elements[&left_second].priority("priority"), Some(0));
        assert_eq!(chain.elements[&left_first].priority("priority"), Some(1));
    }

    #[test]
    fn group_wraps_root_elements() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let a = create(&mut chain, &library, "sender");
        let b = create(&mut chain, &library, "sender");

        let diff = group_elements(&mut chain, &library, &[a, b]).expect("group should be created");

        let group = &diff.created_elements[0];
        assert_eq!(group.element_type, CONTAINER_TYPE_NAME);
        assert_eq!(group.name, CONTAINER_DEFAULT_NAME);
        assert_eq!(group.parent, None);
        assert_eq!(group.children(), &[a, b]);
        assert_eq!(chain.elements[&a].parent, Some(group.id));
        assert_eq!(diff.updated_elements.len(), 2);
        ensure_chain_invariants(&chain).expect("chain should stay consistent");
    }

    #[test]
    fn group_rejects_nested_and_missing_elements() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let group = create(&mut chain, &library, "container");
        let nested = create_in(&mut chain, &library, "sender", group);
        let before = chain.elements.len();

        let err = group_elements(&mut chain, &library, &[nested])
            .expect_err("nested element should fail");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        let err = group_elements(&mut chain, &library, &[ElementId::generate()])
            .expect_err("missing element should fail");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(chain.elements.len(), before);
    }

    #[test]
    fn ungroup_frees_children_and_removes_group() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let a = create(&mut chain, &library, "sender");
        let b = create(&mut chain, &library, "sender");
        let trigger = create(&mut chain, &library, "trigger");
        let group = group_elements(&mut chain, &library, &[a, b])
            .expect("group should be created")
            .created_elements[0]
            .id;
        chain
            .connect(Dependency::of(trigger, group))
            .expect("edge should connect");

        let diff = ungroup_elements(&mut chain, group).expect("group should dissolve");

        assert_eq!(diff.removed_element_ids(), vec![group]);
        assert_eq!(diff.removed_dependencies.len(), 1);
        assert!(!chain.elements.contains_key(&group));
        assert_eq!(chain.elements[&a].parent, None);
        assert_eq!(chain.elements[&b].parent, None);
        assert!(chain.elements[&trigger].output_dependencies.is_empty());
        ensure_chain_invariants(&chain).expect("chain should stay consistent");
    }

    #[test]
    fn ungroup_rejects_semantic_containers() {
        let library = test_library();
        let mut chain = Chain::new("Orders", None);
        let switch = create(&mut chain, &library, "switch");

        let err = ungroup_elements(&mut chain, switch).expect_err("switch is not a group");
        assert_eq!(err.code, "not_a_group");
        assert!(chain.elements.contains_key(&switch));
    }
}
