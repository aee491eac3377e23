use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::json;
use tracing::debug;

use crate::descriptor::DescriptorRegistry;
use crate::error::Result;
use crate::labels::{ChainLabel, Label};
use crate::models::{
    Chain, ChainElement, ChainId, Dependency, DependencyId, ElementId, FolderId, now,
};

/// `base (n)`, the name tried for the n-th copy when `base` is taken.
pub fn numbered_name(base: &str, copy_number: u32) -> String {
    format!("{} ({})", base, copy_number)
}

/// Builds a detached copy of `source` named `name` inside `target_folder`.
///
/// The copy has new chain, element and dependency ids, carries no runtime
/// state (snapshots, deployments, override pairing) and keeps only the
/// user-managed labels.
pub fn copy_chain(
    source: &Chain,
    registry: &dyn DescriptorRegistry,
    name: String,
    target_folder: Option<FolderId>,
) -> Result<Chain> {
    let timestamp = now();
    let mut copy = Chain {
        id: fresh_chain_id(source.id),
        name,
        description: source.description.clone(),
        parent_folder: target_folder,
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
    };

    let mut seen_labels = HashSet::new();
    for label in source.labels.iter().filter(|label| !label.is_technical()) {
        if seen_labels.insert(label.name()) {
            copy.labels.push(ChainLabel::new(label.name(), copy.id));
        }
    }

    let id_map = remap_ids(source);
    for original in source.elements.values() {
        let Some(copy_id) = id_map.get(&original.id).copied() else {
            continue;
        };
        let element = copy_element(original, copy_id, &id_map, copy.id, registry);
        copy.elements.insert(copy_id, element);
    }
    copy_dependencies(source, &id_map, &mut copy)?;

    debug!(
        source_chain = %source.id,
        copy_chain = %copy.id,
        elements = copy.elements.len(),
        dependencies = copy.dependencies.len(),
        "copied chain"
    );
    Ok(copy)
}

fn fresh_chain_id(source: ChainId) -> ChainId {
    loop {
        let candidate = ChainId::generate();
        if candidate != source {
            return candidate;
        }
    }
}

fn remap_ids(source: &Chain) -> HashMap<ElementId, ElementId> {
    let mut id_map = HashMap::with_capacity(source.elements.len());
    let mut taken: HashSet<ElementId> = source.elements.keys().copied().collect();
    for original_id in source.elements.keys() {
        let copy_id = loop {
            let candidate = ElementId::generate();
            if taken.insert(candidate) {
                break candidate;
            }
        };
        id_map.insert(*original_id, copy_id);
    }
    id_map
}

fn copy_element(
    original: &ChainElement,
    copy_id: ElementId,
    id_map: &HashMap<ElementId, ElementId>,
    chain_id: ChainId,
    registry: &dyn DescriptorRegistry,
) -> ChainElement {
    let mut element = original.clone();
    element.id = copy_id;
    element.chain_id = chain_id;
    element.parent = original.parent.and_then(|parent| id_map.get(&parent).copied());
    if let Some(children) = element.children_mut() {
        *children = original
            .children()
            .iter()
            .filter_map(|child| id_map.get(child).copied())
            .collect();
    }
    element.input_dependencies.clear();
    element.output_dependencies.clear();

    if let Some(descriptor) = registry.descriptor(&original.element_type) {
        for property in descriptor
            .properties
            .iter()
            .filter(|property| property.reset_value_on_copy)
        {
            match &property.default_value {
                Some(default_value) => element.set_property(&property.name, default_value.clone()),
                None => {
                    element.properties.remove(&property.name);
                }
            }
        }
        if let Some(property) = &descriptor.self_reference_property {
            element.set_property(property, json!(element.id.to_string()));
        }
    }

    // Untouched originals get fresh equal timestamps from the store.
    if original.created_when == original.modified_when {
        element.created_when = None;
        element.modified_when = None;
    } else {
        element.modified_when = Some(now());
    }

    element
}

/// Rebuilds edges through `id_map`. An edge is copied when its far endpoint
/// has no other edge in that direction in `source`: for an input edge
/// `X -> E` the only output of `X` is this edge, for an output edge `E -> Y`
/// the only input of `Y` is this edge. A directed pair is copied once.
fn copy_dependencies(
    source: &Chain,
    id_map: &HashMap<ElementId, ElementId>,
    copy: &mut Chain,
) -> Result<()> {
    let mut pairs: HashSet<(ElementId, ElementId)> = HashSet::new();

    for original in source.elements.values() {
        for dependency_id in original
            .input_dependencies
            .iter()
            .chain(&original.output_dependencies)
        {
            let Some(dependency) = source.dependencies.get(dependency_id) else {
                continue;
            };
            let far_side_is_sole = if dependency.element_to == original.id {
                source
                    .elements
                    .get(&dependency.element_from)
                    .is_some_and(|far| only_edge(&far.output_dependencies, dependency.id))
            } else {
                source
                    .elements
                    .get(&dependency.element_to)
                    .is_some_and(|far| only_edge(&far.input_dependencies, dependency.id))
            };
            if !far_side_is_sole {
                continue;
            }
            let (Some(from), Some(to)) = (
                id_map.get(&dependency.element_from).copied(),
                id_map.get(&dependency.element_to).copied(),
            ) else {
                continue;
            };
            if pairs.insert((from, to)) {
                copy.connect(Dependency::of(from, to))?;
            }
        }
    }

    Ok(())
}

fn only_edge(edges: &[DependencyId], dependency_id: DependencyId) -> bool {
    edges.iter().all(|edge| *edge == dependency_id)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::descriptor::test_library;
    use crate::elements::create_element;
    use crate::invariants::ensure_chain_invariants;
    use crate::labels::OVERRIDES_LABEL_NAME;

    fn add(chain: &mut Chain, element_type: &str, parent: Option<ElementId>) -> ElementId {
        create_element(chain, &test_library(), element_type, parent)
            .expect("element should be created")
            .created_elements[0]
            .id
    }

    fn copy_of(chain: &Chain) -> Chain {
        copy_chain(chain, &test_library(), chain.name.clone(), chain.parent_folder)
            .expect("chain should copy")
    }

    fn find_by_name<'a>(chain: &'a Chain, name: &str) -> &'a ChainElement {
        chain
            .elements
            .values()
            .find(|element| element.name == name)
            .expect("element should be present")
    }

    #[test]
    fn numbered_name_appends_copy_number() {
        assert_eq!(numbered_name("Foo", 1), "Foo (1)");
        assert_eq!(numbered_name("Foo (1)", 2), "Foo (1) (2)");
    }

    #[test]
    fn copy_regenerates_ids_and_remaps_structure() {
        let mut chain = Chain::new("Orders", None);
        let switch = add(&mut chain, "switch", None);
        let case = chain.elements[&switch].children()[0];
        add(&mut chain, "sender", Some(case));

        let copy = copy_of(&chain);

        assert_ne!(copy.id, chain.id);
        assert_eq!(copy.elements.len(), chain.elements.len());
        for element in copy.elements.values() {
            assert!(!chain.elements.contains_key(&element.id));
            assert_eq!(element.chain_id, copy.id);
        }
        let copied_switch = copy
            .elements
            .values()
            .find(|element| element.element_type == "switch")
            .expect("switch copied");
        assert_eq!(copied_switch.children().len(), 2);
        for child in copied_switch.children() {
            assert_eq!(copy.elements[child].parent, Some(copied_switch.id));
        }
        ensure_chain_invariants(&copy).expect("copy should be consistent");
    }

    #[test]
    fn copy_clears_runtime_state_and_technical_labels() {
        let mut chain = Chain::new("Orders", None);
        chain.labels.push(ChainLabel::new("billing", chain.id));
        chain.labels.push(ChainLabel::new("billing", chain.id));
        chain
            .labels
            .push(ChainLabel::technical(OVERRIDES_LABEL_NAME, chain.id));
        chain.overrides_chain = Some(ChainId::generate());
        chain.snapshots.push(uuid::Uuid::new_v4());
        chain.current_snapshot = chain.snapshots.first().copied();
        chain.deployments.push(uuid::Uuid::new_v4());

        let copy = copy_of(&chain);

        assert_eq!(copy.labels, vec![ChainLabel::new("billing", copy.id)]);
        assert!(copy.overrides_chain.is_none());
        assert!(copy.snapshots.is_empty());
        assert!(copy.current_snapshot.is_none());
        assert!(copy.deployments.is_empty());
    }

    #[test]
    fn copy_resets_properties_and_points_trigger_at_new_id() {
        let mut chain = Chain::new("Orders", None);
        let sender = add(&mut chain, "sender", None);
        add(&mut chain, "trigger", None);
        let original = chain.elements.get_mut(&sender).expect("sender exists");
        original.set_property("url", json!("http://orders"));
        original.set_property("retryCount", json!(9));

        let copy = copy_of(&chain);

        let copied_sender = find_by_name(&copy, "Sender");
        assert_eq!(copied_sender.property("url"), None);
        assert_eq!(copied_sender.property("retryCount"), Some(&json!(9)));
        let copied_trigger = find_by_name(&copy, "Trigger");
        assert_eq!(
            copied_trigger.property("elementId"),
            Some(&json!(copied_trigger.id.to_string()))
        );
    }

    #[test]
    fn copy_applies_timestamp_policy() {
        let mut chain = Chain::new("Orders", None);
        let pristine = add(&mut chain, "sender", None);
        let edited = add(&mut chain, "trigger", None);
        let element = chain.elements.get_mut(&edited).expect("trigger exists");
        let modified = element.modified_when.expect("modified timestamp set");
        let created = modified - Duration::seconds(30);
        element.created_when = Some(created);
        assert!(chain.elements[&pristine].created_when.is_some());

        let copy = copy_of(&chain);

        let copied_pristine = find_by_name(&copy, "Sender");
        assert_eq!(copied_pristine.created_when, None);
        assert_eq!(copied_pristine.modified_when, None);
        let copied_edited = find_by_name(&copy, "Trigger");
        assert_eq!(copied_edited.created_when, Some(created));
        assert!(copied_edited.modified_when >= Some(modified));
    }

    #[test]
    fn copy_rebuilds_linear_edges() {
        let mut chain = Chain::new("Orders", None);
        let a = add(&mut chain, "trigger", None);
        let b = add(&mut chain, "sender", None);
        let c = add(&mut chain, "sender", None);
        chain.connect(Dependency::of(a, b)).expect("edge should connect");
        chain.connect(Dependency::of(b, c)).expect("edge should connect");

        let copy = copy_of(&chain);

        assert_eq!(copy.dependencies.len(), 2);
        for dependency in copy.dependencies.values() {
            assert!(copy.elements.contains_key(&dependency.element_from));
            assert!(copy.elements.contains_key(&dependency.element_to));
        }
        ensure_chain_invariants(&copy).expect("copy should be consistent");
    }

    /// Leaves named `names`, with ids taken from `ids` in the same order,
    /// connected by `edges` given as name pairs.
    fn named_chain(names: &[&str], ids: &[u128], edges: &[(&str, &str)]) -> Chain {
        let mut chain = Chain::new("Orders", None);
        let mut by_name = HashMap::new();
        for (name, raw_id) in names.iter().zip(ids) {
            let id = ElementId(uuid::Uuid::from_u128(*raw_id));
            let element = ChainElement::leaf(id, chain.id, "sender", name);
            chain.elements.insert(id, element);
            by_name.insert(*name, id);
        }
        for (from, to) in edges {
            chain
                .connect(Dependency::of(by_name[from], by_name[to]))
                .expect("edge should connect");
        }
        chain
    }

    fn edge_names(chain: &Chain) -> Vec<(String, String)> {
        let mut edges: Vec<_> = chain
            .dependencies
            .values()
            .map(|dependency| {
                (
                    chain.elements[&dependency.element_from].name.clone(),
                    chain.elements[&dependency.element_to].name.clone(),
                )
            })
            .collect();
        edges.sort();
        edges
    }

    #[test]
    fn copy_keeps_only_edges_whose_far_side_has_no_other_edge() {
        let names = ["s1", "s2", "t1", "t2"];
        let edges = [("s1", "t1"), ("s1", "t2"), ("s2", "t2")];
        let chain = named_chain(&names, &[1, 2, 3, 4], &edges);

        let copy = copy_of(&chain);

        // s1 -> t2 is dropped: s1 has another output and t2 another input.
        assert_eq!(
            edge_names(&copy),
            vec![
                ("s1".to_string(), "t1".to_string()),
                ("s2".to_string(), "t2".to_string()),
            ]
        );
        ensure_chain_invariants(&copy).expect("copy should be consistent");
    }

    #[test]
    fn copied_edges_do_not_depend_on_element_id_order() {
        let names = ["s1", "s2", "t1", "t2"];
        let fan_in = [("s1", "t1"), ("s1", "t2"), ("s2", "t2")];
        let full = [("s1", "t1"), ("s1", "t2"), ("s2", "t1"), ("s2", "t2")];

        for edges in [&fan_in[..], &full[..]] {
            let ascending = copy_of(&named_chain(&names, &[1, 2, 3, 4], edges));
            let permuted = copy_of(&named_chain(&names, &[3, 4, 1, 2], edges));
            assert_eq!(edge_names(&ascending), edge_names(&permuted));
        }

        let full_copy = copy_of(&named_chain(&names, &[3, 4, 1, 2], &full));
        assert!(full_copy.dependencies.is_empty());
    }
}
