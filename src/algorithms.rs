use std::collections::HashSet;

use crate::models::{Chain, DependencyId, ElementId};

/// Returns `root` followed by every element nested under it, in pre-order.
/// Unknown ids are skipped.
pub fn collect_descendants(chain: &Chain, root: ElementId) -> Vec<ElementId> {
    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(element_id) = stack.pop() {
        if !seen.insert(element_id) {
            continue;
        }
        let Some(element) = chain.elements.get(&element_id) else {
            continue;
        };
        ordered.push(element_id);
        // Reverse so the first child is visited first.
        for child in element.children().iter().rev() {
            stack.push(*child);
        }
    }

    ordered
}

/// Ancestors of `element_id`, nearest parent first.
pub fn ancestors(chain: &Chain, element_id: ElementId) -> Vec<ElementId> {
    let mut ancestors = Vec::new();
    let mut seen = HashSet::from([element_id]);
    let mut current = chain
        .elements
        .get(&element_id)
        .and_then(|element| element.parent);

    while let Some(parent_id) = current {
        if !seen.insert(parent_id) {
            break;
        }
        ancestors.push(parent_id);
        current = chain
            .elements
            .get(&parent_id)
            .and_then(|element| element.parent);
    }

    ancestors
}

pub fn is_self_or_descendant(chain: &Chain, ancestor: ElementId, candidate: ElementId) -> bool {
    candidate == ancestor || ancestors(chain, candidate).contains(&ancestor)
}

/// Dependencies with at least one endpoint in `elements`, in arena order.
pub fn incident_dependencies(chain: &Chain, elements: &HashSet<ElementId>) -> Vec<DependencyId> {
    chain
        .dependencies
        .values()
        .filter(|dependency| {
            elements.contains(&dependency.element_from) || elements.contains(&dependency.element_to)
        })
        .map(|dependency| dependency.id)
        .collect()
}

/// Children of `parent_id` with the given type, in child-list order.
pub fn children_of_type(chain: &Chain, parent_id: ElementId, element_type: &str) -> Vec<ElementId> {
    let Some(parent) = chain.elements.get(&parent_id) else {
        return Vec::new();
    };
    parent
        .children()
        .iter()
        .filter(|child| {
            chain
                .elements
                .get(child)
                .is_some_and(|element| element.element_type == element_type)
        })
        .copied()
        .collect()
}

/// Priority for a newly added ordered child: 0 when no same-type sibling
/// carries one, otherwise one past the current maximum.
pub fn next_priority(
    chain: &Chain,
    parent_id: ElementId,
    element_type: &str,
    priority_property: &str,
) -> i64 {
    children_of_type(chain, parent_id, element_type)
        .iter()
        .filter_map(|child| chain.elements.get(child))
        .filter_map(|element| element.priority(priority_property))
        .max()
        .map_or(0, |max| max + 1)
}

/// Pre-order walk over an arbitrary hierarchy, returning `root` and
/// everything below it. Used for folder trees loaded into memory.
pub fn walk_hierarchy<T, F>(root: T, mut children_of: F) -> Vec<T>
where
    T: Copy + Eq + std::hash::Hash,
    F: FnMut(T) -> Vec<T>,
{
    let mut ordered = Vec::new();
    let mut seen = HashSet::new();
    let mut stack = vec![root];

    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        ordered.push(node);
        let mut children = children_of(node);
        children.reverse();
        stack.extend(children);
    }

    ordered
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::models::{ChainElement, Dependency};

    fn container(chain: &mut Chain, element_type: &str, parent: Option<ElementId>) -> ElementId {
        let id = ElementId::generate();
        let mut element = ChainElement::container(id, chain.id, element_type, element_type);
        element.parent = parent;
        attach(chain, element, parent)
    }

    fn leaf(chain: &mut Chain, element_type: &str, parent: Option<ElementId>) -> ElementId {
        let id = ElementId::generate();
        let mut element = ChainElement::leaf(id, chain.id, element_type, element_type);
        element.parent = parent;
        attach(chain, element, parent)
    }

    fn attach(chain: &mut Chain, element: ChainElement, parent: Option<ElementId>) -> ElementId {
        let id = element.id;
        chain.elements.insert(id, element);
        if let Some(parent) = parent {
            chain
                .elements
                .get_mut(&parent)
                .and_then(|parent| parent.children_mut())
                .expect("parent should be a container")
                .push(id);
        }
        id
    }

    #[test]
    fn descendants_are_pre_order() {
        let mut chain = Chain::new("Routing", None);
        let switch = container(&mut chain, "switch", None);
        let case_a = container(&mut chain, "case", Some(switch));
        let sender = leaf(&mut chain, "sender", Some(case_a));
        let default = container(&mut chain, "default", Some(switch));

        assert_eq!(
            collect_descendants(&chain, switch),
            vec![switch, case_a, sender, default]
        );
        assert_eq!(collect_descendants(&chain, sender), vec![sender]);
        assert!(collect_descendants(&chain, ElementId::generate()).is_empty());
    }

    #[test]
    fn ancestors_walk_to_root() {
        let mut chain = Chain::new("Routing", None);
        let switch = container(&mut chain, "switch", None);
        let case_a = container(&mut chain, "case", Some(switch));
        let sender = leaf(&mut chain, "sender", Some(case_a));

        assert_eq!(ancestors(&chain, sender), vec![case_a, switch]);
        assert!(is_self_or_descendant(&chain, switch, sender));
        assert!(is_self_or_descendant(&chain, sender, sender));
        assert!(!is_self_or_descendant(&chain, sender, switch));
    }

    #[test]
    fn incident_dependencies_cover_both_directions() {
        let mut chain = Chain::new("Routing", None);
        let a = leaf(&mut chain, "script", None);
        let b = leaf(&mut chain, "script", None);
        let c = leaf(&mut chain, "script", None);
        let ab = Dependency::of(a, b);
        let bc = Dependency::of(b, c);
        let (ab_id, bc_id) = (ab.id, bc.id);
        chain.connect(ab).expect("edge should connect");
        chain.connect(bc).expect("edge should connect");

        let mut incident = incident_dependencies(&chain, &HashSet::from([b]));
        incident.sort();
        let mut expected = vec![ab_id, bc_id];
        expected.sort();
        assert_eq!(incident, expected);
        assert_eq!(incident_dependencies(&chain, &HashSet::from([a])), vec![ab_id]);
    }

    #[test]
    fn next_priority_follows_existing_maximum() {
        let mut chain = Chain::new("Routing", None);
        let switch = container(&mut chain, "switch", None);
        assert_eq!(next_priority(&chain, switch, "case", "priority"), 0);

        let first = container(&mut chain, "case", Some(switch));
        let second = container(&mut chain, "case", Some(switch));
        chain
            .elements
            .get_mut(&first)
            .expect("case exists")
            .set_property("priority", json!(0));
        chain
            .elements
            .get_mut(&second)
            .expect("case exists")
            .set_property("priority", json!("4"));
        container(&mut chain, "default", Some(switch));

        assert_eq!(next_priority(&chain, switch, "case", "priority"), 5);
        assert_eq!(children_of_type(&chain, switch, "case"), vec![first, second]);
    }

    #[test]
    fn hierarchy_walk_is_pre_order_and_visits_each_node_once() {
        let tree: HashMap<u8, Vec<u8>> = HashMap::from([
            (1, vec![2, 3]),
            (2, vec![4]),
            (3, vec![4, 5]),
            (4, vec![]),
            (5, vec![]),
        ]);
        let visited = walk_hierarchy(1u8, |node| tree.get(&node).cloned().unwrap_or_default());
        assert_eq!(visited, vec![1, 2, 4, 3, 5]);
    }
}
