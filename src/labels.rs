use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::models::{ChainId, SpecificationGroupId, SystemModelId};

/// Technical label a chain carries while it overrides another chain.
pub const OVERRIDES_LABEL_NAME: &str = "Overrides";
/// Technical label a chain carries while another chain overrides it.
pub const OVERRIDDEN_LABEL_NAME: &str = "Overridden";

pub trait Label {
    fn name(&self) -> &str;

    /// Technical labels are system-managed and never replaced by users.
    fn is_technical(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLabel {
    pub name: String,
    pub technical: bool,
    pub chain_id: ChainId,
}

impl ChainLabel {
    pub fn new(name: &str, chain_id: ChainId) -> Self {
        Self {
            name: name.to_string(),
            technical: false,
            chain_id,
        }
    }

    pub fn technical(name: &str, chain_id: ChainId) -> Self {
        Self {
            name: name.to_string(),
            technical: true,
            chain_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecificationGroupLabel {
    pub name: String,
    pub technical: bool,
    pub specification_group_id: SpecificationGroupId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemModelLabel {
    pub name: String,
    pub technical: bool,
    pub system_model_id: SystemModelId,
}

macro_rules! impl_label {
    ($ty:ty) => {
        impl Label for $ty {
            fn name(&self) -> &str {
                &self.name
            }

            fn is_technical(&self) -> bool {
                self.technical
            }
        }
    };
}

impl_label!(ChainLabel);
impl_label!(SpecificationGroupLabel);
impl_label!(SystemModelLabel);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelChanges<L> {
    pub removed: Vec<L>,
    pub inserted: Vec<L>,
}

impl<L> LabelChanges<L> {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.inserted.is_empty()
    }
}

/// Reconciles `current` against the `desired` labels in place.
///
/// Non-technical labels missing from `desired` are dropped, technical labels
/// are always kept, and desired labels whose name is not yet present among the
/// non-technical labels are appended. Technical entries in `desired` are
/// ignored.
pub fn reconcile_labels<L>(current: &mut Vec<L>, desired: Vec<L>) -> LabelChanges<L>
where
    L: Label + Clone,
{
    let desired_names: HashSet<String> = desired
        .iter()
        .map(|label| label.name().to_string())
        .collect();

    let mut removed = Vec::new();
    current.retain(|label| {
        let keep = label.is_technical() || desired_names.contains(label.name());
        if !keep {
            removed.push(label.clone());
        }
        keep
    });

    let mut present: HashSet<String> = current
        .iter()
        .filter(|label| !label.is_technical())
        .map(|label| label.name().to_string())
        .collect();

    let mut inserted = Vec::new();
    for label in desired {
        if label.is_technical() || !present.insert(label.name().to_string()) {
            continue;
        }
        current.push(label.clone());
        inserted.push(label);
    }

    LabelChanges { removed, inserted }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, chain_id: ChainId) -> ChainLabel {
        ChainLabel::new(name, chain_id)
    }

    fn names(labels: &[ChainLabel]) -> Vec<&str> {
        let mut names: Vec<&str> = labels.iter().map(|label| label.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    #[test]
    fn removes_absent_and_inserts_missing_user_labels() {
        let chain_id = ChainId::generate();
        let mut current = vec![user("billing", chain_id), user("legacy", chain_id)];

        let changes = reconcile_labels(
            &mut current,
            vec![user("billing", chain_id), user("orders", chain_id)],
        );

        assert_eq!(names(&current), vec!["billing", "orders"]);
        assert_eq!(changes.removed.len(), 1);
        assert_eq!(changes.removed[0].name, "legacy");
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].name, "orders");
    }

    #[test]
    fn technical_labels_survive_and_are_never_inserted() {
        let chain_id = ChainId::generate();
        let mut current = vec![
            ChainLabel::technical(OVERRIDES_LABEL_NAME, chain_id),
            user("billing", chain_id),
        ];

        let changes = reconcile_labels(
            &mut current,
            vec![ChainLabel::technical("Imported", chain_id)],
        );

        assert_eq!(names(&current), vec![OVERRIDES_LABEL_NAME]);
        assert!(changes.inserted.is_empty());
        assert_eq!(changes.removed.len(), 1);
    }

    #[test]
    fn user_label_named_like_technical_one_is_added_alongside() {
        let chain_id = ChainId::generate();
        let mut current = vec![ChainLabel::technical(OVERRIDES_LABEL_NAME, chain_id)];

        reconcile_labels(&mut current, vec![user(OVERRIDES_LABEL_NAME, chain_id)]);

        assert_eq!(current.len(), 2);
        assert_eq!(current.iter().filter(|label| label.technical).count(), 1);
    }

    #[test]
    fn applying_the_same_desired_list_twice_is_idempotent() {
        let chain_id = ChainId::generate();
        let mut current = vec![
            ChainLabel::technical(OVERRIDDEN_LABEL_NAME, chain_id),
            user("a", chain_id),
        ];
        let desired = vec![user("b", chain_id), user("b", chain_id), user("c", chain_id)];

        reconcile_labels(&mut current, desired.clone());
        let once = current.clone();
        let changes = reconcile_labels(&mut current, desired);

        assert_eq!(current, once);
        assert!(changes.is_empty());
        assert_eq!(names(&current), vec!["Overridden", "b", "c"]);
    }

    #[test]
    fn works_for_system_model_labels() {
        let model_id = SystemModelId::generate();
        let label = |name: &str, technical: bool| SystemModelLabel {
            name: name.to_string(),
            technical,
            system_model_id: model_id,
        };
        let mut current = vec![label("v1", false), label("discovered", true)];

        reconcile_labels(&mut current, vec![label("v2", false)]);

        let mut result: Vec<&str> = current.iter().map(|l| l.name.as_str()).collect();
        result.sort_unstable();
        assert_eq!(result, vec!["discovered", "v2"]);
    }
}
