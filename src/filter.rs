use serde::{Deserialize, Serialize};

use crate::models::{Chain, FolderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterFeature {
    Id,
    Name,
    Description,
    Labels,
    ElementType,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCondition {
    Contains,
    DoesNotContain,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Draft,
    Deployed,
}

impl ChainStatus {
    pub fn of(chain: &Chain) -> Self {
        if chain.deployments.is_empty() {
            ChainStatus::Draft
        } else {
            ChainStatus::Deployed
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ChainStatus::Draft => "draft",
            ChainStatus::Deployed => "deployed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterRequest {
    pub feature: FilterFeature,
    pub condition: FilterCondition,
    pub value: String,
}

impl FilterRequest {
    pub fn new(feature: FilterFeature, condition: FilterCondition, value: &str) -> Self {
        Self {
            feature,
            condition,
            value: value.to_string(),
        }
    }

    pub fn matches(&self, chain: &Chain) -> bool {
        self.condition
            .holds(&feature_values(chain, self.feature), &self.value)
    }
}

impl FilterCondition {
    /// Case-insensitive test of `value` against lower-cased `values`.
    pub(crate) fn holds(self, values: &[String], value: &str) -> bool {
        let needle = value.to_lowercase();
        match self {
            FilterCondition::Contains => values.iter().any(|value| value.contains(&needle)),
            FilterCondition::DoesNotContain => !values.iter().any(|value| value.contains(&needle)),
            FilterCondition::Is => values.iter().any(|value| *value == needle),
            FilterCondition::IsNot => !values.iter().any(|value| *value == needle),
        }
    }
}

/// Lower-cased values a feature exposes for matching.
fn feature_values(chain: &Chain, feature: FilterFeature) -> Vec<String> {
    match feature {
        FilterFeature::Id => vec![chain.id.to_string()],
        FilterFeature::Name => vec![chain.name.to_lowercase()],
        FilterFeature::Description => chain
            .description
            .iter()
            .map(|description| description.to_lowercase())
            .collect(),
        FilterFeature::Labels => chain
            .labels
            .iter()
            .map(|label| label.name.to_lowercase())
            .collect(),
        FilterFeature::ElementType => chain
            .element_types()
            .into_iter()
            .map(str::to_lowercase)
            .collect(),
        FilterFeature::Status => vec![ChainStatus::of(chain).as_str().to_string()],
    }
}

/// Filter pipeline for chain listings.
///
/// `conditions` must all match. A non-empty `search` matches when any of
/// id, name, description or label names contains it. `folder_id` limits the
/// candidates to that folder's subtree and is resolved by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainFilter {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub conditions: Vec<FilterRequest>,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
}

const SEARCH_FEATURES: [FilterFeature; 4] = [
    FilterFeature::Id,
    FilterFeature::Name,
    FilterFeature::Description,
    FilterFeature::Labels,
];

impl ChainFilter {
    pub fn search(term: &str) -> Self {
        Self {
            search: Some(term.to_string()),
            ..Self::default()
        }
    }

    pub fn with(mut self, condition: FilterRequest) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn in_folder(mut self, folder_id: FolderId) -> Self {
        self.folder_id = Some(folder_id);
        self
    }

    pub fn matches(&self, chain: &Chain) -> bool {
        let search_matches = match self.search.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(term) => SEARCH_FEATURES.iter().any(|feature| {
                FilterRequest::new(*feature, FilterCondition::Contains, term).matches(chain)
            }),
        };
        search_matches
            && self
                .conditions
                .iter()
                .all(|condition| condition.matches(chain))
    }

    pub fn apply(&self, chains: Vec<Chain>) -> Vec<Chain> {
        chains
            .into_iter()
            .filter(|chain| self.matches(chain))
            .collect()
    }
}
