use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::filter::FilterCondition;
use crate::models::now;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportEntityType {
    Chain,
    Service,
    SpecificationGroup,
    Specification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportInstructionAction {
    Ignore,
    Delete,
    Override,
}

impl ImportEntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportEntityType::Chain => "CHAIN",
            ImportEntityType::Service => "SERVICE",
            ImportEntityType::SpecificationGroup => "SPECIFICATION_GROUP",
            ImportEntityType::Specification => "SPECIFICATION",
        }
    }
}

impl ImportInstructionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportInstructionAction::Ignore => "IGNORE",
            ImportInstructionAction::Delete => "DELETE",
            ImportInstructionAction::Override => "OVERRIDE",
        }
    }
}

impl fmt::Display for ImportEntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ImportInstructionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportEntityType {
    type Err = LibError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "CHAIN" => Ok(ImportEntityType::Chain),
            "SERVICE" => Ok(ImportEntityType::Service),
            "SPECIFICATION_GROUP" => Ok(ImportEntityType::SpecificationGroup),
            "SPECIFICATION" => Ok(ImportEntityType::Specification),
            other => Err(LibError::invalid(
                "Unknown import entity type",
                anyhow!("import entity type {}", other),
            )),
        }
    }
}

impl FromStr for ImportInstructionAction {
    type Err = LibError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "IGNORE" => Ok(ImportInstructionAction::Ignore),
            "DELETE" => Ok(ImportInstructionAction::Delete),
            "OVERRIDE" => Ok(ImportInstructionAction::Override),
            other => Err(LibError::invalid(
                "Unknown import instruction action",
                anyhow!("import instruction action {}", other),
            )),
        }
    }
}

/// What an import should do with one incoming entity, keyed by that
/// entity's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportInstruction {
    pub id: String,
    pub entity_type: ImportEntityType,
    pub action: ImportInstructionAction,
    /// Chain that replaces `id` on import; only set for `OVERRIDE`.
    pub overridden_by: Option<String>,
    pub modified_when: NaiveDateTime,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportInstructionPayload {
    pub id: String,
    pub entity_type: ImportEntityType,
    pub action: ImportInstructionAction,
    #[serde(default)]
    pub overridden_by: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteInstructionsRequest {
    #[serde(default)]
    pub chains: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl DeleteInstructionsRequest {
    /// Distinct ids across both lists, in request order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.chains.iter().chain(&self.services) {
            let id = id.trim();
            if !id.is_empty() && !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }
}

impl ImportInstruction {
    pub fn from_payload(payload: ImportInstructionPayload) -> Result<Self> {
        let id = payload.id.trim().to_string();
        if id.is_empty() {
            return Err(LibError::invalid(
                "Instruction id is required",
                anyhow!("empty import instruction id"),
            ));
        }
        let overridden_by = payload
            .overridden_by
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let instruction = Self {
            id,
            entity_type: payload.entity_type,
            action: payload.action,
            overridden_by,
            modified_when: now(),
        };
        instruction.validate()?;
        Ok(instruction)
    }

    /// Action and override target are the mutable part of an instruction.
    pub fn patch(&mut self, update: &ImportInstruction) {
        self.action = update.action;
        self.overridden_by = update.overridden_by.clone();
        self.modified_when = now();
    }

    pub fn validate(&self) -> Result<()> {
        let unsupported = match self.entity_type {
            ImportEntityType::Chain => false,
            ImportEntityType::Service => self.action == ImportInstructionAction::Override,
            ImportEntityType::SpecificationGroup | ImportEntityType::Specification => matches!(
                self.action,
                ImportInstructionAction::Ignore | ImportInstructionAction::Override
            ),
        };
        if unsupported {
            return Err(LibError::invalid_with_code(
                "instruction_action_unsupported",
                "Instruction action is not supported for this entity type",
                anyhow!(
                    "{} instruction {} does not support {}",
                    self.entity_type,
                    self.id,
                    self.action
                ),
            ));
        }

        match (self.action, self.overridden_by.as_deref()) {
            (ImportInstructionAction::Override, None) => Err(LibError::invalid_with_code(
                "override_target_required",
                "Overridden By must be set for an OVERRIDE instruction",
                anyhow!("instruction {} has no override target", self.id),
            )),
            (ImportInstructionAction::Override, Some(target)) if target == self.id => {
                Err(LibError::invalid_with_code(
                    "override_self",
                    "A chain cannot override itself",
                    anyhow!("instruction {} overrides itself", self.id),
                ))
            }
            (ImportInstructionAction::Override, Some(_)) => Ok(()),
            (_, Some(_)) => Err(LibError::invalid_with_code(
                "overridden_by_only_for_override",
                "Overridden By is only allowed for an OVERRIDE instruction",
                anyhow!("{} instruction {} has an override target", self.action, self.id),
            )),
            (_, None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionFilterFeature {
    Id,
    OverriddenBy,
    EntityType,
    Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionFilterRequest {
    pub feature: InstructionFilterFeature,
    pub condition: FilterCondition,
    pub value: String,
}

impl InstructionFilterRequest {
    pub fn new(feature: InstructionFilterFeature, condition: FilterCondition, value: &str) -> Self {
        Self {
            feature,
            condition,
            value: value.to_string(),
        }
    }

    pub fn matches(&self, instruction: &ImportInstruction) -> bool {
        let values: Vec<String> = match self.feature {
            InstructionFilterFeature::Id => vec![instruction.id.to_lowercase()],
            InstructionFilterFeature::OverriddenBy => instruction
                .overridden_by
                .iter()
                .map(|target| target.to_lowercase())
                .collect(),
            InstructionFilterFeature::EntityType => {
                vec![instruction.entity_type.as_str().to_lowercase()]
            }
            InstructionFilterFeature::Action => vec![instruction.action.as_str().to_lowercase()],
        };
        self.condition.holds(&values, &self.value)
    }
}

/// Instructions matching every request.
pub fn filter_instructions(
    instructions: Vec<ImportInstruction>,
    filters: &[InstructionFilterRequest],
) -> Vec<ImportInstruction> {
    instructions
        .into_iter()
        .filter(|instruction| filters.iter().all(|filter| filter.matches(instruction)))
        .collect()
}

/// Instructions whose id or override target contains `term`.
pub fn search_instructions(instructions: Vec<ImportInstruction>, term: &str) -> Vec<ImportInstruction> {
    let term = term.trim();
    if term.is_empty() {
        return instructions;
    }
    let requests = [
        InstructionFilterFeature::Id,
        InstructionFilterFeature::OverriddenBy,
    ]
    .map(|feature| InstructionFilterRequest::new(feature, FilterCondition::Contains, term));
    instructions
        .into_iter()
        .filter(|instruction| requests.iter().any(|request| request.matches(instruction)))
        .collect()
}
