use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::instructions::ImportInstruction;
use crate::models::{Chain, ChainElement, Folder, SpecificationGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Chain,
    Folder,
    Element,
    SpecificationGroup,
    SystemModel,
    Service,
    ImportInstruction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogOperation {
    Create,
    Update,
    Move,
    Copy,
    Delete,
    Group,
    Ungroup,
}

/// One audit record describing a committed catalog mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLog {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub entity_name: String,
    pub parent_type: Option<EntityType>,
    pub parent_id: Option<String>,
    pub parent_name: Option<String>,
    pub operation: LogOperation,
}

impl ActionLog {
    pub fn chain(chain: &Chain, parent: Option<&Folder>, operation: LogOperation) -> Self {
        let parent_id = parent
            .map(|folder| folder.id)
            .or(chain.parent_folder)
            .map(|id| id.to_string());
        Self {
            entity_type: EntityType::Chain,
            entity_id: chain.id.to_string(),
            entity_name: chain.name.clone(),
            parent_type: parent_id.as_ref().map(|_| EntityType::Folder),
            parent_id,
            parent_name: parent.map(|folder| folder.name.clone()),
            operation,
        }
    }

    pub fn folder(folder: &Folder, parent: Option<&Folder>, operation: LogOperation) -> Self {
        let parent_id = parent
            .map(|parent| parent.id)
            .or(folder.parent_folder)
            .map(|id| id.to_string());
        Self {
            entity_type: EntityType::Folder,
            entity_id: folder.id.to_string(),
            entity_name: folder.name.clone(),
            parent_type: parent_id.as_ref().map(|_| EntityType::Folder),
            parent_id,
            parent_name: parent.map(|parent| parent.name.clone()),
            operation,
        }
    }

    pub fn element(element: &ChainElement, chain: &Chain, operation: LogOperation) -> Self {
        Self {
            entity_type: EntityType::Element,
            entity_id: element.id.to_string(),
            entity_name: element.name.clone(),
            parent_type: Some(EntityType::Chain),
            parent_id: Some(chain.id.to_string()),
            parent_name: Some(chain.name.clone()),
            operation,
        }
    }

    /// Specification groups hang off the integration system (service) they
    /// describe.
    pub fn specification_group(group: &SpecificationGroup, operation: LogOperation) -> Self {
        Self {
            entity_type: EntityType::SpecificationGroup,
            entity_id: group.id.to_string(),
            entity_name: group.name.clone(),
            parent_type: Some(EntityType::Service),
            parent_id: Some(group.system_id.clone()),
            parent_name: None,
            operation,
        }
    }

    pub fn import_instruction(instruction: &ImportInstruction, operation: LogOperation) -> Self {
        Self {
            entity_type: EntityType::ImportInstruction,
            entity_id: instruction.id.clone(),
            entity_name: instruction.id.clone(),
            parent_type: None,
            parent_id: None,
            parent_name: Some(instruction.entity_type.as_str().to_string()),
            operation,
        }
    }
}

/// Fire-and-forget audit sink. Implementations must not fail the caller.
pub trait ActionLogger: Send + Sync {
    fn log_action(&self, action: ActionLog);
}

/// Emits every record as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingActionLogger;

impl ActionLogger for TracingActionLogger {
    fn log_action(&self, action: ActionLog) {
        info!(
            target: "designtime_catalog::action_log",
            entity_type = ?action.entity_type,
            entity_id = %action.entity_id,
            entity_name = %action.entity_name,
            parent_type = ?action.parent_type,
            parent_id = ?action.parent_id,
            parent_name = ?action.parent_name,
            operation = ?action.operation,
            "catalog action"
        );
    }
}

/// Holds records until [`DeferredActionLogger::flush`] hands them to the
/// inner logger. Records still pending on drop are discarded, so entries
/// from a rolled-back transaction never reach the audit log.
pub struct DeferredActionLogger {
    inner: Arc<dyn ActionLogger>,
    pending: Mutex<Vec<ActionLog>>,
}

impl DeferredActionLogger {
    pub fn new(inner: Arc<dyn ActionLogger>) -> Self {
        Self {
            inner,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn flush(&self) {
        let pending = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => {
                warn!("action log buffer poisoned, dropping pending records");
                return;
            }
        };
        for action in pending {
            self.inner.log_action(action);
        }
    }
}

impl ActionLogger for DeferredActionLogger {
    fn log_action(&self, action: ActionLog) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(action);
        }
    }
}
