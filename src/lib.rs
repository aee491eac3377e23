pub mod action_log;
pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod copy;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod deployments;
pub mod descriptor;
pub mod elements;
pub mod error;
pub mod filter;
pub mod instructions;
pub mod invariants;
pub mod labels;
pub mod memory;
pub mod models;
pub mod operations;
pub mod repository;

pub mod prelude {
    pub use crate::action_log::{ActionLog, ActionLogger, EntityType, LogOperation, TracingActionLogger};
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, CatalogApp, HasCatalog};
    pub use crate::config::CatalogConfig;
    pub use crate::copy::copy_chain;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgCatalog, PgUnitOfWork, create_catalog_tables};
    #[cfg(feature = "runtime-client")]
    pub use crate::deployments::RuntimeCatalogClient;
    pub use crate::deployments::{DeploymentCleanup, NoopDeploymentCleanup};
    pub use crate::descriptor::{
        DescriptorRegistry, ElementDescriptor, ElementLibrary, Occurrence, PropertyDescriptor,
    };
    pub use crate::elements::{
        change_parent, create_element, delete_element, group_elements, ungroup_elements,
    };
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::filter::{ChainFilter, FilterCondition, FilterFeature, FilterRequest};
    pub use crate::instructions::{
        DeleteInstructionsRequest, ImportEntityType, ImportInstruction, ImportInstructionAction,
        ImportInstructionPayload, InstructionFilterFeature, InstructionFilterRequest,
    };
    pub use crate::invariants::{ChainInvariantViolation, ensure_chain_invariants};
    pub use crate::labels::{ChainLabel, Label, reconcile_labels};
    pub use crate::memory::InMemoryCatalog;
    pub use crate::models::{
        Chain, ChainDiff, ChainElement, ChainId, Dependency, DependencyId, ElementBody, ElementId,
        Folder, FolderId, SpecificationGroup, SpecificationGroupId, SystemModel, SystemModelId,
    };
    pub use crate::operations::{CatalogOperation, CatalogOperationResult, CatalogOperations};
    pub use crate::repository::CatalogStore;
}
