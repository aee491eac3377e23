use async_trait::async_trait;

use crate::error::Result;
use crate::instructions::ImportInstruction;
use crate::models::{
    Chain, ChainElement, ChainId, Dependency, DependencyId, ElementId, Folder, FolderId,
    SpecificationGroup, SpecificationGroupId, SystemModel, SystemModelId,
};

#[async_trait]
pub trait ChainRepository: Send + Sync {
    /// Loads a chain with its full element arena and dependencies.
    async fn find_chain(&self, chain_id: ChainId) -> Result<Option<Chain>>;

    async fn find_all_chains(&self, chain_ids: &[ChainId]) -> Result<Vec<Chain>>;

    async fn find_chains_by_folder(&self, folder_id: Option<FolderId>) -> Result<Vec<Chain>>;

    async fn list_chains(&self) -> Result<Vec<Chain>>;

    /// Upserts the chain row and replaces its labels. Elements and
    /// dependencies are written through their own repositories.
    async fn save_chain(&self, chain: &Chain) -> Result<()>;

    /// Removes the chain together with its elements and dependencies.
    async fn delete_chain(&self, chain_id: ChainId) -> Result<()>;

    async fn exists_by_name_and_parent_folder_id(
        &self,
        name: &str,
        parent_folder_id: Option<FolderId>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait ElementRepository: Send + Sync {
    async fn find_element(&self, element_id: ElementId) -> Result<Option<ChainElement>>;

    /// Upserts one element and returns it as stored. Elements saved with both
    /// timestamps cleared receive equal fresh ones.
    async fn save_element(&self, element: &ChainElement) -> Result<ChainElement>;

    async fn save_all_elements(&self, elements: &[ChainElement]) -> Result<()>;

    async fn delete_all_elements(&self, element_ids: &[ElementId]) -> Result<()>;
}

#[async_trait]
pub trait DependencyRepository: Send + Sync {
    async fn save_dependency(&self, dependency: &Dependency) -> Result<()>;

    async fn delete_all_dependencies(&self, dependency_ids: &[DependencyId]) -> Result<()>;
}

#[async_trait]
pub trait FolderRepository: Send + Sync {
    async fn find_folder(&self, folder_id: FolderId) -> Result<Option<Folder>>;

    async fn find_folders_by_parent(&self, parent_folder_id: Option<FolderId>)
    -> Result<Vec<Folder>>;

    async fn save_folder(&self, folder: &Folder) -> Result<()>;

    /// Removes the folder and everything nested under it.
    async fn delete_folder(&self, folder_id: FolderId) -> Result<()>;
}

#[async_trait]
pub trait SpecificationGroupRepository: Send + Sync {
    async fn find_specification_group(
        &self,
        group_id: SpecificationGroupId,
    ) -> Result<Option<SpecificationGroup>>;

    async fn find_specification_groups_by_system(
        &self,
        system_id: &str,
    ) -> Result<Vec<SpecificationGroup>>;

    async fn save_specification_group(&self, group: &SpecificationGroup) -> Result<()>;
}

#[async_trait]
pub trait SystemModelRepository: Send + Sync {
    async fn find_system_model(&self, model_id: SystemModelId) -> Result<Option<SystemModel>>;

    async fn save_system_model(&self, model: &SystemModel) -> Result<()>;
}

#[async_trait]
pub trait ImportInstructionRepository: Send + Sync {
    async fn find_import_instruction(&self, id: &str) -> Result<Option<ImportInstruction>>;

    async fn find_import_instructions(&self, ids: &[String]) -> Result<Vec<ImportInstruction>>;

    /// The instruction currently overriding with `overridden_by`, if any.
    /// At most one exists.
    async fn find_import_instruction_by_overridden_by(
        &self,
        overridden_by: &str,
    ) -> Result<Option<ImportInstruction>>;

    async fn list_import_instructions(&self) -> Result<Vec<ImportInstruction>>;

    async fn save_import_instruction(&self, instruction: &ImportInstruction) -> Result<()>;

    async fn delete_import_instructions(&self, ids: &[String]) -> Result<()>;
}

/// Everything the catalog services need from one backing store.
pub trait CatalogStore:
    ChainRepository
    + ElementRepository
    + DependencyRepository
    + FolderRepository
    + SpecificationGroupRepository
    + SystemModelRepository
    + ImportInstructionRepository
{
}

impl<T> CatalogStore for T where
    T: ChainRepository
        + ElementRepository
        + DependencyRepository
        + FolderRepository
        + SpecificationGroupRepository
        + SystemModelRepository
        + ImportInstructionRepository
{
}
