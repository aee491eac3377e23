use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::action_log::{ActionLog, ActionLogger, EntityType, LogOperation, TracingActionLogger};
use crate::copy::{self, numbered_name};
use crate::deployments::{DeploymentCleanup, NoopDeploymentCleanup};
use crate::descriptor::DescriptorRegistry;
use crate::elements;
use crate::error::{LibError, Result};
use crate::filter::ChainFilter;
use crate::instructions::{
    DeleteInstructionsRequest, ImportInstruction, ImportInstructionPayload,
    InstructionFilterRequest, filter_instructions, search_instructions,
};
use crate::labels::{
    ChainLabel, OVERRIDDEN_LABEL_NAME, OVERRIDES_LABEL_NAME, SpecificationGroupLabel,
    SystemModelLabel, reconcile_labels,
};
use crate::models::{
    Chain, ChainDiff, ChainElement, ChainId, ChangeParentPayload, CreateChainPayload,
    CreateElementPayload, CreateFolderPayload, CreateSpecificationGroupPayload, Dependency,
    ElementId, Folder, FolderId,
    GroupElementsPayload, MovePayload, SpecificationGroup, SpecificationGroupId, SystemModel,
    SystemModelId, UpdateChainPayload, normalize_name, now,
};
use crate::repository::CatalogStore;

/// High-level catalog actions, one per service call.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum CatalogOperation {
    CreateChain {
        payload: CreateChainPayload,
    },
    GetChain {
        chain_id: ChainId,
    },
    UpdateChain {
        chain_id: ChainId,
        payload: UpdateChainPayload,
    },
    MoveChain {
        chain_id: ChainId,
        payload: MovePayload,
    },
    CopyChain {
        chain_id: ChainId,
        payload: MovePayload,
    },
    DuplicateChain {
        chain_id: ChainId,
    },
    DeleteChain {
        chain_id: ChainId,
    },
    LinkOverride {
        overriding_chain_id: ChainId,
        overridden_chain_id: ChainId,
    },
    SearchChains {
        filter: ChainFilter,
    },
    CreateFolder {
        payload: CreateFolderPayload,
    },
    GetFolder {
        folder_id: FolderId,
    },
    MoveFolder {
        folder_id: FolderId,
        payload: MovePayload,
    },
    DeleteFolder {
        folder_id: FolderId,
    },
    NestedChains {
        folder_id: FolderId,
    },
    NavigationPath {
        folder_id: FolderId,
    },
    CreateElement {
        chain_id: ChainId,
        payload: CreateElementPayload,
    },
    DeleteElement {
        chain_id: ChainId,
        element_id: ElementId,
    },
    ChangeElementParent {
        chain_id: ChainId,
        element_id: ElementId,
        payload: ChangeParentPayload,
    },
    GroupElements {
        chain_id: ChainId,
        payload: GroupElementsPayload,
    },
    UngroupElements {
        chain_id: ChainId,
        group_id: ElementId,
    },
    CreateDependency {
        chain_id: ChainId,
        payload: CreateDependencyPayload,
    },
    CreateSpecificationGroup {
        payload: CreateSpecificationGroupPayload,
    },
    CreateUniqueSpecificationGroup {
        payload: CreateSpecificationGroupPayload,
    },
    UpdateSpecificationGroupLabels {
        group_id: SpecificationGroupId,
        labels: Vec<String>,
    },
    UpdateSystemModelLabels {
        model_id: SystemModelId,
        labels: Vec<String>,
    },
    ListImportInstructions,
    FilterImportInstructions {
        filters: Vec<InstructionFilterRequest>,
    },
    SearchImportInstructions {
        search_condition: String,
    },
    AddImportInstruction {
        payload: ImportInstructionPayload,
    },
    UpdateImportInstruction {
        payload: ImportInstructionPayload,
    },
    DeleteImportInstructions {
        payload: DeleteInstructionsRequest,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDependencyPayload {
    pub element_from: ElementId,
    pub element_to: ElementId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CatalogOperationResult {
    Chain { chain: Chain },
    Chains { items: Vec<Chain> },
    Folder { folder: Folder },
    Folders { items: Vec<Folder> },
    Diff { diff: ChainDiff },
    Element { element: ChainElement },
    Elements { items: Vec<ChainElement> },
    SpecificationGroup { group: SpecificationGroup },
    SystemModel { model: SystemModel },
    ImportInstruction { instruction: ImportInstruction },
    ImportInstructions { items: Vec<ImportInstruction> },
    Deleted,
}

/// Service façade over one [`CatalogStore`]. Engine calls run on a chain
/// loaded from the store and their diffs are written back through the same
/// store, so a transactional store makes every operation atomic.
pub struct CatalogOperations<S> {
    store: S,
    registry: Arc<dyn DescriptorRegistry>,
    cleanup: Arc<dyn DeploymentCleanup>,
    logger: Arc<dyn ActionLogger>,
}

impl<S: CatalogStore> CatalogOperations<S> {
    pub fn new(store: S, registry: Arc<dyn DescriptorRegistry>) -> Self {
        Self {
            store,
            registry,
            cleanup: Arc::new(NoopDeploymentCleanup),
            logger: Arc::new(TracingActionLogger),
        }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn DeploymentCleanup>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ActionLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub async fn execute(&self, operation: CatalogOperation) -> Result<CatalogOperationResult> {
        match operation {
            CatalogOperation::CreateChain { payload } => {
                let chain = self.create_chain(payload).await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::GetChain { chain_id } => {
                let chain = self.find_chain(chain_id).await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::UpdateChain { chain_id, payload } => {
                let chain = self.update_chain(chain_id, payload).await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::MoveChain { chain_id, payload } => {
                let chain = self.move_chain(chain_id, payload.target_folder_id).await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::CopyChain { chain_id, payload } => {
                let chain = self.copy_chain(chain_id, payload.target_folder_id).await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::DuplicateChain { chain_id } => {
                let chain = self.duplicate_chain(chain_id).await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::DeleteChain { chain_id } => {
                self.delete_chain(chain_id).await?;
                Ok(CatalogOperationResult::Deleted)
            }
            CatalogOperation::LinkOverride {
                overriding_chain_id,
                overridden_chain_id,
            } => {
                let chain = self
                    .link_override(overriding_chain_id, overridden_chain_id)
                    .await?;
                Ok(CatalogOperationResult::Chain { chain })
            }
            CatalogOperation::SearchChains { filter } => {
                let items = self.search_chains(filter).await?;
                Ok(CatalogOperationResult::Chains { items })
            }
            CatalogOperation::CreateFolder { payload } => {
                let folder = self.create_folder(payload).await?;
                Ok(CatalogOperationResult::Folder { folder })
            }
            CatalogOperation::GetFolder { folder_id } => {
                let folder = self.find_folder(folder_id).await?;
                Ok(CatalogOperationResult::Folder { folder })
            }
            CatalogOperation::MoveFolder { folder_id, payload } => {
                let folder = self.move_folder(folder_id, payload.target_folder_id).await?;
                Ok(CatalogOperationResult::Folder { folder })
            }
            CatalogOperation::DeleteFolder { folder_id } => {
                self.delete_folder(folder_id).await?;
                Ok(CatalogOperationResult::Deleted)
            }
            CatalogOperation::NestedChains { folder_id } => {
                let items = self.find_nested_chains(folder_id).await?;
                Ok(CatalogOperationResult::Chains { items })
            }
            CatalogOperation::NavigationPath { folder_id } => {
                let items = self.navigation_path(folder_id).await?;
                Ok(CatalogOperationResult::Folders { items })
            }
            CatalogOperation::CreateElement { chain_id, payload } => {
                let diff = self.create_element(chain_id, payload).await?;
                Ok(CatalogOperationResult::Diff { diff })
            }
            CatalogOperation::DeleteElement {
                chain_id,
                element_id,
            } => {
                let diff = self.delete_element(chain_id, element_id).await?;
                Ok(CatalogOperationResult::Diff { diff })
            }
            CatalogOperation::ChangeElementParent {
                chain_id,
                element_id,
                payload,
            } => {
                let element = self
                    .change_element_parent(chain_id, element_id, payload.parent_element_id)
                    .await?;
                Ok(CatalogOperationResult::Element { element })
            }
            CatalogOperation::GroupElements { chain_id, payload } => {
                let element = self.group_elements(chain_id, payload.element_ids).await?;
                Ok(CatalogOperationResult::Element { element })
            }
            CatalogOperation::UngroupElements { chain_id, group_id } => {
                let items = self.ungroup_elements(chain_id, group_id).await?;
                Ok(CatalogOperationResult::Elements { items })
            }
            CatalogOperation::CreateDependency { chain_id, payload } => {
                let diff = self.create_dependency(chain_id, payload).await?;
                Ok(CatalogOperationResult::Diff { diff })
            }
            CatalogOperation::CreateSpecificationGroup { payload } => {
                let group = self.create_specification_group(payload).await?;
                Ok(CatalogOperationResult::SpecificationGroup { group })
            }
            CatalogOperation::CreateUniqueSpecificationGroup { payload } => {
                let group = self.create_unique_specification_group(payload).await?;
                Ok(CatalogOperationResult::SpecificationGroup { group })
            }
            CatalogOperation::UpdateSpecificationGroupLabels { group_id, labels } => {
                let group = self
                    .update_specification_group_labels(group_id, labels)
                    .await?;
                Ok(CatalogOperationResult::SpecificationGroup { group })
            }
            CatalogOperation::UpdateSystemModelLabels { model_id, labels } => {
                let model = self.update_system_model_labels(model_id, labels).await?;
                Ok(CatalogOperationResult::SystemModel { model })
            }
            CatalogOperation::ListImportInstructions => {
                let items = self.list_import_instructions().await?;
                Ok(CatalogOperationResult::ImportInstructions { items })
            }
            CatalogOperation::FilterImportInstructions { filters } => {
                let items = self.filter_import_instructions(&filters).await?;
                Ok(CatalogOperationResult::ImportInstructions { items })
            }
            CatalogOperation::SearchImportInstructions { search_condition } => {
                let items = self.search_import_instructions(&search_condition).await?;
                Ok(CatalogOperationResult::ImportInstructions { items })
            }
            CatalogOperation::AddImportInstruction { payload } => {
                let instruction = self.add_import_instruction(payload).await?;
                Ok(CatalogOperationResult::ImportInstruction { instruction })
            }
            CatalogOperation::UpdateImportInstruction { payload } => {
                let instruction = self.update_import_instruction(payload).await?;
                Ok(CatalogOperationResult::ImportInstruction { instruction })
            }
            CatalogOperation::DeleteImportInstructions { payload } => {
                let items = self.delete_import_instructions(payload).await?;
                Ok(CatalogOperationResult::ImportInstructions { items })
            }
        }
    }

    pub async fn create_chain(&self, payload: CreateChainPayload) -> Result<Chain> {
        let name = normalize_name(&payload.name, "chain")?;
        let folder = self.optional_folder(payload.parent_folder_id).await?;
        let mut chain = Chain::new(&name, payload.parent_folder_id);
        chain.description = payload.description;
        self.store.save_chain(&chain).await?;

        info!(chain_id = %chain.id, name = %chain.name, "created chain");
        self.log(ActionLog::chain(&chain, folder.as_ref(), LogOperation::Create));
        Ok(chain)
    }

    pub async fn find_chain(&self, chain_id: ChainId) -> Result<Chain> {
        self.store.find_chain(chain_id).await?.ok_or_else(|| {
            LibError::not_found_with_code(
                "chain_not_found",
                "Chain not found",
                anyhow!("chain {} not found", chain_id),
            )
        })
    }

    pub async fn update_chain(
        &self,
        chain_id: ChainId,
        payload: UpdateChainPayload,
    ) -> Result<Chain> {
        let mut chain = self.find_chain(chain_id).await?;
        chain.name = normalize_name(&payload.name, "chain")?;
        chain.description = payload.description;
        if let Some(names) = payload.labels {
            let desired = label_names(names)
                .map(|name| ChainLabel::new(&name, chain_id))
                .collect();
            reconcile_labels(&mut chain.labels, desired);
        }
        chain.updated_at = now();
        self.store.save_chain(&chain).await?;

        let folder = self.optional_folder(chain.parent_folder).await?;
        self.log(ActionLog::chain(&chain, folder.as_ref(), LogOperation::Update));
        Ok(chain)
    }

    pub async fn move_chain(
        &self,
        chain_id: ChainId,
        target_folder_id: Option<FolderId>,
    ) -> Result<Chain> {
        let mut chain = self.find_chain(chain_id).await?;
        let folder = self.optional_folder(target_folder_id).await?;
        chain.parent_folder = target_folder_id;
        chain.updated_at = now();
        self.store.save_chain(&chain).await?;

        info!(chain_id = %chain_id, target_folder = ?target_folder_id, "moved chain");
        self.log(ActionLog::chain(&chain, folder.as_ref(), LogOperation::Move));
        Ok(chain)
    }

    /// Copies a chain into `target_folder_id`. The copy keeps the source name
    /// when it is free in the target folder, otherwise it gets the first free
    /// `name (n)`.
    pub async fn copy_chain(
        &self,
        chain_id: ChainId,
        target_folder_id: Option<FolderId>,
    ) -> Result<Chain> {
        let source = self.find_chain(chain_id).await?;
        let folder = self.optional_folder(target_folder_id).await?;
        let name = self.free_chain_name(&source.name, target_folder_id).await?;
        let copy = copy::copy_chain(&source, self.registry.as_ref(), name, target_folder_id)?;

        for dependency in copy.dependencies.values() {
            self.store.save_dependency(dependency).await?;
        }
        for element in copy.elements.values() {
            self.store.save_element(element).await?;
        }
        self.store.save_chain(&copy).await?;

        info!(source_chain = %chain_id, copy_chain = %copy.id, name = %copy.name, "copied chain");
        self.log(ActionLog::chain(&copy, folder.as_ref(), LogOperation::Copy));
        self.find_chain(copy.id).await
    }

    pub async fn duplicate_chain(&self, chain_id: ChainId) -> Result<Chain> {
        let chain = self.find_chain(chain_id).await?;
        self.copy_chain(chain_id, chain.parent_folder).await
    }

    pub async fn delete_chain(&self, chain_id: ChainId) -> Result<()> {
        let chain = self.find_chain(chain_id).await?;
        self.cleanup.delete_all_by_chain_id(chain_id).await?;
        self.release_override_partners(&chain, &HashSet::new()).await?;
        self.store.delete_chain(chain_id).await?;

        info!(chain_id = %chain_id, "deleted chain");
        let folder = self.optional_folder(chain.parent_folder).await.ok().flatten();
        self.log(ActionLog::chain(&chain, folder.as_ref(), LogOperation::Delete));
        Ok(())
    }

    /// Pairs `overriding_id` with `overridden_id`, breaking any pairing
    /// either chain already takes part in. Returns the overriding chain.
    pub async fn link_override(
        &self,
        overriding_id: ChainId,
        overridden_id: ChainId,
    ) -> Result<Chain> {
        if overriding_id == overridden_id {
            return Err(LibError::invalid_with_code(
                "override_self",
                "Chain cannot override itself",
                anyhow!("chain {} was asked to override itself", overriding_id),
            ));
        }
        let mut overriding = self.find_chain(overriding_id).await?;
        let mut overridden = self.find_chain(overridden_id).await?;

        let pair: HashSet<ChainId> = [overriding_id, overridden_id].into_iter().collect();
        self.release_override_partners(&overriding, &pair).await?;
        self.release_override_partners(&overridden, &pair).await?;
        clear_override(&mut overriding);
        clear_override(&mut overridden);

        let timestamp = now();
        overriding.overrides_chain = Some(overridden_id);
        overriding
            .labels
            .push(ChainLabel::technical(OVERRIDES_LABEL_NAME, overriding_id));
        overriding.updated_at = timestamp;
        overridden.overridden_by_chain = Some(overriding_id);
        overridden
            .labels
            .push(ChainLabel::technical(OVERRIDDEN_LABEL_NAME, overridden_id));
        overridden.updated_at = timestamp;
        self.store.save_chain(&overridden).await?;
        self.store.save_chain(&overriding).await?;

        info!(overriding = %overriding_id, overridden = %overridden_id, "linked chain override");
        let folder = self.optional_folder(overriding.parent_folder).await?;
        self.log(ActionLog::chain(&overriding, folder.as_ref(), LogOperation::Update));
        Ok(overriding)
    }

    pub async fn search_chains(&self, filter: ChainFilter) -> Result<Vec<Chain>> {
        let chains = match filter.folder_id {
            Some(folder_id) => self.find_nested_chains(folder_id).await?,
            None => self.store.list_chains().await?,
        };
        Ok(filter.apply(chains))
    }

    pub async fn create_folder(&self, payload: CreateFolderPayload) -> Result<Folder> {
        let name = normalize_name(&payload.name, "folder")?;
        let parent = self.optional_folder(payload.parent_folder_id).await?;
        let mut folder = Folder::new(&name, payload.parent_folder_id);
        folder.description = payload.description;
        self.store.save_folder(&folder).await?;

        info!(folder_id = %folder.id, name = %folder.name, "created folder");
        self.log(ActionLog::folder(&folder, parent.as_ref(), LogOperation::Create));
        Ok(folder)
    }

    pub async fn find_folder(&self, folder_id: FolderId) -> Result<Folder> {
        self.store.find_folder(folder_id).await?.ok_or_else(|| {
            LibError::not_found_with_code(
                "folder_not_found",
                "Folder not found",
                anyhow!("folder {} not found", folder_id),
            )
        })
    }

    /// Re-parents a folder. Fails with `folder_move_cycle` when the target is
    /// the folder itself or one of its descendants.
    pub async fn move_folder(
        &self,
        folder_id: FolderId,
        target_folder_id: Option<FolderId>,
    ) -> Result<Folder> {
        let mut folder = self.find_folder(folder_id).await?;
        let target = self.optional_folder(target_folder_id).await?;

        let mut visited = HashSet::new();
        let mut cursor = target.as_ref().map(|target| target.id);
        while let Some(current) = cursor {
            if current == folder_id {
                return Err(LibError::conflict(
                    "folder_move_cycle",
                    "Folder cannot be moved into itself or its own subfolder",
                    anyhow!("folder {} is an ancestor of target {:?}", folder_id, target_folder_id),
                ));
            }
            if !visited.insert(current) {
                break;
            }
            cursor = self
                .store
                .find_folder(current)
                .await?
                .and_then(|ancestor| ancestor.parent_folder);
        }

        folder.parent_folder = target_folder_id;
        folder.updated_at = now();
        self.store.save_folder(&folder).await?;

        info!(folder_id = %folder_id, target_folder = ?target_folder_id, "moved folder");
        self.log(ActionLog::folder(&folder, target.as_ref(), LogOperation::Move));
        Ok(folder)
    }

    /// Deletes a folder subtree. Deployments of every nested chain are
    /// cleaned up before anything is removed.
    pub async fn delete_folder(&self, folder_id: FolderId) -> Result<()> {
        let subtree = self.folder_subtree(folder_id).await?;
        let mut nested = Vec::new();
        for folder in &subtree {
            for chain in self.store.find_chains_by_folder(Some(folder.id)).await? {
                nested.push((chain, folder));
            }
        }

        for (chain, _) in &nested {
            self.cleanup.delete_all_by_chain_id(chain.id).await?;
        }
        let nested_ids: HashSet<ChainId> = nested.iter().map(|(chain, _)| chain.id).collect();
        for (chain, _) in &nested {
            self.release_override_partners(chain, &nested_ids).await?;
        }
        self.store.delete_folder(folder_id).await?;

        info!(
            folder_id = %folder_id,
            folders = subtree.len(),
            chains = nested.len(),
            "deleted folder"
        );
        for (chain, folder) in &nested {
            self.log(ActionLog::chain(chain, Some(*folder), LogOperation::Delete));
        }
        Ok(())
    }

    pub async fn find_nested_chains(&self, folder_id: FolderId) -> Result<Vec<Chain>> {
        let mut chains = Vec::new();
        for folder in self.folder_subtree(folder_id).await? {
            chains.extend(self.store.find_chains_by_folder(Some(folder.id)).await?);
        }
        Ok(chains)
    }

    /// Folders from the root down to `folder_id`, inclusive.
    pub async fn navigation_path(&self, folder_id: FolderId) -> Result<Vec<Folder>> {
        let folder = self.find_folder(folder_id).await?;
        let mut visited = HashSet::from([folder.id]);
        let mut cursor = folder.parent_folder;
        let mut path = vec![folder];
        while let Some(parent_id) = cursor {
            if !visited.insert(parent_id) {
                break;
            }
            let Some(parent) = self.store.find_folder(parent_id).await? else {
                break;
            };
            cursor = parent.parent_folder;
            path.push(parent);
        }
        path.reverse();
        Ok(path)
    }

    pub async fn create_element(
        &self,
        chain_id: ChainId,
        payload: CreateElementPayload,
    ) -> Result<ChainDiff> {
        let mut chain = self.find_chain(chain_id).await?;
        let diff = elements::create_element(
            &mut chain,
            self.registry.as_ref(),
            &payload.element_type,
            payload.parent_element_id,
        )?;
        self.persist_diff(&mut chain, &diff).await?;

        if let Some(created) = diff.created_elements.first() {
            self.log(ActionLog::element(created, &chain, LogOperation::Create));
        }
        Ok(diff)
    }

    pub async fn delete_element(
        &self,
        chain_id: ChainId,
        element_id: ElementId,
    ) -> Result<ChainDiff> {
        let mut chain = self.find_chain(chain_id).await?;
        let diff = elements::delete_element(&mut chain, self.registry.as_ref(), element_id)?;
        self.persist_diff(&mut chain, &diff).await?;

        if let Some(removed) = diff
            .removed_elements
            .iter()
            .find(|element| element.id == element_id)
        {
            self.log(ActionLog::element(removed, &chain, LogOperation::Delete));
        }
        Ok(diff)
    }

    pub async fn change_element_parent(
        &self,
        chain_id: ChainId,
        element_id: ElementId,
        parent_element_id: Option<ElementId>,
    ) -> Result<ChainElement> {
        let mut chain = self.find_chain(chain_id).await?;
        let diff = elements::change_parent(
            &mut chain,
            self.registry.as_ref(),
            element_id,
            parent_element_id,
        )?;
        self.persist_diff(&mut chain, &diff).await?;

        let element = chain.element(element_id)?.clone();
        self.log(ActionLog::element(&element, &chain, LogOperation::Move));
        Ok(element)
    }

    /// Returns the new grouping container.
    pub async fn group_elements(
        &self,
        chain_id: ChainId,
        element_ids: Vec<ElementId>,
    ) -> Result<ChainElement> {
        let mut chain = self.find_chain(chain_id).await?;
        let diff = elements::group_elements(&mut chain, self.registry.as_ref(), &element_ids)?;
        self.persist_diff(&mut chain, &diff).await?;

        let group = diff.created_elements.first().cloned().ok_or_else(|| {
            LibError::unknown(
                "Group was not created",
                anyhow!("group of {} elements produced no container", element_ids.len()),
            )
        })?;
        self.log(ActionLog::element(&group, &chain, LogOperation::Group));
        Ok(group)
    }

    /// Returns the former children of the group, now at the chain root.
    pub async fn ungroup_elements(
        &self,
        chain_id: ChainId,
        group_id: ElementId,
    ) -> Result<Vec<ChainElement>> {
        let mut chain = self.find_chain(chain_id).await?;
        let freed = chain.element(group_id)?.children().to_vec();
        let diff = elements::ungroup_elements(&mut chain, group_id)?;
        self.persist_diff(&mut chain, &diff).await?;

        if let Some(group) = diff
            .removed_elements
            .iter()
            .find(|element| element.id == group_id)
        {
            self.log(ActionLog::element(group, &chain, LogOperation::Ungroup));
        }
        Ok(freed
            .iter()
            .filter_map(|id| chain.elements.get(id).cloned())
            .collect())
    }

    /// Connects two elements of the same chain.
    pub async fn create_dependency(
        &self,
        chain_id: ChainId,
        payload: CreateDependencyPayload,
    ) -> Result<ChainDiff> {
        let mut chain = self.find_chain(chain_id).await?;
        let dependency = Dependency::of(payload.element_from, payload.element_to);
        chain.connect(dependency.clone())?;

        let mut diff = ChainDiff {
            created_dependencies: vec![dependency],
            ..ChainDiff::default()
        };
        for endpoint in [payload.element_from, payload.element_to] {
            let element = chain.element_mut(endpoint)?;
            element.touch();
            if !diff.updated_elements.iter().any(|known| known.id == endpoint) {
                diff.updated_elements.push(element.clone());
            }
        }
        self.persist_diff(&mut chain, &diff).await?;
        Ok(diff)
    }

    /// Creates a group under `system_id`; the name must be free there.
    pub async fn create_specification_group(
        &self,
        payload: CreateSpecificationGroupPayload,
    ) -> Result<SpecificationGroup> {
        let name = normalize_name(&payload.name, "specification group")?;
        let system_id = normalize_name(&payload.system_id, "service")?;
        let taken = self.specification_group_names(&system_id).await?;
        if taken.contains(&name) {
            return Err(LibError::conflict(
                "specification_group_name_taken",
                "Specification group with this name already exists in the system",
                anyhow!(
                    "specification group {:?} already exists in system {}",
                    name,
                    system_id
                ),
            ));
        }
        self.insert_specification_group(payload, system_id, name).await
    }

    /// Like [`Self::create_specification_group`], but a taken name becomes
    /// the first free `name (n)`.
    pub async fn create_unique_specification_group(
        &self,
        payload: CreateSpecificationGroupPayload,
    ) -> Result<SpecificationGroup> {
        let base = normalize_name(&payload.name, "specification group")?;
        let system_id = normalize_name(&payload.system_id, "service")?;
        let taken = self.specification_group_names(&system_id).await?;
        let mut name = base.clone();
        let mut copy_number = 0;
        while taken.contains(&name) {
            copy_number += 1;
            name = numbered_name(&base, copy_number);
        }
        self.insert_specification_group(payload, system_id, name).await
    }

    pub async fn update_specification_group_labels(
        &self,
        group_id: SpecificationGroupId,
        labels: Vec<String>,
    ) -> Result<SpecificationGroup> {
        let mut group = self
            .store
            .find_specification_group(group_id)
            .await?
            .ok_or_else(|| {
                LibError::not_found_with_code(
                    "specification_group_not_found",
                    "Specification group not found",
                    anyhow!("specification group {} not found", group_id),
                )
            })?;
        let desired = label_names(labels)
            .map(|name| SpecificationGroupLabel {
                name,
                technical: false,
                specification_group_id: group_id,
            })
            .collect();
        reconcile_labels(&mut group.labels, desired);
        self.store.save_specification_group(&group).await?;

        self.log(labels_updated(
            EntityType::SpecificationGroup,
            group_id.to_string(),
            &group.name,
        ));
        Ok(group)
    }

    pub async fn update_system_model_labels(
        &self,
        model_id: SystemModelId,
        labels: Vec<String>,
    ) -> Result<SystemModel> {
        let mut model = self
            .store
            .find_system_model(model_id)
            .await?
            .ok_or_else(|| {
                LibError::not_found_with_code(
                    "system_model_not_found",
                    "System model not found",
                    anyhow!("system model {} not found", model_id),
                )
            })?;
        let desired = label_names(labels)
            .map(|name| SystemModelLabel {
                name,
                technical: false,
                system_model_id: model_id,
            })
            .collect();
        reconcile_labels(&mut model.labels, desired);
        self.store.save_system_model(&model).await?;

        self.log(labels_updated(
            EntityType::SystemModel,
            model_id.to_string(),
            &model.name,
        ));
        Ok(model)
    }

    pub async fn list_import_instructions(&self) -> Result<Vec<ImportInstruction>> {
        self.store.list_import_instructions().await
    }

    pub async fn filter_import_instructions(
        &self,
        filters: &[InstructionFilterRequest],
    ) -> Result<Vec<ImportInstruction>> {
        let instructions = self.store.list_import_instructions().await?;
        Ok(filter_instructions(instructions, filters))
    }

    /// Instructions whose id or override target contains `search_condition`.
    pub async fn search_import_instructions(
        &self,
        search_condition: &str,
    ) -> Result<Vec<ImportInstruction>> {
        let instructions = self.store.list_import_instructions().await?;
        Ok(search_instructions(instructions, search_condition))
    }

    pub async fn add_import_instruction(
        &self,
        payload: ImportInstructionPayload,
    ) -> Result<ImportInstruction> {
        let instruction = ImportInstruction::from_payload(payload)?;
        if self
            .store
            .find_import_instruction(&instruction.id)
            .await?
            .is_some()
        {
            return Err(LibError::conflict(
                "import_instruction_exists",
                "Instruction for this entity already exists",
                anyhow!("instruction for {} already exists", instruction.id),
            ));
        }
        self.ensure_override_target_free(&instruction).await?;
        self.store.save_import_instruction(&instruction).await?;

        info!(
            instruction_id = %instruction.id,
            action = %instruction.action,
            "added import instruction"
        );
        self.log(ActionLog::import_instruction(&instruction, LogOperation::Create));
        Ok(instruction)
    }

    pub async fn update_import_instruction(
        &self,
        payload: ImportInstructionPayload,
    ) -> Result<ImportInstruction> {
        let update = ImportInstruction::from_payload(payload)?;
        let mut instruction = self
            .store
            .find_import_instruction(&update.id)
            .await?
            .ok_or_else(|| {
                LibError::not_found_with_code(
                    "import_instruction_not_found",
                    "Instruction does not exist",
                    anyhow!("instruction {} does not exist", update.id),
                )
            })?;
        if instruction.entity_type != update.entity_type {
            return Err(LibError::invalid_with_code(
                "instruction_entity_type_immutable",
                "Import instruction entity type cannot be updated",
                anyhow!(
                    "instruction {} is {}, not {}",
                    instruction.id,
                    instruction.entity_type,
                    update.entity_type
                ),
            ));
        }
        instruction.patch(&update);
        self.ensure_override_target_free(&instruction).await?;
        self.store.save_import_instruction(&instruction).await?;

        self.log(ActionLog::import_instruction(&instruction, LogOperation::Update));
        Ok(instruction)
    }

    /// Deletes the listed chain and service instructions that exist and
    /// returns them. Unknown ids are ignored.
    pub async fn delete_import_instructions(
        &self,
        request: DeleteInstructionsRequest,
    ) -> Result<Vec<ImportInstruction>> {
        let ids = request.ids();
        let instructions = self.store.find_import_instructions(&ids).await?;
        let existing: Vec<String> = instructions
            .iter()
            .map(|instruction| instruction.id.clone())
            .collect();
        self.store.delete_import_instructions(&existing).await?;

        for instruction in &instructions {
            self.log(ActionLog::import_instruction(instruction, LogOperation::Delete));
        }
        Ok(instructions)
    }

    async fn persist_diff(&self, chain: &mut Chain, diff: &ChainDiff) -> Result<()> {
        self.store
            .delete_all_dependencies(&diff.removed_dependency_ids())
            .await?;
        self.store
            .delete_all_elements(&diff.removed_element_ids())
            .await?;
        for element in &diff.created_elements {
            self.store.save_element(element).await?;
        }
        for dependency in &diff.created_dependencies {
            self.store.save_dependency(dependency).await?;
        }
        self.store.save_all_elements(&diff.updated_elements).await?;
        chain.updated_at = now();
        self.store.save_chain(chain).await
    }

    async fn optional_folder(&self, folder_id: Option<FolderId>) -> Result<Option<Folder>> {
        match folder_id {
            Some(folder_id) => self.find_folder(folder_id).await.map(Some),
            None => Ok(None),
        }
    }

    /// The folder and every folder below it, parents before children.
    async fn folder_subtree(&self, root: FolderId) -> Result<Vec<Folder>> {
        let root = self.find_folder(root).await?;
        let mut visited = HashSet::new();
        let mut subtree = Vec::new();
        let mut stack = vec![root];
        while let Some(folder) = stack.pop() {
            if !visited.insert(folder.id) {
                continue;
            }
            let mut children = self.store.find_folders_by_parent(Some(folder.id)).await?;
            children.reverse();
            stack.extend(children);
            subtree.push(folder);
        }
        Ok(subtree)
    }

    async fn free_chain_name(&self, base: &str, folder_id: Option<FolderId>) -> Result<String> {
        if !self
            .store
            .exists_by_name_and_parent_folder_id(base, folder_id)
            .await?
        {
            return Ok(base.to_string());
        }
        let mut copy_number = 1;
        loop {
            let candidate = numbered_name(base, copy_number);
            if !self
                .store
                .exists_by_name_and_parent_folder_id(&candidate, folder_id)
                .await?
            {
                return Ok(candidate);
            }
            copy_number += 1;
        }
    }

    /// Clears the override pairing `chain` holds on its partners, skipping
    /// partners listed in `skip`.
    async fn release_override_partners(
        &self,
        chain: &Chain,
        skip: &HashSet<ChainId>,
    ) -> Result<()> {
        let partners = [chain.overrides_chain, chain.overridden_by_chain];
        for partner_id in partners.into_iter().flatten() {
            if skip.contains(&partner_id) {
                continue;
            }
            let Some(mut partner) = self.store.find_chain(partner_id).await? else {
                warn!(chain_id = %chain.id, partner = %partner_id, "override partner is missing");
                continue;
            };
            if partner.overridden_by_chain == Some(chain.id) {
                partner.overridden_by_chain = None;
                remove_technical_label(&mut partner.labels, OVERRIDDEN_LABEL_NAME);
            }
            if partner.overrides_chain == Some(chain.id) {
                partner.overrides_chain = None;
                remove_technical_label(&mut partner.labels, OVERRIDES_LABEL_NAME);
            }
            partner.updated_at = now();
            self.store.save_chain(&partner).await?;
        }
        Ok(())
    }

    async fn specification_group_names(&self, system_id: &str) -> Result<HashSet<String>> {
        Ok(self
            .store
            .find_specification_groups_by_system(system_id)
            .await?
            .into_iter()
            .map(|group| group.name)
            .collect())
    }

    async fn insert_specification_group(
        &self,
        payload: CreateSpecificationGroupPayload,
        system_id: String,
        name: String,
    ) -> Result<SpecificationGroup> {
        let mut group = SpecificationGroup::new(&name, &system_id);
        group.description = payload.description;
        group.url = payload.url;
        group.synchronization = payload.synchronization;
        self.store.save_specification_group(&group).await?;

        info!(group_id = %group.id, name = %group.name, "created specification group");
        self.log(ActionLog::specification_group(&group, LogOperation::Create));
        Ok(group)
    }

    /// One chain can be the override target of a single instruction.
    async fn ensure_override_target_free(&self, instruction: &ImportInstruction) -> Result<()> {
        let Some(target) = instruction.overridden_by.as_deref() else {
            return Ok(());
        };
        match self
            .store
            .find_import_instruction_by_overridden_by(target)
            .await?
        {
            Some(other) if other.id != instruction.id => Err(LibError::conflict(
                "import_instruction_override_taken",
                "Chain already overrides another chain",
                anyhow!("{} already overrides {}", target, other.id),
            )),
            _ => Ok(()),
        }
    }

    fn log(&self, action: ActionLog) {
        self.logger.log_action(action);
    }
}

fn label_names(names: Vec<String>) -> impl Iterator<Item = String> {
    names
        .into_iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn remove_technical_label(labels: &mut Vec<ChainLabel>, name: &str) {
    labels.retain(|label| !(label.technical && label.name == name));
}

fn clear_override(chain: &mut Chain) {
    chain.overrides_chain = None;
    chain.overridden_by_chain = None;
    remove_technical_label(&mut chain.labels, OVERRIDES_LABEL_NAME);
    remove_technical_label(&mut chain.labels, OVERRIDDEN_LABEL_NAME);
}

fn labels_updated(entity_type: EntityType, entity_id: String, entity_name: &str) -> ActionLog {
    ActionLog {
        entity_type,
        entity_id,
        entity_name: entity_name.to_string(),
        parent_type: None,
        parent_id: None,
        parent_name: None,
        operation: LogOperation::Update,
    }
}
