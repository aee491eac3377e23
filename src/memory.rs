use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::algorithms::walk_hierarchy;
use crate::error::Result;
use crate::instructions::ImportInstruction;
use crate::models::{
    Chain, ChainElement, ChainId, Dependency, DependencyId, ElementId, Folder, FolderId,
    SpecificationGroup, SpecificationGroupId, SystemModel, SystemModelId,
};
use crate::repository::{
    ChainRepository, DependencyRepository, ElementRepository, FolderRepository,
    ImportInstructionRepository, SpecificationGroupRepository, SystemModelRepository,
};

#[derive(Debug, Default)]
struct Tables {
    /// Chain rows without their arena.
    chains: BTreeMap<ChainId, Chain>,
    /// Element rows; adjacency lists are rebuilt from `dependencies` on load.
    elements: BTreeMap<ElementId, ChainElement>,
    dependencies: BTreeMap<DependencyId, Dependency>,
    folders: BTreeMap<FolderId, Folder>,
    specification_groups: BTreeMap<SpecificationGroupId, SpecificationGroup>,
    system_models: BTreeMap<SystemModelId, SystemModel>,
    import_instructions: BTreeMap<String, ImportInstruction>,
}

impl Tables {
    fn assemble(&self, row: &Chain) -> Chain {
        let mut chain = row.clone();
        chain.elements = self
            .elements
            .values()
            .filter(|element| element.chain_id == row.id)
            .map(|element| (element.id, element.clone()))
            .collect();
        for dependency in self.dependencies.values() {
            if !chain.elements.contains_key(&dependency.element_from)
                || !chain.elements.contains_key(&dependency.element_to)
            {
                continue;
            }
            if let Some(from) = chain.elements.get_mut(&dependency.element_from) {
                from.output_dependencies.push(dependency.id);
            }
            if let Some(to) = chain.elements.get_mut(&dependency.element_to) {
                to.input_dependencies.push(dependency.id);
            }
            chain.dependencies.insert(dependency.id, dependency.clone());
        }
        chain
    }

    fn remove_chain(&mut self, chain_id: ChainId) {
        self.chains.remove(&chain_id);
        let element_ids: HashSet<ElementId> = self
            .elements
            .values()
            .filter(|element| element.chain_id == chain_id)
            .map(|element| element.id)
            .collect();
        self.elements.retain(|id, _| !element_ids.contains(id));
        self.dependencies.retain(|_, dependency| {
            !element_ids.contains(&dependency.element_from)
                && !element_ids.contains(&dependency.element_to)
        });
    }
}

fn element_row(element: &ChainElement) -> ChainElement {
    let mut row = element.clone();
    row.input_dependencies.clear();
    row.output_dependencies.clear();
    let (created, modified) = element.stored_timestamps();
    row.created_when = Some(created);
    row.modified_when = Some(modified);
    row
}

/// Table-per-entity store guarded by one async lock.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    tables: RwLock<Tables>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn element_count(&self) -> usize {
        self.tables.read().await.elements.len()
    }

    pub async fn dependency_count(&self) -> usize {
        self.tables.read().await.dependencies.len()
    }
}

#[async_trait]
impl ChainRepository for InMemoryCatalog {
    async fn find_chain(&self, chain_id: ChainId) -> Result<Option<Chain>> {
        let tables = self.tables.read().await;
        Ok(tables.chains.get(&chain_id).map(|row| tables.assemble(row)))
    }

    async fn find_all_chains(&self, chain_ids: &[ChainId]) -> Result<Vec<Chain>> {
        let tables = self.tables.read().await;
        Ok(chain_ids
            .iter()
            .filter_map(|chain_id| tables.chains.get(chain_id))
            .map(|row| tables.assemble(row))
            .collect())
    }

    async fn find_chains_by_folder(&self, folder_id: Option<FolderId>) -> Result<Vec<Chain>> {
        let tables = self.tables.read().await;
        Ok(tables
            .chains
            .values()
            .filter(|row| row.parent_folder == folder_id)
            .map(|row| tables.assemble(row))
            .collect())
    }

    async fn list_chains(&self) -> Result<Vec<Chain>> {
        let tables = self.tables.read().await;
        Ok(tables
            .chains
            .values()
            .map(|row| tables.assemble(row))
            .collect())
    }

    async fn save_chain(&self, chain: &Chain) -> Result<()> {
        let mut row = chain.clone();
        row.elements.clear();
        row.dependencies.clear();
        self.tables.write().await.chains.insert(row.id, row);
        Ok(())
    }

    async fn delete_chain(&self, chain_id: ChainId) -> Result<()> {
        self.tables.write().await.remove_chain(chain_id);
        Ok(())
    }

    async fn exists_by_name_and_parent_folder_id(
        &self,
        name: &str,
        parent_folder_id: Option<FolderId>,
    ) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables
            .chains
            .values()
            .any(|row| row.name == name && row.parent_folder == parent_folder_id))
    }
}

#[async_trait]
impl ElementRepository for InMemoryCatalog {
    async fn find_element(&self, element_id: ElementId) -> Result<Option<ChainElement>> {
        let tables = self.tables.read().await;
        Ok(tables.elements.get(&element_id).map(|row| {
            let mut element = row.clone();
            for dependency in tables.dependencies.values() {
                if dependency.element_from == element_id {
                    element.output_dependencies.push(dependency.id);
                }
                if dependency.element_to == element_id {
                    element.input_dependencies.push(dependency.id);
                }
            }
            element
        }))
    }

    async fn save_element(&self, element: &ChainElement) -> Result<ChainElement> {
        let row = element_row(element);
        self.tables
            .write()
            .await
            .elements
            .insert(row.id, row.clone());
        let mut stored = row;
        stored.input_dependencies = element.input_dependencies.clone();
        stored.output_dependencies = element.output_dependencies.clone();
        Ok(stored)
    }

    async fn save_all_elements(&self, elements: &[ChainElement]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for element in elements {
            let row = element_row(element);
            tables.elements.insert(row.id, row);
        }
        Ok(())
    }

    async fn delete_all_elements(&self, element_ids: &[ElementId]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for element_id in element_ids {
            tables.elements.remove(element_id);
        }
        Ok(())
    }
}

#[async_trait]
impl DependencyRepository for InMemoryCatalog {
    async fn save_dependency(&self, dependency: &Dependency) -> Result<()> {
        self.tables
            .write()
            .await
            .dependencies
            .insert(dependency.id, dependency.clone());
        Ok(())
    }

    async fn delete_all_dependencies(&self, dependency_ids: &[DependencyId]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for dependency_id in dependency_ids {
            tables.dependencies.remove(dependency_id);
        }
        Ok(())
    }
}

#[async_trait]
impl FolderRepository for InMemoryCatalog {
    async fn find_folder(&self, folder_id: FolderId) -> Result<Option<Folder>> {
        Ok(self.tables.read().await.folders.get(&folder_id).cloned())
    }

    async fn find_folders_by_parent(
        &self,
        parent_folder_id: Option<FolderId>,
    ) -> Result<Vec<Folder>> {
        let tables = self.tables.read().await;
        Ok(tables
            .folders
            .values()
            .filter(|folder| folder.parent_folder == parent_folder_id)
            .cloned()
            .collect())
    }

    async fn save_folder(&self, folder: &Folder) -> Result<()> {
        self.tables
            .write()
            .await
            .folders
            .insert(folder.id, folder.clone());
        Ok(())
    }

    async fn delete_folder(&self, folder_id: FolderId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut children: HashMap<FolderId, Vec<FolderId>> = HashMap::new();
        for folder in tables.folders.values() {
            if let Some(parent) = folder.parent_folder {
                children.entry(parent).or_default().push(folder.id);
            }
        }
        let subtree: HashSet<FolderId> = walk_hierarchy(folder_id, |id| {
            children.get(&id).cloned().unwrap_or_default()
        })
        .into_iter()
        .collect();

        let chain_ids: Vec<ChainId> = tables
            .chains
            .values()
            .filter(|row| row.parent_folder.is_some_and(|id| subtree.contains(&id)))
            .map(|row| row.id)
            .collect();
        for chain_id in chain_ids {
            tables.remove_chain(chain_id);
        }
        tables.folders.retain(|id, _| !subtree.contains(id));
        Ok(())
    }
}

#[async_trait]
impl SpecificationGroupRepository for InMemoryCatalog {
    async fn find_specification_group(
        &self,
        group_id: SpecificationGroupId,
    ) -> Result<Option<SpecificationGroup>> {
        Ok(self
            .tables
            .read()
            .await
            .specification_groups
            .get(&group_id)
            .cloned())
    }

    async fn find_specification_groups_by_system(
        &self,
        system_id: &str,
    ) -> Result<Vec<SpecificationGroup>> {
        Ok(self
            .tables
            .read()
            .await
            .specification_groups
            .values()
            .filter(|group| group.system_id == system_id)
            .cloned()
            .collect())
    }

    async fn save_specification_group(&self, group: &SpecificationGroup) -> Result<()> {
        self.tables
            .write()
            .await
            .specification_groups
            .insert(group.id, group.clone());
        Ok(())
    }
}

#[async_trait]
impl SystemModelRepository for InMemoryCatalog {
    async fn find_system_model(&self, model_id: SystemModelId) -> Result<Option<SystemModel>> {
        Ok(self
            .tables
            .read()
            .await
            .system_models
            .get(&model_id)
            .cloned())
    }

    async fn save_system_model(&self, model: &SystemModel) -> Result<()> {
        self.tables
            .write()
            .await
            .system_models
            .insert(model.id, model.clone());
        Ok(())
    }
}

#[async_trait]
impl ImportInstructionRepository for InMemoryCatalog {
    async fn find_import_instruction(&self, id: &str) -> Result<Option<ImportInstruction>> {
        Ok(self.tables.read().await.import_instructions.get(id).cloned())
    }

    async fn find_import_instructions(&self, ids: &[String]) -> Result<Vec<ImportInstruction>> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.import_instructions.get(id))
            .cloned()
            .collect())
    }

    async fn find_import_instruction_by_overridden_by(
        &self,
        overridden_by: &str,
    ) -> Result<Option<ImportInstruction>> {
        Ok(self
            .tables
            .read()
            .await
            .import_instructions
            .values()
            .find(|instruction| instruction.overridden_by.as_deref() == Some(overridden_by))
            .cloned())
    }

    async fn list_import_instructions(&self) -> Result<Vec<ImportInstruction>> {
        Ok(self
            .tables
            .read()
            .await
            .import_instructions
            .values()
            .cloned()
            .collect())
    }

    async fn save_import_instruction(&self, instruction: &ImportInstruction) -> Result<()> {
        self.tables
            .write()
            .await
            .import_instructions
            .insert(instruction.id.clone(), instruction.clone());
        Ok(())
    }

    async fn delete_import_instructions(&self, ids: &[String]) -> Result<()> {
        let mut tables = self.tables.write().await;
        for id in ids {
            tables.import_instructions.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(chain_id: ChainId, name: &str) -> ChainElement {
        ChainElement::leaf(ElementId::generate(), chain_id, "script", name)
    }

    #[tokio::test]
    async fn chain_loads_with_rebuilt_adjacency() {
        let store = InMemoryCatalog::new();
        let chain = Chain::new("Orders", None);
        store.save_chain(&chain).await.expect("chain saved");
        let a = store
            .save_element(&element(chain.id, "A"))
            .await
            .expect("element saved");
        let b = store
            .save_element(&element(chain.id, "B"))
            .await
            .expect("element saved");
        let dependency = Dependency::of(a.id, b.id);
        store
            .save_dependency(&dependency)
            .await
            .expect("dependency saved");

        let loaded = store
            .find_chain(chain.id)
            .await
            .expect("lookup should work")
            .expect("chain should exist");

        assert_eq!(loaded.elements.len(), 2);
        assert_eq!(loaded.elements[&a.id].output_dependencies, vec![dependency.id]);
        assert_eq!(loaded.elements[&b.id].input_dependencies, vec![dependency.id]);
        crate::invariants::ensure_chain_invariants(&loaded).expect("loaded chain is consistent");
    }

    #[tokio::test]
    async fn save_assigns_equal_timestamps_when_both_cleared() {
        let store = InMemoryCatalog::new();
        let stored = store
            .save_element(&element(ChainId::generate(), "A"))
            .await
            .expect("element saved");
        assert!(stored.created_when.is_some());
        assert_eq!(stored.created_when, stored.modified_when);
    }

    #[tokio::test]
    async fn name_lookup_is_scoped_to_folder() {
        let store = InMemoryCatalog::new();
        let folder = Folder::new("Payments", None);
        store.save_folder(&folder).await.expect("folder saved");
        store
            .save_chain(&Chain::new("Refunds", Some(folder.id)))
            .await
            .expect("chain saved");

        assert!(
            store
                .exists_by_name_and_parent_folder_id("Refunds", Some(folder.id))
                .await
                .expect("lookup should work")
        );
        assert!(
            !store
                .exists_by_name_and_parent_folder_id("Refunds", None)
                .await
                .expect("lookup should work")
        );
    }

    #[tokio::test]
    async fn deleting_folder_removes_nested_content() {
        let store = InMemoryCatalog::new();
        let root = Folder::new("Root", None);
        let nested = Folder::new("Nested", Some(root.id));
        let sibling = Folder::new("Sibling", None);
        for folder in [&root, &nested, &sibling] {
            store.save_folder(folder).await.expect("folder saved");
        }
        let inner_chain = Chain::new("Inner", Some(nested.id));
        let outer_chain = Chain::new("Outer", Some(sibling.id));
        store.save_chain(&inner_chain).await.expect("chain saved");
        store.save_chain(&outer_chain).await.expect("chain saved");
        store
            .save_element(&element(inner_chain.id, "A"))
            .await
            .expect("element saved");

        store.delete_folder(root.id).await.expect("folder deleted");

        assert!(store.find_folder(nested.id).await.expect("lookup").is_none());
        assert!(store.find_chain(inner_chain.id).await.expect("lookup").is_none());
        assert!(store.find_chain(outer_chain.id).await.expect("lookup").is_some());
        assert_eq!(store.element_count().await, 0);
    }
}
