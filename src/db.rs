use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::instructions::ImportInstruction;
use crate::labels::{ChainLabel, SpecificationGroupLabel, SystemModelLabel};
use crate::models::{
    Chain, ChainElement, ChainId, Dependency, DependencyId, ElementBody, ElementId, Folder,
    FolderId, SpecificationGroup, SpecificationGroupId, SystemModel, SystemModelId,
};
use crate::repository::{
    ChainRepository, DependencyRepository, ElementRepository, FolderRepository,
    ImportInstructionRepository, SpecificationGroupRepository, SystemModelRepository,
};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_catalog_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct ChainRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    parent_folder_id: Option<Uuid>,
    overrides_chain_id: Option<Uuid>,
    overridden_by_chain_id: Option<Uuid>,
    current_snapshot_id: Option<Uuid>,
    snapshots: Vec<Uuid>,
    deployments: Vec<Uuid>,
    created_at: chrono::NaiveDateTime,
    updated_at: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct LabelRow {
    name: String,
    technical: bool,
}

#[derive(Debug, Clone, FromRow)]
struct ElementRow {
    id: Uuid,
    chain_id: Uuid,
    element_type: String,
    name: String,
    description: Option<String>,
    properties: Value,
    parent_element_id: Option<Uuid>,
    is_container: bool,
    children: Value,
    created_when: chrono::NaiveDateTime,
    modified_when: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct DependencyRow {
    id: Uuid,
    element_from: Uuid,
    element_to: Uuid,
}

#[derive(Debug, Clone, FromRow)]
struct FolderRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    parent_folder_id: Option<Uuid>,
    created_at: chrono::NaiveDateTime,
    updated_at: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct SpecificationGroupRow {
    id: Uuid,
    name: String,
    system_id: String,
    description: Option<String>,
    url: Option<String>,
    synchronization: bool,
}

#[derive(Debug, Clone, FromRow)]
struct ImportInstructionRow {
    id: String,
    entity_type: String,
    action: String,
    overridden_by: Option<String>,
    modified_when: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, FromRow)]
struct SystemModelRow {
    id: Uuid,
    name: String,
    specification_group_id: Uuid,
}

impl From<FolderRow> for Folder {
    fn from(value: FolderRow) -> Self {
        Self {
            id: FolderId(value.id),
            name: value.name,
            description: value.description,
            parent_folder: value.parent_folder_id.map(FolderId),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

impl TryFrom<ImportInstructionRow> for ImportInstruction {
    type Error = LibError;

    fn try_from(value: ImportInstructionRow) -> Result<Self> {
        Ok(Self {
            id: value.id,
            entity_type: value.entity_type.parse()?,
            action: value.action.parse()?,
            overridden_by: value.overridden_by,
            modified_when: value.modified_when,
        })
    }
}

impl From<DependencyRow> for Dependency {
    fn from(value: DependencyRow) -> Self {
        Self {
            id: DependencyId(value.id),
            element_from: ElementId(value.element_from),
            element_to: ElementId(value.element_to),
        }
    }
}

impl TryFrom<ElementRow> for ChainElement {
    type Error = LibError;

    fn try_from(value: ElementRow) -> Result<Self> {
        let body = if value.is_container {
            let children: Vec<ElementId> = serde_json::from_value(value.children)
                .map_err(|err| {
                    LibError::database("Failed to decode element children", anyhow!(err))
                })?;
            ElementBody::Container { children }
        } else {
            ElementBody::Leaf
        };
        let properties = match value.properties {
            Value::Object(properties) => properties,
            _ => Map::new(),
        };
        Ok(Self {
            id: ElementId(value.id),
            chain_id: ChainId(value.chain_id),
            element_type: value.element_type,
            name: value.name,
            description: value.description,
            properties,
            parent: value.parent_element_id.map(ElementId),
            input_dependencies: Vec::new(),
            output_dependencies: Vec::new(),
            created_when: Some(value.created_when),
            modified_when: Some(value.modified_when),
            body,
        })
    }
}

fn hydrate_chain(
    row: ChainRow,
    labels: Vec<LabelRow>,
    elements: Vec<ElementRow>,
    dependencies: Vec<DependencyRow>,
) -> Result<Chain> {
    let chain_id = ChainId(row.id);
    let mut chain = Chain {
        id: chain_id,
        name: row.name,
        description: row.description,
        parent_folder: row.parent_folder_id.map(FolderId),
        labels: labels
            .into_iter()
            .map(|label| ChainLabel {
                name: label.name,
                technical: label.technical,
                chain_id,
            })
            .collect(),
        elements: Default::default(),
        dependencies: Default::default(),
        overrides_chain: row.overrides_chain_id.map(ChainId),
        overridden_by_chain: row.overridden_by_chain_id.map(ChainId),
        current_snapshot: row.current_snapshot_id,
        snapshots: row.snapshots,
        deployments: row.deployments,
        created_at: row.created_at,
        updated_at: row.updated_at,
    };
    for element in elements {
        let element = ChainElement::try_from(element)?;
        chain.elements.insert(element.id, element);
    }
    for dependency in dependencies {
        chain.connect(dependency.into())?;
    }
    Ok(chain)
}

fn hydrate_specification_group(
    row: SpecificationGroupRow,
    labels: Vec<LabelRow>,
) -> SpecificationGroup {
    let group_id = SpecificationGroupId(row.id);
    SpecificationGroup {
        id: group_id,
        name: row.name,
        system_id: row.system_id,
        description: row.description,
        url: row.url,
        synchronization: row.synchronization,
        labels: labels
            .into_iter()
            .map(|label| SpecificationGroupLabel {
                name: label.name,
                technical: label.technical,
                specification_group_id: group_id,
            })
            .collect(),
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

fn children_json(element: &ChainElement) -> Result<Value> {
    serde_json::to_value(element.children())
        .map_err(|err| LibError::database("Failed to encode element children", anyhow!(err)))
}

/// Connection pool for the catalog schema. Repository access goes through a
/// [`PgUnitOfWork`] started with [`PgCatalog::begin`].
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<PgUnitOfWork> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        Ok(PgUnitOfWork {
            tx: Mutex::new(Some(tx)),
        })
    }
}

/// One transaction shared by every repository call made through it. Dropping
/// it without [`PgUnitOfWork::commit`] rolls everything back.
pub struct PgUnitOfWork {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgUnitOfWork {
    pub async fn commit(self) -> Result<()> {
        let Some(tx) = self.tx.into_inner() else {
            return Err(closed());
        };
        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))
    }
}

fn closed() -> LibError {
    LibError::database(
        "Transaction is no longer active",
        anyhow!("unit of work used after commit"),
    )
}

fn active<'a>(
    slot: &'a mut Option<Transaction<'static, Postgres>>,
) -> Result<&'a mut Transaction<'static, Postgres>> {
    slot.as_mut().ok_or_else(closed)
}

async fn load_chain(
    tx: &mut Transaction<'static, Postgres>,
    chain_id: ChainId,
) -> Result<Option<Chain>> {
    let row = sqlx::query_as::<_, ChainRow>(
        r#"
        SELECT
            id,
            name,
            description,
            parent_folder_id,
            overrides_chain_id,
            overridden_by_chain_id,
            current_snapshot_id,
            snapshots,
            deployments,
            created_at,
            updated_at
        FROM catalog.chains
        WHERE id = $1
        "#,
    )
    .bind(chain_id.0)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query chain", err))?;

    let Some(row) = row else {
        return Ok(None);
    };

    let labels = sqlx::query_as::<_, LabelRow>(
        r#"
        SELECT name, technical
        FROM catalog.chain_labels
        WHERE chain_id = $1
        ORDER BY technical DESC, name ASC
        "#,
    )
    .bind(chain_id.0)
    .fetch_all(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query chain labels", err))?;

    let elements = sqlx::query_as::<_, ElementRow>(
        r#"
        SELECT
            id,
            chain_id,
            element_type,
            name,
            description,
            properties,
            parent_element_id,
            is_container,
            children,
            created_when,
            modified_when
        FROM catalog.elements
        WHERE chain_id = $1
        ORDER BY id ASC
        "#,
    )
    .bind(chain_id.0)
    .fetch_all(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query chain elements", err))?;

    let dependencies = sqlx::query_as::<_, DependencyRow>(
        r#"
        SELECT d.id, d.element_from, d.element_to
        FROM catalog.dependencies d
        JOIN catalog.elements e ON e.id = d.element_from
        WHERE e.chain_id = $1
        ORDER BY d.id ASC
        "#,
    )
    .bind(chain_id.0)
    .fetch_all(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to query chain dependencies", err))?;

    hydrate_chain(row, labels, elements, dependencies).map(Some)
}

async fn load_chains(
    tx: &mut Transaction<'static, Postgres>,
    chain_ids: Vec<Uuid>,
) -> Result<Vec<Chain>> {
    let mut chains = Vec::with_capacity(chain_ids.len());
    for chain_id in chain_ids {
        if let Some(chain) = load_chain(tx, ChainId(chain_id)).await? {
            chains.push(chain);
        }
    }
    Ok(chains)
}

async fn write_element(
    tx: &mut Transaction<'static, Postgres>,
    element: &ChainElement,
) -> Result<ChainElement> {
    let (created_when, modified_when) = element.stored_timestamps();
    sqlx::query(
        r#"
        INSERT INTO catalog.elements (
            id,
            chain_id,
            element_type,
            name,
            description,
            properties,
            parent_element_id,
            is_container,
            children,
            created_when,
            modified_when
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE
        SET element_type = EXCLUDED.element_type,
            name = EXCLUDED.name,
            description = EXCLUDED.description,
            properties = EXCLUDED.properties,
            parent_element_id = EXCLUDED.parent_element_id,
            is_container = EXCLUDED.is_container,
            children = EXCLUDED.children,
            created_when = EXCLUDED.created_when,
            modified_when = EXCLUDED.modified_when
        "#,
    )
    .bind(element.id.0)
    .bind(element.chain_id.0)
    .bind(&element.element_type)
    .bind(&element.name)
    .bind(&element.description)
    .bind(Value::Object(element.properties.clone()))
    .bind(element.parent.map(|id| id.0))
    .bind(element.is_container())
    .bind(children_json(element)?)
    .bind(created_when)
    .bind(modified_when)
    .execute(&mut **tx)
    .await
    .map_err(|err| db_err("Failed to write element", err))?;

    let mut stored = element.clone();
    stored.created_when = Some(created_when);
    stored.modified_when = Some(modified_when);
    Ok(stored)
}

async fn replace_labels(
    tx: &mut Transaction<'static, Postgres>,
    table: &'static str,
    owner_column: &'static str,
    owner_id: Uuid,
    labels: impl Iterator<Item = (&str, bool)>,
) -> Result<()> {
    let delete = format!("DELETE FROM catalog.{table} WHERE {owner_column} = $1");
    sqlx::query(&delete)
        .bind(owner_id)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to clear labels", err))?;

    let insert = format!(
        "INSERT INTO catalog.{table} ({owner_column}, name, technical) \
         VALUES ($1, $2, $3) ON CONFLICT DO NOTHING"
    );
    for (name, technical) in labels {
        sqlx::query(&insert)
            .bind(owner_id)
            .bind(name)
            .bind(technical)
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to write labels", err))?;
    }
    Ok(())
}

async fn load_labels(
    tx: &mut Transaction<'static, Postgres>,
    table: &'static str,
    owner_column: &'static str,
    owner_id: Uuid,
) -> Result<Vec<LabelRow>> {
    let select = format!(
        "SELECT name, technical FROM catalog.{table} \
         WHERE {owner_column} = $1 ORDER BY technical DESC, name ASC"
    );
    sqlx::query_as::<_, LabelRow>(&select)
        .bind(owner_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query labels", err))
}

#[async_trait]
impl ChainRepository for PgUnitOfWork {
    async fn find_chain(&self, chain_id: ChainId) -> Result<Option<Chain>> {
        let mut guard = self.tx.lock().await;
        load_chain(active(&mut guard)?, chain_id).await
    }

    async fn find_all_chains(&self, chain_ids: &[ChainId]) -> Result<Vec<Chain>> {
        let mut guard = self.tx.lock().await;
        let ids = chain_ids.iter().map(|id| id.0).collect();
        load_chains(active(&mut guard)?, ids).await
    }

    async fn find_chains_by_folder(&self, folder_id: Option<FolderId>) -> Result<Vec<Chain>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM catalog.chains
            WHERE parent_folder_id IS NOT DISTINCT FROM $1
            ORDER BY name ASC, id ASC
            "#,
        )
        .bind(folder_id.map(|id| id.0))
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query folder chains", err))?;
        load_chains(tx, ids.into_iter().map(|(id,)| id).collect()).await
    }

    async fn list_chains(&self) -> Result<Vec<Chain>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT id
            FROM catalog.chains
            ORDER BY name ASC, id ASC
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to list chains", err))?;
        load_chains(tx, ids.into_iter().map(|(id,)| id).collect()).await
    }

    async fn save_chain(&self, chain: &Chain) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO catalog.chains (
                id,
                name,
                description,
                parent_folder_id,
                overrides_chain_id,
                overridden_by_chain_id,
                current_snapshot_id,
                snapshots,
                deployments,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                description = EXCLUDED.description,
                parent_folder_id = EXCLUDED.parent_folder_id,
                overrides_chain_id = EXCLUDED.overrides_chain_id,
                overridden_by_chain_id = EXCLUDED.overridden_by_chain_id,
                current_snapshot_id = EXCLUDED.current_snapshot_id,
                snapshots = EXCLUDED.snapshots,
                deployments = EXCLUDED.deployments,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(chain.id.0)
        .bind(&chain.name)
        .bind(&chain.description)
        .bind(chain.parent_folder.map(|id| id.0))
        .bind(chain.overrides_chain.map(|id| id.0))
        .bind(chain.overridden_by_chain.map(|id| id.0))
        .bind(chain.current_snapshot)
        .bind(&chain.snapshots)
        .bind(&chain.deployments)
        .bind(chain.created_at)
        .bind(chain.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to save chain", err))?;

        replace_labels(
            tx,
            "chain_labels",
            "chain_id",
            chain.id.0,
            chain
                .labels
                .iter()
                .map(|label| (label.name.as_str(), label.technical)),
        )
        .await?;
        debug!(chain_id = %chain.id, "saved chain");
        Ok(())
    }

    async fn delete_chain(&self, chain_id: ChainId) -> Result<()> {
        let mut guard = self.tx.lock().await;
        sqlx::query("DELETE FROM catalog.chains WHERE id = $1")
            .bind(chain_id.0)
            .execute(&mut **active(&mut guard)?)
            .await
            .map_err(|err| db_err("Failed to delete chain", err))?;
        Ok(())
    }

    async fn exists_by_name_and_parent_folder_id(
        &self,
        name: &str,
        parent_folder_id: Option<FolderId>,
    ) -> Result<bool> {
        let mut guard = self.tx.lock().await;
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM catalog.chains
                WHERE name = $1
                  AND parent_folder_id IS NOT DISTINCT FROM $2
            )
            "#,
        )
        .bind(name)
        .bind(parent_folder_id.map(|id| id.0))
        .fetch_one(&mut **active(&mut guard)?)
        .await
        .map_err(|err| db_err("Failed to query chain name", err))?;
        Ok(exists.0)
    }
}

#[async_trait]
impl ElementRepository for PgUnitOfWork {
    async fn find_element(&self, element_id: ElementId) -> Result<Option<ChainElement>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query_as::<_, ElementRow>(
            r#"
            SELECT
                id,
                chain_id,
                element_type,
                name,
                description,
                properties,
                parent_element_id,
                is_container,
                children,
                created_when,
                modified_when
            FROM catalog.elements
            WHERE id = $1
            "#,
        )
        .bind(element_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query element", err))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut element = ChainElement::try_from(row)?;

        let dependencies = sqlx::query_as::<_, DependencyRow>(
            r#"
            SELECT id, element_from, element_to
            FROM catalog.dependencies
            WHERE element_from = $1 OR element_to = $1
            ORDER BY id ASC
            "#,
        )
        .bind(element_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query element dependencies", err))?;
        for dependency in dependencies {
            if dependency.element_from == element_id.0 {
                element.output_dependencies.push(DependencyId(dependency.id));
            }
            if dependency.element_to == element_id.0 {
                element.input_dependencies.push(DependencyId(dependency.id));
            }
        }
        Ok(Some(element))
    }

    async fn save_element(&self, element: &ChainElement) -> Result<ChainElement> {
        let mut guard = self.tx.lock().await;
        write_element(active(&mut guard)?, element).await
    }

    async fn save_all_elements(&self, elements: &[ChainElement]) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        for element in elements {
            write_element(tx, element).await?;
        }
        Ok(())
    }

    async fn delete_all_elements(&self, element_ids: &[ElementId]) -> Result<()> {
        if element_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = element_ids.iter().map(|id| id.0).collect();
        let mut guard = self.tx.lock().await;
        sqlx::query("DELETE FROM catalog.elements WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut **active(&mut guard)?)
            .await
            .map_err(|err| db_err("Failed to delete elements", err))?;
        Ok(())
    }
}

#[async_trait]
impl DependencyRepository for PgUnitOfWork {
    async fn save_dependency(&self, dependency: &Dependency) -> Result<()> {
        let mut guard = self.tx.lock().await;
        sqlx::query(
            r#"
            INSERT INTO catalog.dependencies (id, element_from, element_to)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(dependency.id.0)
        .bind(dependency.element_from.0)
        .bind(dependency.element_to.0)
        .execute(&mut **active(&mut guard)?)
        .await
        .map_err(|err| db_err("Failed to save dependency", err))?;
        Ok(())
    }

    async fn delete_all_dependencies(&self, dependency_ids: &[DependencyId]) -> Result<()> {
        if dependency_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = dependency_ids.iter().map(|id| id.0).collect();
        let mut guard = self.tx.lock().await;
        sqlx::query("DELETE FROM catalog.dependencies WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut **active(&mut guard)?)
            .await
            .map_err(|err| db_err("Failed to delete dependencies", err))?;
        Ok(())
    }
}

#[async_trait]
impl FolderRepository for PgUnitOfWork {
    async fn find_folder(&self, folder_id: FolderId) -> Result<Option<Folder>> {
        let mut guard = self.tx.lock().await;
        let row = sqlx::query_as::<_, FolderRow>(
            r#"
            SELECT id, name, description, parent_folder_id, created_at, updated_at
            FROM catalog.folders
            WHERE id = $1
            "#,
        )
        .bind(folder_id.0)
        .fetch_optional(&mut **active(&mut guard)?)
        .await
        .map_err(|err| db_err("Failed to query folder", err))?;
        Ok(row.map(Folder::from))
    }

    async fn find_folders_by_parent(
        &self,
        parent_folder_id: Option<FolderId>,
    ) -> Result<Vec<Folder>> {
        let mut guard = self.tx.lock().await;
        let rows = sqlx::query_as::<_, FolderRow>(
            r#"
            SELECT id, name, description, parent_folder_id, created_at, updated_at
            FROM catalog.folders
            WHERE parent_folder_id IS NOT DISTINCT FROM $1
            ORDER BY name ASC, id ASC
            "#,
        )
        .bind(parent_folder_id.map(|id| id.0))
        .fetch_all(&mut **active(&mut guard)?)
        .await
        .map_err(|err| db_err("Failed to query subfolders", err))?;
        Ok(rows.into_iter().map(Folder::from).collect())
    }

    async fn save_folder(&self, folder: &Folder) -> Result<()> {
        let mut guard = self.tx.lock().await;
        sqlx::query(
            r#"
            INSERT INTO catalog.folders (
                id,
                name,
                description,
                parent_folder_id,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                description = EXCLUDED.description,
                parent_folder_id = EXCLUDED.parent_folder_id,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(folder.id.0)
        .bind(&folder.name)
        .bind(&folder.description)
        .bind(folder.parent_folder.map(|id| id.0))
        .bind(folder.created_at)
        .bind(folder.updated_at)
        .execute(&mut **active(&mut guard)?)
        .await
        .map_err(|err| db_err("Failed to save folder", err))?;
        Ok(())
    }

    async fn delete_folder(&self, folder_id: FolderId) -> Result<()> {
        let mut guard = self.tx.lock().await;
        sqlx::query("DELETE FROM catalog.folders WHERE id = $1")
            .bind(folder_id.0)
            .execute(&mut **active(&mut guard)?)
            .await
            .map_err(|err| db_err("Failed to delete folder", err))?;
        Ok(())
    }
}

#[async_trait]
impl SpecificationGroupRepository for PgUnitOfWork {
    async fn find_specification_group(
        &self,
        group_id: SpecificationGroupId,
    ) -> Result<Option<SpecificationGroup>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query_as::<_, SpecificationGroupRow>(
            r#"
            SELECT id, name, system_id, description, url, synchronization
            FROM catalog.specification_groups
            WHERE id = $1
            "#,
        )
        .bind(group_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query specification group", err))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let labels = load_labels(
            tx,
            "specification_group_labels",
            "specification_group_id",
            row.id,
        )
        .await?;
        Ok(Some(hydrate_specification_group(row, labels)))
    }

    async fn find_specification_groups_by_system(
        &self,
        system_id: &str,
    ) -> Result<Vec<SpecificationGroup>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let rows = sqlx::query_as::<_, SpecificationGroupRow>(
            r#"
            SELECT id, name, system_id, description, url, synchronization
            FROM catalog.specification_groups
            WHERE system_id = $1
            ORDER BY name
            "#,
        )
        .bind(system_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query specification groups", err))?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            let labels = load_labels(
                tx,
                "specification_group_labels",
                "specification_group_id",
                row.id,
            )
            .await?;
            groups.push(hydrate_specification_group(row, labels));
        }
        Ok(groups)
    }

    async fn save_specification_group(&self, group: &SpecificationGroup) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO catalog.specification_groups
                (id, name, system_id, description, url, synchronization)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                system_id = EXCLUDED.system_id,
                description = EXCLUDED.description,
                url = EXCLUDED.url,
                synchronization = EXCLUDED.synchronization
            "#,
        )
        .bind(group.id.0)
        .bind(&group.name)
        .bind(&group.system_id)
        .bind(&group.description)
        .bind(&group.url)
        .bind(group.synchronization)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to save specification group", err))?;

        replace_labels(
            tx,
            "specification_group_labels",
            "specification_group_id",
            group.id.0,
            group
                .labels
                .iter()
                .map(|label| (label.name.as_str(), label.technical)),
        )
        .await
    }
}

#[async_trait]
impl SystemModelRepository for PgUnitOfWork {
    async fn find_system_model(&self, model_id: SystemModelId) -> Result<Option<SystemModel>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query_as::<_, SystemModelRow>(
            r#"
            SELECT id, name, specification_group_id
            FROM catalog.system_models
            WHERE id = $1
            "#,
        )
        .bind(model_id.0)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query system model", err))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let labels = load_labels(tx, "system_model_labels", "system_model_id", row.id).await?;
        Ok(Some(SystemModel {
            id: model_id,
            name: row.name,
            specification_group_id: SpecificationGroupId(row.specification_group_id),
            labels: labels
                .into_iter()
                .map(|label| SystemModelLabel {
                    name: label.name,
                    technical: label.technical,
                    system_model_id: model_id,
                })
                .collect(),
        }))
    }

    async fn save_system_model(&self, model: &SystemModel) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query(
            r#"
            INSERT INTO catalog.system_models (id, name, specification_group_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                specification_group_id = EXCLUDED.specification_group_id
            "#,
        )
        .bind(model.id.0)
        .bind(&model.name)
        .bind(model.specification_group_id.0)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to save system model", err))?;

        replace_labels(
            tx,
            "system_model_labels",
            "system_model_id",
            model.id.0,
            model
                .labels
                .iter()
                .map(|label| (label.name.as_str(), label.technical)),
        )
        .await
    }
}

#[async_trait]
impl ImportInstructionRepository for PgUnitOfWork {
    async fn find_import_instruction(&self, id: &str) -> Result<Option<ImportInstruction>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query_as::<_, ImportInstructionRow>(
            r#"
            SELECT id, entity_type, action, overridden_by, modified_when
            FROM catalog.import_instructions
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query import instruction", err))?;
        row.map(ImportInstruction::try_from).transpose()
    }

    async fn find_import_instructions(&self, ids: &[String]) -> Result<Vec<ImportInstruction>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let rows = sqlx::query_as::<_, ImportInstructionRow>(
            r#"
            SELECT id, entity_type, action, overridden_by, modified_when
            FROM catalog.import_instructions
            WHERE id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(ids)
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query import instructions", err))?;
        rows.into_iter().map(ImportInstruction::try_from).collect()
    }

    async fn find_import_instruction_by_overridden_by(
        &self,
        overridden_by: &str,
    ) -> Result<Option<ImportInstruction>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query_as::<_, ImportInstructionRow>(
            r#"
            SELECT id, entity_type, action, overridden_by, modified_when
            FROM catalog.import_instructions
            WHERE overridden_by = $1
            "#,
        )
        .bind(overridden_by)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to query import instruction", err))?;
        row.map(ImportInstruction::try_from).transpose()
    }

    async fn list_import_instructions(&self) -> Result<Vec<ImportInstruction>> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let rows = sqlx::query_as::<_, ImportInstructionRow>(
            r#"
            SELECT id, entity_type, action, overridden_by, modified_when
            FROM catalog.import_instructions
            ORDER BY id
            "#,
        )
        .fetch_all(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to list import instructions", err))?;
        rows.into_iter().map(ImportInstruction::try_from).collect()
    }

    async fn save_import_instruction(&self, instruction: &ImportInstruction) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        debug!(instruction_id = %instruction.id, "saving import instruction");
        sqlx::query(
            r#"
            INSERT INTO catalog.import_instructions
                (id, entity_type, action, overridden_by, modified_when)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET entity_type = EXCLUDED.entity_type,
                action = EXCLUDED.action,
                overridden_by = EXCLUDED.overridden_by,
                modified_when = EXCLUDED.modified_when
            "#,
        )
        .bind(&instruction.id)
        .bind(instruction.entity_type.as_str())
        .bind(instruction.action.as_str())
        .bind(&instruction.overridden_by)
        .bind(instruction.modified_when)
        .execute(&mut **tx)
        .await
        .map_err(|err| db_err("Failed to save import instruction", err))?;
        Ok(())
    }

    async fn delete_import_instructions(&self, ids: &[String]) -> Result<()> {
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query("DELETE FROM catalog.import_instructions WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to delete import instructions", err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::*;
    use crate::instructions::{ImportEntityType, ImportInstructionAction};

    fn timestamp() -> chrono::NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 1, 1)
            .expect("valid date")
            .and_hms_opt(0, 0, 0)
            .expect("valid datetime")
    }

    fn element_row(chain_id: Uuid, is_container: bool, children: Value) -> ElementRow {
        ElementRow {
            id: Uuid::new_v4(),
            chain_id,
            element_type: "switch".to_string(),
            name: "Switch".to_string(),
            description: None,
            properties: json!({"expression": "true"}),
            parent_element_id: None,
            is_container,
            children,
            created_when: timestamp(),
            modified_when: timestamp(),
        }
    }

    #[test]
    fn element_row_decodes_container_children() {
        let chain_id = Uuid::new_v4();
        let child = Uuid::new_v4();
        let element = ChainElement::try_from(element_row(chain_id, true, json!([child])))
            .expect("row should decode");

        assert_eq!(element.children(), &[ElementId(child)]);
        assert_eq!(element.property("expression"), Some(&json!("true")));
        assert_eq!(element.created_when, Some(timestamp()));
    }

    #[test]
    fn element_row_rejects_malformed_children() {
        let err = ChainElement::try_from(element_row(Uuid::new_v4(), true, json!({"bad": 1})))
            .expect_err("malformed children should fail");
        assert_eq!(err.code, "database_error");
    }

    #[test]
    fn hydrate_chain_rebuilds_adjacency() {
        let chain_id = Uuid::new_v4();
        let from = element_row(chain_id, false, json!([]));
        let to = element_row(chain_id, false, json!([]));
        let dependency = DependencyRow {
            id: Uuid::new_v4(),
            element_from: from.id,
            element_to: to.id,
        };
        let (from_id, to_id) = (from.id, to.id);

        let chain = hydrate_chain(
            ChainRow {
                id: chain_id,
                name: "Orders".to_string(),
                description: None,
                parent_folder_id: None,
                overrides_chain_id: None,
                overridden_by_chain_id: None,
                current_snapshot_id: None,
                snapshots: Vec::new(),
                deployments: Vec::new(),
                created_at: timestamp(),
                updated_at: timestamp(),
            },
            vec![LabelRow {
                name: "billing".to_string(),
                technical: false,
            }],
            vec![from, to],
            vec![dependency],
        )
        .expect("chain should hydrate");

        assert_eq!(chain.labels.len(), 1);
        assert_eq!(chain.elements[&ElementId(from_id)].output_dependencies.len(), 1);
        assert_eq!(chain.elements[&ElementId(to_id)].input_dependencies.len(), 1);
    }

    #[test]
    fn import_instruction_row_decodes_stored_enums() {
        let instruction = ImportInstruction::try_from(ImportInstructionRow {
            id: "chain-a".to_string(),
            entity_type: "CHAIN".to_string(),
            action: "OVERRIDE".to_string(),
            overridden_by: Some("chain-b".to_string()),
            modified_when: timestamp(),
        })
        .expect("row should decode");

        assert_eq!(instruction.entity_type, ImportEntityType::Chain);
        assert_eq!(instruction.action, ImportInstructionAction::Override);
        assert_eq!(instruction.overridden_by.as_deref(), Some("chain-b"));
    }

    #[test]
    fn import_instruction_row_rejects_unknown_action() {
        let err = ImportInstruction::try_from(ImportInstructionRow {
            id: "svc".to_string(),
            entity_type: "SERVICE".to_string(),
            action: "RENAME".to_string(),
            overridden_by: None,
            modified_when: timestamp(),
        })
        .expect_err("unknown action should fail");
        assert_eq!(err.code, "invalid_input");
    }

    #[test]
    fn specification_group_row_keeps_metadata() {
        let row = SpecificationGroupRow {
            id: Uuid::new_v4(),
            name: "Payments API".to_string(),
            system_id: "payments".to_string(),
            description: Some("v2".to_string()),
            url: None,
            synchronization: true,
        };
        let group = hydrate_specification_group(
            row,
            vec![LabelRow {
                name: "internal".to_string(),
                technical: true,
            }],
        );

        assert_eq!(group.description.as_deref(), Some("v2"));
        assert!(group.synchronization);
        assert_eq!(group.labels[0].specification_group_id, group.id);
    }
}
