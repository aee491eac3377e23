use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde_json::json;

use crate::action_log::{ActionLogger, DeferredActionLogger, TracingActionLogger};
use crate::db::{PgCatalog, PgUnitOfWork};
use crate::deployments::{DeploymentCleanup, NoopDeploymentCleanup};
use crate::descriptor::DescriptorRegistry;
use crate::error::{ErrorKind, LibError};
use crate::filter::ChainFilter;
use crate::instructions::{
    DeleteInstructionsRequest, ImportInstructionPayload, InstructionFilterRequest,
};
use crate::models::{
    ChainId, ChangeParentPayload, CreateChainPayload, CreateElementPayload, CreateFolderPayload,
    CreateSpecificationGroupPayload, ElementId, FolderId, GroupElementsPayload, MovePayload,
    SpecificationGroupId, SystemModelId, UpdateChainPayload,
};
use crate::operations::{CatalogOperations, CreateDependencyPayload};

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Connectivity => StatusCode::BAD_GATEWAY,
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        };

        tracing::error!(
            kind = ?self.0.kind,
            code = self.0.code,
            error = %self.0.source,
            "catalog api request failed"
        );
        (
            status,
            Json(json!({
                "error": {
                    "code": self.0.code,
                    "message": self.0.public
                }
            })),
        )
            .into_response()
    }
}

pub trait HasCatalog {
    fn catalog(&self) -> PgCatalog;
}

pub trait CatalogApp: HasCatalog {
    fn registry(&self) -> Arc<dyn DescriptorRegistry>;

    fn deployment_cleanup(&self) -> Arc<dyn DeploymentCleanup> {
        Arc::new(NoopDeploymentCleanup)
    }

    fn action_logger(&self) -> Arc<dyn ActionLogger> {
        Arc::new(TracingActionLogger)
    }
}

type RequestOperations = (CatalogOperations<PgUnitOfWork>, Arc<DeferredActionLogger>);

/// Operations bound to a fresh transaction. Handlers finish with [`commit`];
/// an early return rolls back and drops the buffered action log.
async fn operations<S: CatalogApp>(app: &S) -> Result<RequestOperations, AppError> {
    let unit = app.catalog().begin().await?;
    let actions = Arc::new(DeferredActionLogger::new(app.action_logger()));
    let ops = CatalogOperations::new(unit, app.registry())
        .with_cleanup(app.deployment_cleanup())
        .with_logger(actions.clone());
    Ok((ops, actions))
}

async fn commit(
    ops: CatalogOperations<PgUnitOfWork>,
    actions: Arc<DeferredActionLogger>,
) -> Result<(), AppError> {
    ops.into_store().commit().await?;
    actions.flush();
    Ok(())
}

async fn create_chain_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateChainPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let chain = ops.create_chain(payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn search_chains_handler<S>(
    State(app): State<S>,
    Json(filter): Json<ChainFilter>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let chains = ops.search_chains(filter).await?;
    Ok(Json(chains))
}

async fn get_chain_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let chain = ops.find_chain(chain_id).await?;
    Ok(Json(chain))
}

async fn update_chain_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
    Json(payload): Json<UpdateChainPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let chain = ops.update_chain(chain_id, payload).await?;
    commit(ops, actions).await?;
    Ok(Json(chain))
}

async fn delete_chain_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    ops.delete_chain(chain_id).await?;
    commit(ops, actions).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_chain_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
    Json(payload): Json<MovePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let chain = ops.move_chain(chain_id, payload.target_folder_id).await?;
    commit(ops, actions).await?;
    Ok(Json(chain))
}

async fn copy_chain_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
    Json(payload): Json<MovePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let chain = ops.copy_chain(chain_id, payload.target_folder_id).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn duplicate_chain_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let chain = ops.duplicate_chain(chain_id).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(chain)))
}

async fn link_override_handler<S>(
    State(app): State<S>,
    Path((chain_id, overridden_id)): Path<(ChainId, ChainId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let chain = ops.link_override(chain_id, overridden_id).await?;
    commit(ops, actions).await?;
    Ok(Json(chain))
}

async fn create_element_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
    Json(payload): Json<CreateElementPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let diff = ops.create_element(chain_id, payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(diff)))
}

async fn delete_element_handler<S>(
    State(app): State<S>,
    Path((chain_id, element_id)): Path<(ChainId, ElementId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let diff = ops.delete_element(chain_id, element_id).await?;
    commit(ops, actions).await?;
    Ok(Json(diff))
}

async fn change_parent_handler<S>(
    State(app): State<S>,
    Path((chain_id, element_id)): Path<(ChainId, ElementId)>,
    Json(payload): Json<ChangeParentPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let element = ops
        .change_element_parent(chain_id, element_id, payload.parent_element_id)
        .await?;
    commit(ops, actions).await?;
    Ok(Json(element))
}

async fn group_elements_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
    Json(payload): Json<GroupElementsPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let group = ops.group_elements(chain_id, payload.element_ids).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn ungroup_elements_handler<S>(
    State(app): State<S>,
    Path((chain_id, group_id)): Path<(ChainId, ElementId)>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let freed = ops.ungroup_elements(chain_id, group_id).await?;
    commit(ops, actions).await?;
    Ok(Json(freed))
}

async fn create_dependency_handler<S>(
    State(app): State<S>,
    Path(chain_id): Path<ChainId>,
    Json(payload): Json<CreateDependencyPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let diff = ops.create_dependency(chain_id, payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(diff)))
}

async fn create_folder_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateFolderPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let folder = ops.create_folder(payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(folder)))
}

async fn get_folder_handler<S>(
    State(app): State<S>,
    Path(folder_id): Path<FolderId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let folder = ops.find_folder(folder_id).await?;
    Ok(Json(folder))
}

async fn delete_folder_handler<S>(
    State(app): State<S>,
    Path(folder_id): Path<FolderId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    ops.delete_folder(folder_id).await?;
    commit(ops, actions).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_folder_handler<S>(
    State(app): State<S>,
    Path(folder_id): Path<FolderId>,
    Json(payload): Json<MovePayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let folder = ops.move_folder(folder_id, payload.target_folder_id).await?;
    commit(ops, actions).await?;
    Ok(Json(folder))
}

async fn nested_chains_handler<S>(
    State(app): State<S>,
    Path(folder_id): Path<FolderId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let chains = ops.find_nested_chains(folder_id).await?;
    Ok(Json(chains))
}

async fn navigation_path_handler<S>(
    State(app): State<S>,
    Path(folder_id): Path<FolderId>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let path = ops.navigation_path(folder_id).await?;
    Ok(Json(path))
}

async fn specification_group_labels_handler<S>(
    State(app): State<S>,
    Path(group_id): Path<SpecificationGroupId>,
    Json(labels): Json<Vec<String>>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let group = ops
        .update_specification_group_labels(group_id, labels)
        .await?;
    commit(ops, actions).await?;
    Ok(Json(group))
}

async fn system_model_labels_handler<S>(
    State(app): State<S>,
    Path(model_id): Path<SystemModelId>,
    Json(labels): Json<Vec<String>>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let model = ops.update_system_model_labels(model_id, labels).await?;
    commit(ops, actions).await?;
    Ok(Json(model))
}

async fn create_specification_group_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateSpecificationGroupPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let group = ops.create_specification_group(payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn create_unique_specification_group_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateSpecificationGroupPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let group = ops.create_unique_specification_group(payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn list_import_instructions_handler<S>(
    State(app): State<S>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let instructions = ops.list_import_instructions().await?;
    Ok(Json(instructions))
}

async fn filter_import_instructions_handler<S>(
    State(app): State<S>,
    Json(filters): Json<Vec<InstructionFilterRequest>>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let instructions = ops.filter_import_instructions(&filters).await?;
    Ok(Json(instructions))
}

async fn search_import_instructions_handler<S>(
    State(app): State<S>,
    Json(search_condition): Json<String>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, _) = operations(&app).await?;
    let instructions = ops.search_import_instructions(&search_condition).await?;
    Ok(Json(instructions))
}

async fn add_import_instruction_handler<S>(
    State(app): State<S>,
    Json(payload): Json<ImportInstructionPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let instruction = ops.add_import_instruction(payload).await?;
    commit(ops, actions).await?;
    Ok((StatusCode::CREATED, Json(instruction)))
}

async fn update_import_instruction_handler<S>(
    State(app): State<S>,
    Json(payload): Json<ImportInstructionPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let instruction = ops.update_import_instruction(payload).await?;
    commit(ops, actions).await?;
    Ok(Json(instruction))
}

async fn delete_import_instructions_handler<S>(
    State(app): State<S>,
    Json(request): Json<DeleteInstructionsRequest>,
) -> Result<impl IntoResponse, AppError>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    let (ops, actions) = operations(&app).await?;
    let deleted = ops.delete_import_instructions(request).await?;
    commit(ops, actions).await?;
    Ok(Json(deleted))
}

pub fn routes<S>() -> Router<S>
where
    S: CatalogApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /catalog/chains [POST]");
    tracing::info!("Registering route /catalog/chains/search [POST]");
    tracing::info!("Registering route /catalog/chains/{{chain_id}} [GET,PUT,DELETE]");
    tracing::info!("Registering route /catalog/chains/{{chain_id}}/elements [POST]");
    tracing::info!("Registering route /catalog/folders [POST]");
    tracing::info!("Registering route /catalog/folders/{{folder_id}} [GET,DELETE]");
    tracing::info!("Registering route /catalog/specification-groups [POST]");
    tracing::info!("Registering route /catalog/import-instructions [GET,POST,PATCH,DELETE]");

    Router::new()
        .route("/catalog/chains", post(create_chain_handler::<S>))
        .route("/catalog/chains/search", post(search_chains_handler::<S>))
        .route(
            "/catalog/chains/{chain_id}",
            get(get_chain_handler::<S>)
                .put(update_chain_handler::<S>)
                .delete(delete_chain_handler::<S>),
        )
        .route("/catalog/chains/{chain_id}/move", post(move_chain_handler::<S>))
        .route("/catalog/chains/{chain_id}/copy", post(copy_chain_handler::<S>))
        .route(
            "/catalog/chains/{chain_id}/duplicate",
            post(duplicate_chain_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/overrides/{overridden_id}",
            post(link_override_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/elements",
            post(create_element_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/elements/group",
            post(group_elements_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/elements/{element_id}",
            delete(delete_element_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/elements/{element_id}/parent",
            put(change_parent_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/elements/{element_id}/ungroup",
            post(ungroup_elements_handler::<S>),
        )
        .route(
            "/catalog/chains/{chain_id}/dependencies",
            post(create_dependency_handler::<S>),
        )
        .route("/catalog/folders", post(create_folder_handler::<S>))
        .route(
            "/catalog/folders/{folder_id}",
            get(get_folder_handler::<S>).delete(delete_folder_handler::<S>),
        )
        .route(
            "/catalog/folders/{folder_id}/move",
            post(move_folder_handler::<S>),
        )
        .route(
            "/catalog/folders/{folder_id}/chains",
            get(nested_chains_handler::<S>),
        )
        .route(
            "/catalog/folders/{folder_id}/path",
            get(navigation_path_handler::<S>),
        )
        .route(
            "/catalog/specification-groups",
            post(create_specification_group_handler::<S>),
        )
        .route(
            "/catalog/specification-groups/unique",
            post(create_unique_specification_group_handler::<S>),
        )
        .route(
            "/catalog/specification-groups/{group_id}/labels",
            put(specification_group_labels_handler::<S>),
        )
        .route(
            "/catalog/system-models/{model_id}/labels",
            put(system_model_labels_handler::<S>),
        )
        .route(
            "/catalog/import-instructions",
            get(list_import_instructions_handler::<S>)
                .post(add_import_instruction_handler::<S>)
                .patch(update_import_instruction_handler::<S>)
                .delete(delete_import_instructions_handler::<S>),
        )
        .route(
            "/catalog/import-instructions/search",
            post(search_import_instructions_handler::<S>),
        )
        .route(
            "/catalog/import-instructions/filter",
            post(filter_import_instructions_handler::<S>),
        )
}
