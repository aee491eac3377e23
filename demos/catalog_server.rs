use std::sync::Arc;

use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use designtime_catalog::api::{CatalogApp, HasCatalog};
use designtime_catalog::config::CatalogConfig;
use designtime_catalog::db::{PgCatalog, create_catalog_tables};
use designtime_catalog::deployments::{DeploymentCleanup, NoopDeploymentCleanup};
use designtime_catalog::descriptor::DescriptorRegistry;

#[derive(Clone)]
struct DemoApp {
    catalog: PgCatalog,
    registry: Arc<dyn DescriptorRegistry>,
    cleanup: Arc<dyn DeploymentCleanup>,
}

impl HasCatalog for DemoApp {
    fn catalog(&self) -> PgCatalog {
        self.catalog.clone()
    }
}

impl CatalogApp for DemoApp {
    fn registry(&self) -> Arc<dyn DescriptorRegistry> {
        Arc::clone(&self.registry)
    }

    fn deployment_cleanup(&self) -> Arc<dyn DeploymentCleanup> {
        Arc::clone(&self.cleanup)
    }
}

#[cfg(feature = "runtime-client")]
fn deployment_cleanup(config: &CatalogConfig) -> anyhow::Result<Arc<dyn DeploymentCleanup>> {
    use designtime_catalog::deployments::RuntimeCatalogClient;

    match &config.runtime_catalog_url {
        Some(url) => {
            let client = RuntimeCatalogClient::new(url, config.request_timeout)
                .map_err(|err| anyhow::anyhow!("{}", err))?;
            Ok(Arc::new(client))
        }
        None => Ok(Arc::new(NoopDeploymentCleanup)),
    }
}

#[cfg(not(feature = "runtime-client"))]
fn deployment_cleanup(config: &CatalogConfig) -> anyhow::Result<Arc<dyn DeploymentCleanup>> {
    if config.runtime_catalog_url.is_some() {
        tracing::warn!("RUNTIME_CATALOG_URL is set but the runtime-client feature is disabled");
    }
    Ok(Arc::new(NoopDeploymentCleanup))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = CatalogConfig::from_env()?;
    let database_url = config
        .require_database_url()
        .context("DATABASE_URL is required to run demos/catalog_server.rs")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to postgres")?;
    create_catalog_tables(&pool)
        .await
        .context("failed to run catalog migrations")?;

    let library = config.load_element_library()?;
    tracing::info!(element_types = library.len(), "loaded element library");

    let app_state = DemoApp {
        catalog: PgCatalog::new(pool),
        registry: Arc::new(library),
        cleanup: deployment_cleanup(&config)?,
    };

    let api_v1 = Router::new()
        .route("/healthz", get(health_handler))
        .merge(designtime_catalog::api::routes::<DemoApp>());
    let app = Router::new().nest("/api/v1", api_v1).with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.bind))?;

    tracing::info!(bind = %config.bind, "catalog server listening, api base path /api/v1");

    axum::serve(listener, app)
        .await
        .context("catalog server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
