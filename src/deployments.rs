use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;
use crate::models::ChainId;

#[async_trait]
pub trait DeploymentCleanup: Send + Sync {
    /// Removes every runtime deployment of `chain_id`. Failures surface as
    /// `ErrorKind::Connectivity` and abort the surrounding delete.
    async fn delete_all_by_chain_id(&self, chain_id: ChainId) -> Result<()>;
}

/// Used when no runtime catalog is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDeploymentCleanup;

#[async_trait]
impl DeploymentCleanup for NoopDeploymentCleanup {
    async fn delete_all_by_chain_id(&self, chain_id: ChainId) -> Result<()> {
        debug!(chain_id = %chain_id, "no runtime catalog configured, skipping deployment cleanup");
        Ok(())
    }
}

#[cfg(feature = "runtime-client")]
pub use client::RuntimeCatalogClient;

#[cfg(feature = "runtime-client")]
mod client {
    use std::time::Duration;

    use anyhow::anyhow;
    use async_trait::async_trait;
    use tracing::{info, warn};

    use super::DeploymentCleanup;
    use crate::error::{LibError, Result};
    use crate::models::ChainId;

    /// HTTP client for the runtime catalog's deployment endpoints.
    #[derive(Debug, Clone)]
    pub struct RuntimeCatalogClient {
        http: reqwest::Client,
        base_url: String,
    }

    impl RuntimeCatalogClient {
        pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
            let http = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| {
                    LibError::connectivity("Failed to build runtime catalog client", anyhow!(err))
                })?;
            Ok(Self {
                http,
                base_url: base_url.trim_end_matches('/').to_string(),
            })
        }

        pub fn deployments_url(&self, chain_id: ChainId) -> String {
            format!("{}/v1/catalog/chains/{}/deployments", self.base_url, chain_id)
        }
    }

    #[async_trait]
    impl DeploymentCleanup for RuntimeCatalogClient {
        async fn delete_all_by_chain_id(&self, chain_id: ChainId) -> Result<()> {
            let url = self.deployments_url(chain_id);
            let response = self.http.delete(&url).send().await.map_err(|err| {
                warn!(chain_id = %chain_id, error = %err, "runtime catalog unreachable");
                LibError::connectivity(
                    "Failed to delete chain deployments in runtime catalog",
                    anyhow!(err),
                )
            })?;

            let status = response.status();
            if !status.is_success() {
                return Err(LibError::connectivity(
                    "Failed to delete chain deployments in runtime catalog",
                    anyhow!("DELETE {} returned {}", url, status),
                ));
            }

            info!(chain_id = %chain_id, "deleted runtime deployments");
            Ok(())
        }
    }

}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_cleanup_always_succeeds() {
        NoopDeploymentCleanup
            .delete_all_by_chain_id(ChainId::generate())
            .await
            .expect("noop cleanup should succeed");
    }
}
