use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow};

use crate::descriptor::ElementLibrary;

pub const DEFAULT_BIND: &str = "127.0.0.1:4020";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogConfig {
    pub database_url: Option<String>,
    pub bind: SocketAddr,
    pub db_max_connections: u32,
    /// Base URL of the runtime catalog; deployment cleanup is a no-op without it.
    pub runtime_catalog_url: Option<String>,
    pub request_timeout: Duration,
    pub element_library: Option<PathBuf>,
}

impl CatalogConfig {
    /// Reads the process environment after loading a `.env` file when present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind = value("CATALOG_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse()
            .context("CATALOG_BIND must be a socket address")?;

        let db_max_connections = match value("CATALOG_DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .parse()
                .context("CATALOG_DB_MAX_CONNECTIONS must be a positive integer")?,
            None => DEFAULT_DB_MAX_CONNECTIONS,
        };
        if db_max_connections == 0 {
            return Err(anyhow!("CATALOG_DB_MAX_CONNECTIONS must be a positive integer"));
        }

        let request_timeout_secs = match value("CATALOG_REQUEST_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .context("CATALOG_REQUEST_TIMEOUT_SECS must be a number of seconds")?,
            None => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            database_url: value("DATABASE_URL"),
            bind,
            db_max_connections,
            runtime_catalog_url: value("RUNTIME_CATALOG_URL"),
            request_timeout: Duration::from_secs(request_timeout_secs),
            element_library: value("CATALOG_ELEMENT_LIBRARY").map(PathBuf::from),
        })
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow!("DATABASE_URL must be set"))
    }

    /// Library from `CATALOG_ELEMENT_LIBRARY`, or the built-in one.
    pub fn load_element_library(&self) -> anyhow::Result<ElementLibrary> {
        match &self.element_library {
            Some(path) => ElementLibrary::from_path(path),
            None => Ok(ElementLibrary::builtin()),
        }
    }
}
