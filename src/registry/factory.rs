// ABOUTME: Registry factory — selects the file or SQL backend from configuration
// ABOUTME: Mirrors the provider-wrapper pattern: one enum, transparent dispatch

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::change_bus::ChangeBus;
use crate::config::{RegistryBackend, RegistryConfig, SqlConfig};
use crate::error::{AppError, ErrorKind};
use crate::model::{DynamicTool, ToolCreateRequest, ToolPatch};
use crate::registry::file::FileRegistry;
use crate::registry::ToolRegistry;

#[cfg(feature = "postgresql")]
use crate::registry::sql::SqlRegistry;

/// Runtime-selected registry backend (spec section 4.2).
pub enum Registry {
    File(Arc<FileRegistry>),
    #[cfg(feature = "postgresql")]
    Sql(Arc<SqlRegistry>),
}

impl Registry {
    /// Builds the configured backend, connecting and bootstrapping the SQL
    /// schema (with retry) if selected.
    pub async fn connect(
        registry: &RegistryConfig,
        sql: &SqlConfig,
        change_bus: ChangeBus,
    ) -> Result<Self, AppError> {
        match registry.backend {
            RegistryBackend::File => {
                info!(path = %registry.file_path, "using file registry backend");
                let backend = Arc::new(FileRegistry::new(registry.file_path.clone(), registry.max_tools));
                backend.load().await?;
                Ok(Self::File(backend))
            }
            RegistryBackend::Sql => {
                #[cfg(feature = "postgresql")]
                {
                    info!(schema = %sql.schema, "using SQL registry backend");
                    let backend = Arc::new(
                        SqlRegistry::connect(
                            &sql.connection_string,
                            &sql.schema,
                            registry.max_tools,
                            sql.init_max_attempts,
                            sql.init_backoff_ms,
                            change_bus,
                        )
                        .await?,
                    );
                    Ok(Self::Sql(backend))
                }
                #[cfg(not(feature = "postgresql"))]
                {
                    let _ = (sql, change_bus);
                    Err(AppError::new(
                        ErrorKind::Internal,
                        "SQL registry backend requires the 'postgresql' feature",
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl ToolRegistry for Registry {
    async fn load(&self) -> Result<(), AppError> {
        match self {
            Self::File(r) => r.load().await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.load().await,
        }
    }

    async fn reload(&self) -> Result<(), AppError> {
        match self {
            Self::File(r) => r.reload().await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.reload().await,
        }
    }

    async fn list(&self) -> Result<Vec<DynamicTool>, AppError> {
        match self {
            Self::File(r) => r.list().await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.list().await,
        }
    }

    async fn get(&self, name: &str) -> Result<Option<DynamicTool>, AppError> {
        match self {
            Self::File(r) => r.get(name).await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.get(name).await,
        }
    }

    async fn create(&self, req: ToolCreateRequest) -> Result<DynamicTool, AppError> {
        match self {
            Self::File(r) => r.create(req).await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.create(req).await,
        }
    }

    async fn update(
        &self,
        name: &str,
        patch: ToolPatch,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError> {
        match self {
            Self::File(r) => r.update(name, patch, expected_revision).await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.update(name, patch, expected_revision).await,
        }
    }

    async fn remove(&self, name: &str, expected_revision: Option<i64>) -> Result<(), AppError> {
        match self {
            Self::File(r) => r.remove(name, expected_revision).await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.remove(name, expected_revision).await,
        }
    }

    async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError> {
        match self {
            Self::File(r) => r.set_enabled(name, enabled, expected_revision).await,
            #[cfg(feature = "postgresql")]
            Self::Sql(r) => r.set_enabled(name, enabled, expected_revision).await,
        }
    }
}
