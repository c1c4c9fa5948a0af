// ABOUTME: Postgres-shaped tool registry — advisory locks for the maxTools cap,
// ABOUTME: LISTEN/NOTIFY for cross-instance change propagation onto the local bus

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, error, info, warn};

use crate::change_bus::ChangeBus;
use crate::error::{is_transient, AppError, ErrorKind};
use crate::model::{
    validate_create_request, ChangeAction, DynamicTool, RegistryChangeEvent, ToolCreateRequest, ToolPatch,
};
use crate::registry::ToolRegistry;

const NOTIFY_CHANNEL: &str = "dynmcp_tool_changes";

pub struct SqlRegistry {
    pool: Pool<Postgres>,
    schema: String,
    max_tools: i64,
    origin_id: String,
    change_bus: ChangeBus,
}

impl SqlRegistry {
    /// Connects and retries schema bootstrap with exponential backoff,
    /// limited to transient connection-class errors (spec section 4.2).
    pub async fn connect(
        connection_string: &str,
        schema: &str,
        max_tools: usize,
        init_max_attempts: u32,
        init_backoff_ms: u64,
        change_bus: ChangeBus,
    ) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(connection_string)
            .await
            .map_err(AppError::from)?;

        let registry = Self {
            pool,
            schema: schema.to_owned(),
            max_tools: max_tools as i64,
            origin_id: uuid::Uuid::new_v4().to_string(),
            change_bus,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match registry.bootstrap_schema().await {
                Ok(()) => break,
                Err(e) if attempt < init_max_attempts => {
                    warn!(attempt, error = %e.message, "schema bootstrap failed, retrying");
                    tokio::time::sleep(Duration::from_millis(init_backoff_ms * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }

        registry.spawn_listener();
        Ok(registry)
    }

    async fn bootstrap_schema(&self) -> Result<(), AppError> {
        let table = self.qualified_table();
        sqlx::query(&format!(
            r"
            CREATE TABLE IF NOT EXISTS {table} (
                name TEXT PRIMARY KEY,
                title TEXT,
                description TEXT NOT NULL,
                image TEXT NOT NULL,
                timeout_ms INTEGER NOT NULL,
                dependencies JSONB NOT NULL,
                code TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT true,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                revision BIGINT NOT NULL DEFAULT 1
            )
            "
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| map_transient(e))?;
        Ok(())
    }

    fn qualified_table(&self) -> String {
        format!("{}.dynamic_tools", self.schema)
    }

    /// Subscribes to `NOTIFY` and republishes change events from other
    /// instances onto the local in-process bus (spec section 9, "in-memory
    /// pub/sub" bridged to cross-instance notification).
    fn spawn_listener(&self) {
        let connection_string = self.pool.connect_options().to_string();
        let origin_id = self.origin_id.clone();
        let schema = self.schema.clone();
        let change_bus = self.change_bus.clone();
        tokio::spawn(async move {
            let mut listener = match PgListener::connect(&connection_string).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, "failed to start registry change listener");
                    return;
                }
            };
            if let Err(e) = listener.listen(NOTIFY_CHANNEL).await {
                error!(error = %e, "failed to subscribe to registry change channel");
                return;
            }
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        if let Ok(event) = serde_json::from_str::<RegistryChangeEvent>(notification.payload()) {
                            let foreign_origin = event.origin_id != origin_id;
                            let matching_schema = event.schema.as_deref() == Some(schema.as_str());
                            if foreign_origin && matching_schema {
                                change_bus.publish(event);
                            }
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "registry change listener disconnected, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }

    async fn notify(&self, action: ChangeAction, target: Option<String>) {
        let event = RegistryChangeEvent {
            origin_id: self.origin_id.clone(),
            action,
            target,
            schema: Some(self.schema.clone()),
            timestamp: Utc::now(),
        };
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        if let Err(e) = sqlx::query(&format!("NOTIFY {NOTIFY_CHANNEL}, '{}'", payload.replace('\'', "''")))
            .execute(&self.pool)
            .await
        {
            warn!(error = %e, "best-effort NOTIFY failed");
        }
    }

    fn row_to_tool(row: &sqlx::postgres::PgRow) -> Result<DynamicTool, AppError> {
        let dependencies_json: serde_json::Value = row.try_get("dependencies").map_err(|e| map_transient(e))?;
        Ok(DynamicTool {
            name: row.try_get("name").map_err(|e| map_transient(e))?,
            title: row.try_get("title").map_err(|e| map_transient(e))?,
            description: row.try_get("description").map_err(|e| map_transient(e))?,
            image: row.try_get("image").map_err(|e| map_transient(e))?,
            timeout_ms: row.try_get::<i32, _>("timeout_ms").map_err(|e| map_transient(e))? as u32,
            dependencies: serde_json::from_value(dependencies_json)?,
            code: row.try_get("code").map_err(|e| map_transient(e))?,
            enabled: row.try_get("enabled").map_err(|e| map_transient(e))?,
            created_at: row.try_get("created_at").map_err(|e| map_transient(e))?,
            updated_at: row.try_get("updated_at").map_err(|e| map_transient(e))?,
            revision: row.try_get("revision").map_err(|e| map_transient(e))?,
        })
    }
}

fn map_transient(e: sqlx::Error) -> AppError {
    if is_transient(&e) {
        AppError::new(ErrorKind::TransientStorage, e.to_string())
    } else {
        AppError::new(ErrorKind::Internal, e.to_string())
    }
}

#[async_trait]
impl ToolRegistry for SqlRegistry {
    async fn load(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn reload(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DynamicTool>, AppError> {
        let table = self.qualified_table();
        let rows = sqlx::query(&format!("SELECT * FROM {table} ORDER BY name"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_transient)?;
        rows.iter().map(Self::row_to_tool).collect()
    }

    async fn get(&self, name: &str) -> Result<Option<DynamicTool>, AppError> {
        let table = self.qualified_table();
        let row = sqlx::query(&format!("SELECT * FROM {table} WHERE name = $1"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_transient)?;
        row.as_ref().map(Self::row_to_tool).transpose()
    }

    async fn create(&self, req: ToolCreateRequest) -> Result<DynamicTool, AppError> {
        validate_create_request(&req)?;
        let table = self.qualified_table();

        let mut tx = self.pool.begin().await.map_err(map_transient)?;
        // Scoped to `self.schema` (spec section 4.2) so unrelated schemas sharing a
        // connection pool don't serialize against each other's `maxTools` check.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.schema)
            .execute(&mut *tx)
            .await
            .map_err(map_transient)?;

        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_transient)?;
        if count >= self.max_tools {
            tx.rollback().await.map_err(map_transient)?;
            return Err(AppError::new(ErrorKind::LimitReached, "maxTools limit reached"));
        }

        let now = Utc::now();
        let dependencies = serde_json::to_value(&req.dependencies)?;
        let inserted = sqlx::query(&format!(
            r"
            INSERT INTO {table}
                (name, title, description, image, timeout_ms, dependencies, code, enabled, created_at, updated_at, revision)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, 1)
            ON CONFLICT (name) DO NOTHING
            RETURNING *
            "
        ))
        .bind(&req.name)
        .bind(&req.title)
        .bind(&req.description)
        .bind(&req.image)
        .bind(req.timeout_ms as i32)
        .bind(&dependencies)
        .bind(&req.code)
        .bind(req.enabled)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_transient)?;

        let Some(row) = inserted else {
            tx.rollback().await.map_err(map_transient)?;
            return Err(AppError::new(ErrorKind::Duplicate, format!("tool '{}' already exists", req.name)));
        };
        let tool = Self::row_to_tool(&row)?;
        tx.commit().await.map_err(map_transient)?;

        debug!(tool = %tool.name, "created dynamic tool");
        self.notify(ChangeAction::Create, Some(tool.name.clone())).await;
        Ok(tool)
    }

    async fn update(
        &self,
        name: &str,
        patch: ToolPatch,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError> {
        let table = self.qualified_table();
        let current = self
            .get(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;

        if let Some(expected) = expected_revision {
            if current.revision != expected {
                return Err(AppError::revision_conflict(expected, current.revision));
            }
        }

        crate::model::validate_patch(&patch)?;

        let title = patch.title.or(current.title.clone());
        let description = patch.description.unwrap_or(current.description.clone());
        let image = patch.image.unwrap_or(current.image.clone());
        let timeout_ms = patch.timeout_ms.unwrap_or(current.timeout_ms);
        let dependencies = patch.dependencies.unwrap_or(current.dependencies.clone());
        let code = patch.code.unwrap_or(current.code.clone());
        let dependencies_json = serde_json::to_value(&dependencies)?;

        let row = sqlx::query(&format!(
            r"
            UPDATE {table}
            SET title = $1, description = $2, image = $3, timeout_ms = $4, dependencies = $5,
                code = $6, updated_at = now(), revision = revision + 1
            WHERE name = $7 AND revision = $8
            RETURNING *
            "
        ))
        .bind(&title)
        .bind(&description)
        .bind(&image)
        .bind(timeout_ms as i32)
        .bind(&dependencies_json)
        .bind(&code)
        .bind(name)
        .bind(current.revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_transient)?;

        let Some(row) = row else {
            let latest = self.get(name).await?;
            return Err(match latest {
                Some(t) => AppError::revision_conflict(current.revision, t.revision),
                None => AppError::not_found(format!("tool '{name}' not found")),
            });
        };
        let tool = Self::row_to_tool(&row)?;
        self.notify(ChangeAction::Update, Some(tool.name.clone())).await;
        Ok(tool)
    }

    async fn remove(&self, name: &str, expected_revision: Option<i64>) -> Result<(), AppError> {
        let table = self.qualified_table();
        let current = self
            .get(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;

        if let Some(expected) = expected_revision {
            if current.revision != expected {
                return Err(AppError::revision_conflict(expected, current.revision));
            }
        }

        let result = sqlx::query(&format!("DELETE FROM {table} WHERE name = $1 AND revision = $2"))
            .bind(name)
            .bind(current.revision)
            .execute(&self.pool)
            .await
            .map_err(map_transient)?;

        if result.rows_affected() == 0 {
            let latest = self.get(name).await?;
            return Err(match latest {
                Some(t) => AppError::revision_conflict(current.revision, t.revision),
                None => AppError::not_found(format!("tool '{name}' not found")),
            });
        }

        self.notify(ChangeAction::Delete, Some(name.to_owned())).await;
        Ok(())
    }

    async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError> {
        let table = self.qualified_table();
        let current = self
            .get(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;

        if let Some(expected) = expected_revision {
            if current.revision != expected {
                return Err(AppError::revision_conflict(expected, current.revision));
            }
        }

        let row = sqlx::query(&format!(
            r"
            UPDATE {table}
            SET enabled = $1, updated_at = now(), revision = revision + 1
            WHERE name = $2 AND revision = $3
            RETURNING *
            "
        ))
        .bind(enabled)
        .bind(name)
        .bind(current.revision)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_transient)?;

        let Some(row) = row else {
            let latest = self.get(name).await?;
            return Err(match latest {
                Some(t) => AppError::revision_conflict(current.revision, t.revision),
                None => AppError::not_found(format!("tool '{name}' not found")),
            });
        };
        let tool = Self::row_to_tool(&row)?;
        let action = if enabled { ChangeAction::Enable } else { ChangeAction::Disable };
        self.notify(action, Some(tool.name.clone())).await;
        Ok(tool)
    }
}

pub type SharedSqlRegistry = Arc<SqlRegistry>;

