// ABOUTME: Registry abstraction for dynamic tool persistence (spec section 4.2)
// ABOUTME: Plugin architecture with file and SQL backends behind a common trait

pub mod factory;
pub mod file;

#[cfg(feature = "postgresql")]
pub mod sql;

use async_trait::async_trait;

use crate::error::AppError;
use crate::model::{DynamicTool, ToolCreateRequest, ToolPatch};

/// Core persistence abstraction all registry backends implement.
///
/// All mutating operations enforce optimistic concurrency via
/// `expected_revision` and the `maxTools` cap at the storage boundary, not
/// just in the service layer, so backends remain safe to use directly.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Load the store from its backing medium into memory/cache.
    async fn load(&self) -> Result<(), AppError>;

    /// Force a reload, discarding any cached state.
    async fn reload(&self) -> Result<(), AppError>;

    /// List all tools, sorted by name.
    async fn list(&self) -> Result<Vec<DynamicTool>, AppError>;

    /// Get a single tool by name.
    async fn get(&self, name: &str) -> Result<Option<DynamicTool>, AppError>;

    /// Create a new tool. Fails with `Duplicate` if the name exists, or
    /// `LimitReached` if the store is already at `maxTools`.
    async fn create(&self, req: ToolCreateRequest) -> Result<DynamicTool, AppError>;

    /// Apply a partial update, enforcing `expected_revision` when present.
    async fn update(
        &self,
        name: &str,
        patch: ToolPatch,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError>;

    /// Remove a tool by name.
    async fn remove(&self, name: &str, expected_revision: Option<i64>) -> Result<(), AppError>;

    /// Toggle a tool's `enabled` flag.
    async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError>;
}
