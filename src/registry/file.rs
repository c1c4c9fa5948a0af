// ABOUTME: File-backed tool registry — single JSON document, atomic write-then-rename
// ABOUTME: Single-writer via an in-process mutex; no cross-instance change propagation

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::model::{validate_create_request, DynamicTool, StoreFile, ToolCreateRequest, ToolPatch};
use crate::registry::ToolRegistry;

pub struct FileRegistry {
    path: PathBuf,
    max_tools: usize,
    state: RwLock<StoreFile>,
    write_lock: Mutex<()>,
}

impl FileRegistry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_tools: usize) -> Self {
        Self {
            path: path.into(),
            max_tools,
            state: RwLock::new(StoreFile::default()),
            write_lock: Mutex::new(()),
        }
    }

    async fn read_from_disk(&self) -> Result<StoreFile, AppError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StoreFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serializes `store` and writes it via a temp file in the same
    /// directory, then renames over the target path, so readers never
    /// observe a partially written document (spec section 9, "atomic file
    /// write").
    async fn write_atomic(&self, store: &StoreFile) -> Result<(), AppError> {
        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let tmp_path = dir.join(format!(".{}.{}.tmp", self.file_name(), Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(store)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dynamic_tools.json".to_owned())
    }
}

#[async_trait]
impl ToolRegistry for FileRegistry {
    async fn load(&self) -> Result<(), AppError> {
        let mut guard = self.state.write().await;
        if guard.tools.is_empty() {
            *guard = self.read_from_disk().await?;
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), AppError> {
        let fresh = self.read_from_disk().await?;
        *self.state.write().await = fresh;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DynamicTool>, AppError> {
        let guard = self.state.read().await;
        let mut tools = guard.tools.clone();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn get(&self, name: &str) -> Result<Option<DynamicTool>, AppError> {
        let guard = self.state.read().await;
        Ok(guard.tools.iter().find(|t| t.name == name).cloned())
    }

    async fn create(&self, req: ToolCreateRequest) -> Result<DynamicTool, AppError> {
        validate_create_request(&req)?;
        let _write_guard = self.write_lock.lock().await;
        let mut store = self.state.write().await;

        if store.tools.iter().any(|t| t.name == req.name) {
            return Err(AppError::new(ErrorKind::Duplicate, format!("tool '{}' already exists", req.name)));
        }
        if store.tools.len() >= self.max_tools {
            return Err(AppError::new(ErrorKind::LimitReached, "maxTools limit reached"));
        }

        let now = Utc::now();
        let tool = DynamicTool {
            name: req.name,
            title: req.title,
            description: req.description,
            image: req.image,
            timeout_ms: req.timeout_ms,
            dependencies: req.dependencies,
            code: req.code,
            enabled: req.enabled,
            created_at: now,
            updated_at: now,
            revision: 1,
        };
        store.tools.push(tool.clone());
        self.write_atomic(&store).await?;
        debug!(tool = %tool.name, "created dynamic tool");
        Ok(tool)
    }

    async fn update(
        &self,
        name: &str,
        patch: ToolPatch,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError> {
        let _write_guard = self.write_lock.lock().await;
        let mut store = self.state.write().await;

        let idx = store
            .tools
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;

        if let Some(expected) = expected_revision {
            if store.tools[idx].revision != expected {
                return Err(AppError::revision_conflict(expected, store.tools[idx].revision));
            }
        }

        crate::model::validate_patch(&patch)?;

        {
            let tool = &mut store.tools[idx];
            if let Some(title) = patch.title {
                tool.title = Some(title);
            }
            if let Some(description) = patch.description {
                tool.description = description;
            }
            if let Some(image) = patch.image {
                tool.image = image;
            }
            if let Some(timeout_ms) = patch.timeout_ms {
                tool.timeout_ms = timeout_ms;
            }
            if let Some(dependencies) = patch.dependencies {
                tool.dependencies = dependencies;
            }
            if let Some(code) = patch.code {
                tool.code = code;
            }
            tool.updated_at = Utc::now();
            tool.revision += 1;
        }

        let updated = store.tools[idx].clone();
        self.write_atomic(&store).await?;
        Ok(updated)
    }

    async fn remove(&self, name: &str, expected_revision: Option<i64>) -> Result<(), AppError> {
        let _write_guard = self.write_lock.lock().await;
        let mut store = self.state.write().await;

        let idx = store
            .tools
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;

        if let Some(expected) = expected_revision {
            if store.tools[idx].revision != expected {
                return Err(AppError::revision_conflict(expected, store.tools[idx].revision));
            }
        }

        store.tools.remove(idx);
        self.write_atomic(&store).await?;
        Ok(())
    }

    async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        expected_revision: Option<i64>,
    ) -> Result<DynamicTool, AppError> {
        let _write_guard = self.write_lock.lock().await;
        let mut store = self.state.write().await;

        let idx = store
            .tools
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;

        if let Some(expected) = expected_revision {
            if store.tools[idx].revision != expected {
                return Err(AppError::revision_conflict(expected, store.tools[idx].revision));
            }
        }

        {
            let tool = &mut store.tools[idx];
            tool.enabled = enabled;
            tool.updated_at = Utc::now();
            tool.revision += 1;
        }

        let updated = store.tools[idx].clone();
        self.write_atomic(&store).await?;
        Ok(updated)
    }
}

/// Convenience wrapper used by the factory to share one instance across
/// the service and any background tasks.
pub type SharedFileRegistry = Arc<FileRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dependency;

    fn request(name: &str) -> ToolCreateRequest {
        ToolCreateRequest {
            name: name.to_owned(),
            title: None,
            description: "desc".into(),
            image: "node:20".into(),
            timeout_ms: 5000,
            dependencies: vec![Dependency { name: "zod".into(), version: "^4".into() }],
            code: "return 1;".into(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("tools.json"), 10);
        registry.load().await.unwrap();
        let created = registry.create(request("dynamic.greeter")).await.unwrap();
        assert_eq!(created.revision, 1);

        let fetched = registry.get("dynamic.greeter").await.unwrap().unwrap();
        assert_eq!(fetched.name, "dynamic.greeter");

        let reloaded = FileRegistry::new(dir.path().join("tools.json"), 10);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn rejects_duplicate_create() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("tools.json"), 10);
        registry.load().await.unwrap();
        registry.create(request("dynamic.greeter")).await.unwrap();
        let err = registry.create(request("dynamic.greeter")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn enforces_max_tools_limit() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("tools.json"), 1);
        registry.load().await.unwrap();
        registry.create(request("dynamic.one")).await.unwrap();
        let err = registry.create(request("dynamic.two")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LimitReached);
    }

    #[tokio::test]
    async fn update_enforces_expected_revision() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("tools.json"), 10);
        registry.load().await.unwrap();
        registry.create(request("dynamic.greeter")).await.unwrap();

        let err = registry
            .update("dynamic.greeter", ToolPatch::default(), Some(99))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RevisionConflict);

        let patch = ToolPatch { description: Some("new".into()), ..Default::default() };
        let updated = registry.update("dynamic.greeter", patch, Some(1)).await.unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(updated.description, "new");
    }

    #[tokio::test]
    async fn update_rejects_out_of_range_patched_fields() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("tools.json"), 10);
        registry.load().await.unwrap();
        registry.create(request("dynamic.greeter")).await.unwrap();

        let patch = ToolPatch { timeout_ms: Some(500), ..Default::default() };
        let err = registry.update("dynamic.greeter", patch, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);

        let patch = ToolPatch { title: Some(String::new()), ..Default::default() };
        let err = registry.update("dynamic.greeter", patch, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn set_enabled_toggles_and_bumps_revision() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FileRegistry::new(dir.path().join("tools.json"), 10);
        registry.load().await.unwrap();
        registry.create(request("dynamic.greeter")).await.unwrap();
        let updated = registry.set_enabled("dynamic.greeter", false, None).await.unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.revision, 2);
    }
}
