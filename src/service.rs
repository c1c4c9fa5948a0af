// ABOUTME: Dynamic Tool Service — CRUD, admin/read-only policy, runtime (de)registration,
// ABOUTME: and cross-instance reconciliation against the MCP capability layer (spec section 4.1)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::change_bus::ChangeBus;
use crate::config::RegistryConfig;
use crate::error::AppError;
use crate::guard::ExecutionGuard;
use crate::http::session::SessionTable;
use crate::mcp_capability::{tool_list_entry, InProcessMcpServer, ToolHandle};
use crate::model::{ChangeAction, DynamicTool, RegistryChangeEvent, ToolCreateRequest, ToolPatch, ToolView};
use crate::registry::factory::Registry;
use crate::registry::ToolRegistry;
use crate::sandbox::resolver::EngineResolver;

/// Executes one registered dynamic tool through the sandbox, under the
/// guard scope `dynamic.exec.<name>` (spec section 9, open question on
/// guard scoping).
struct DynamicToolHandle {
    tool: DynamicTool,
    guard: Arc<ExecutionGuard>,
    resolver: Arc<EngineResolver>,
}

#[async_trait]
impl ToolHandle for DynamicToolHandle {
    async fn call(&self, input: Value) -> Result<Value, AppError> {
        let scope = format!("dynamic.exec.{}", self.tool.name);
        let executor = self.resolver.resolve().await;
        let outcome = self
            .guard
            .run(&scope, executor.execute(&self.tool, input))
            .await?;
        let result = outcome?;
        Ok(serde_json::to_value(result)?)
    }
}

struct Inner {
    registry: Registry,
    guard: Arc<ExecutionGuard>,
    resolver: Arc<EngineResolver>,
    sessions: SessionTable,
    change_bus: ChangeBus,
    audit: Arc<AuditLogger>,
    registry_config: RegistryConfig,
    origin_id: String,
    /// Tracks the revision last registered with the MCP capability layer,
    /// so reconcile only re-registers tools whose revision actually moved
    /// (spec section 4.1, "runtime (de)registration").
    runtime_revisions: DashMap<String, i64>,
    reconcile_pending: AtomicBool,
    reconcile_notify: Notify,
}

/// The Dynamic Tool Service (spec section 4.1): owns CRUD against the
/// registry, enforces admin and read-only policy, and keeps the MCP
/// capability layer's registered tool handles in sync with registry state,
/// both locally and across instances via the change bus.
#[derive(Clone)]
pub struct DynamicToolService {
    inner: Arc<Inner>,
}

impl DynamicToolService {
    pub async fn new(
        registry: Registry,
        guard: Arc<ExecutionGuard>,
        resolver: Arc<EngineResolver>,
        sessions: SessionTable,
        change_bus: ChangeBus,
        audit: Arc<AuditLogger>,
        registry_config: RegistryConfig,
    ) -> Result<Self, AppError> {
        let inner = Arc::new(Inner {
            registry,
            guard,
            resolver,
            sessions,
            change_bus,
            audit,
            registry_config,
            origin_id: Uuid::new_v4().to_string(),
            runtime_revisions: DashMap::new(),
            reconcile_pending: AtomicBool::new(false),
            reconcile_notify: Notify::new(),
        });

        let service = Self { inner };
        service.reconcile().await?;
        service.spawn_reconcile_loop();
        service.subscribe_change_bus();
        Ok(service)
    }

    fn spawn_reconcile_loop(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                inner.reconcile_notify.notified().await;
                if inner.reconcile_pending.swap(false, Ordering::SeqCst) {
                    let service = Self { inner: inner.clone() };
                    if let Err(e) = service.reconcile().await {
                        warn!(error = %e.message, "reconcile pass failed");
                    }
                }
            }
        });
    }

    /// Coalesces bursts of change events into a single reconcile pass: any
    /// event arriving while one is pending just keeps the flag set (spec
    /// section 9, "reconcile loop coalescing").
    fn subscribe_change_bus(&self) {
        let inner = self.inner.clone();
        self.inner.change_bus.subscribe(move |event: RegistryChangeEvent| {
            if event.origin_id == inner.origin_id {
                return;
            }
            inner.reconcile_pending.store(true, Ordering::SeqCst);
            inner.reconcile_notify.notify_one();
        });
    }

    /// Reloads the registry and brings MCP capability registration in line
    /// with it: registers new/changed enabled tools, deregisters removed or
    /// disabled ones.
    async fn reconcile(&self) -> Result<(), AppError> {
        self.inner.registry.reload().await?;
        let tools = self.inner.registry.list().await?;

        let mut seen = std::collections::HashSet::new();
        for tool in &tools {
            seen.insert(tool.name.clone());
            let last_registered = self.inner.runtime_revisions.get(&tool.name).map(|r| *r);
            if tool.enabled {
                if last_registered != Some(tool.revision) {
                    self.register_runtime(tool).await;
                }
            } else if last_registered.is_some() {
                self.deregister_runtime(&tool.name).await;
            }
        }

        let stale: Vec<String> = self
            .inner
            .runtime_revisions
            .iter()
            .map(|e| e.key().clone())
            .filter(|name| !seen.contains(name))
            .collect();
        for name in stale {
            self.deregister_runtime(&name).await;
        }

        self.notify_tool_list_changed();
        Ok(())
    }

    /// Registers a tool handle against every live session's capability
    /// instance (spec section 3/4.5: one `McpServer` instance per session).
    async fn register_runtime(&self, tool: &DynamicTool) {
        for server in self.inner.sessions.all_servers() {
            let handle = Arc::new(DynamicToolHandle {
                tool: tool.clone(),
                guard: self.inner.guard.clone(),
                resolver: self.inner.resolver.clone(),
            });
            server.register_tool(&tool.name, handle).await;
        }
        self.inner.runtime_revisions.insert(tool.name.clone(), tool.revision);
        debug!(tool = %tool.name, revision = tool.revision, "registered runtime tool handle");
    }

    async fn deregister_runtime(&self, name: &str) {
        for server in self.inner.sessions.all_servers() {
            server.deregister_tool(name).await;
        }
        self.inner.runtime_revisions.remove(name);
        debug!(tool = name, "deregistered runtime tool handle");
    }

    /// Populates a freshly created session's capability instance with the
    /// current enabled-tool snapshot (spec section 4.5, session creation).
    pub async fn seed_session(&self, server: &Arc<InProcessMcpServer>) -> Result<(), AppError> {
        let tools = self.inner.registry.list().await?;
        for tool in tools.iter().filter(|t| t.enabled) {
            let handle = Arc::new(DynamicToolHandle {
                tool: tool.clone(),
                guard: self.inner.guard.clone(),
                resolver: self.inner.resolver.clone(),
            });
            server.register_tool(&tool.name, handle).await;
        }
        Ok(())
    }

    /// Notifies every live session's capability instance that the tool
    /// list changed (spec section 4.1: "after any change, the Service
    /// notifies the MCP server instance that its tool list changed").
    fn notify_tool_list_changed(&self) {
        for server in self.inner.sessions.all_servers() {
            server.send_tool_list_changed();
        }
    }

    fn check_admin(&self, admin_token: Option<&str>) -> Result<(), AppError> {
        self.inner.registry_config.check_admin(admin_token)
    }

    fn check_writable(&self) -> Result<(), AppError> {
        if self.inner.registry_config.read_only {
            return Err(AppError::read_only());
        }
        Ok(())
    }

    async fn publish_and_audit(
        &self,
        action: ChangeAction,
        target: &str,
        audit_event_type: AuditEventType,
        audit_action: &str,
    ) {
        self.inner.change_bus.publish(RegistryChangeEvent {
            origin_id: self.inner.origin_id.clone(),
            action,
            target: Some(target.to_owned()),
            schema: None,
            timestamp: Utc::now(),
        });
        self.inner
            .audit
            .log(AuditEvent {
                event_type: audit_event_type,
                actor: None,
                session_id: None,
                action: audit_action.to_owned(),
                resource: format!("dynamic_tool:{target}"),
                metadata: serde_json::json!({}),
            })
            .await;
        self.notify_tool_list_changed();
    }

    pub async fn list(&self, include_code: bool, admin_token: Option<&str>) -> Result<Vec<ToolView>, AppError> {
        self.check_admin(admin_token)?;
        Ok(self
            .inner
            .registry
            .list()
            .await?
            .iter()
            .map(|t| t.to_view(include_code))
            .collect())
    }

    pub async fn get(&self, name: &str, admin_token: Option<&str>) -> Result<ToolView, AppError> {
        self.check_admin(admin_token)?;
        let tool = self
            .inner
            .registry
            .get(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("tool '{name}' not found")))?;
        Ok(tool.to_view(true))
    }

    pub async fn create(
        &self,
        req: ToolCreateRequest,
        admin_token: Option<&str>,
    ) -> Result<ToolView, AppError> {
        self.check_writable()?;
        self.check_admin(admin_token)?;
        let tool = self.inner.registry.create(req).await?;
        if tool.enabled {
            self.register_runtime(&tool).await;
        }
        self.publish_and_audit(ChangeAction::Create, &tool.name, AuditEventType::ToolCreate, "tool_create")
            .await;
        info!(tool = %tool.name, "dynamic tool created");
        Ok(tool.to_view(false))
    }

    pub async fn update(
        &self,
        name: &str,
        patch: ToolPatch,
        expected_revision: Option<i64>,
        admin_token: Option<&str>,
    ) -> Result<ToolView, AppError> {
        self.check_writable()?;
        self.check_admin(admin_token)?;
        let tool = self.inner.registry.update(name, patch, expected_revision).await?;
        if tool.enabled {
            self.register_runtime(&tool).await;
        } else {
            self.deregister_runtime(&tool.name).await;
        }
        self.publish_and_audit(ChangeAction::Update, &tool.name, AuditEventType::ToolUpdate, "tool_update")
            .await;
        Ok(tool.to_view(false))
    }

    pub async fn delete(
        &self,
        name: &str,
        expected_revision: Option<i64>,
        admin_token: Option<&str>,
    ) -> Result<(), AppError> {
        self.check_writable()?;
        self.check_admin(admin_token)?;
        self.inner.registry.remove(name, expected_revision).await?;
        self.deregister_runtime(name).await;
        self.publish_and_audit(ChangeAction::Delete, name, AuditEventType::ToolDelete, "tool_delete")
            .await;
        info!(tool = name, "dynamic tool deleted");
        Ok(())
    }

    pub async fn set_enabled(
        &self,
        name: &str,
        enabled: bool,
        expected_revision: Option<i64>,
        admin_token: Option<&str>,
    ) -> Result<ToolView, AppError> {
        // Read-only mode rejects setEnabled too (spec section 9, open
        // question resolution): toggling is a mutation like any other.
        self.check_writable()?;
        self.check_admin(admin_token)?;
        let tool = self.inner.registry.set_enabled(name, enabled, expected_revision).await?;
        if enabled {
            self.register_runtime(&tool).await;
        } else {
            self.deregister_runtime(&tool.name).await;
        }
        let (action, event_type, audit_action) = if enabled {
            (ChangeAction::Enable, AuditEventType::ToolEnable, "tool_enable")
        } else {
            (ChangeAction::Disable, AuditEventType::ToolDisable, "tool_disable")
        };
        self.publish_and_audit(action, &tool.name, event_type, audit_action).await;
        Ok(tool.to_view(false))
    }

    /// Read-facing tool list projection for the MCP `tools/list` method.
    pub async fn mcp_tool_list(&self) -> Result<Vec<Value>, AppError> {
        Ok(self
            .inner
            .registry
            .list()
            .await?
            .iter()
            .filter(|t| t.enabled)
            .map(tool_list_entry)
            .collect())
    }

    /// Exposes the admin-token check for callers outside the registry path
    /// (the ephemeral-execution operation, which "behaves identically to
    /// registering a tool" per spec section 4.3 but never touches the
    /// registry itself).
    pub fn check_admin_token(&self, admin_token: Option<&str>) -> Result<(), AppError> {
        self.check_admin(admin_token)
    }
}
