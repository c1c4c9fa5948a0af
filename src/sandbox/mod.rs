// ABOUTME: Two-phase (install, run) isolated tool execution contract and policy checks
// ABOUTME: Backends: container (default, bollard) and forked-process (fallback)

pub mod fork;
pub mod harness;
pub mod output;
pub mod resolver;

#[cfg(feature = "container")]
pub mod container;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::SandboxConfig;
use crate::error::{AppError, ErrorKind};
use crate::model::DynamicTool;

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    /// Set when the harness produced output with no result marker — an
    /// informational, non-error outcome (spec section 4.3/8 P7).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
}

#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Execute `tool` with `args`, honoring `min(tool.timeoutMs, maxTimeoutMs)`.
    async fn execute(&self, tool: &DynamicTool, args: Value) -> Result<ExecutionResult, AppError>;

    /// Whether this backend supports declared dependencies.
    fn supports_dependencies(&self) -> bool;
}

/// Validates the sandbox policy (image grammar/allowlist, dependency count,
/// blocked packages) before launching. Called by both backends and by the
/// service prior to registering a runtime handle.
pub fn check_policy(tool: &DynamicTool, config: &SandboxConfig) -> Result<(), AppError> {
    crate::model::validate_image(&tool.image)?;
    if !config.allowed_images.is_empty() && !config.allowed_images.contains(&tool.image) {
        return Err(AppError::new(
            ErrorKind::SandboxPolicy,
            format!("image '{}' is not on the allowlist", tool.image),
        ));
    }
    if tool.dependencies.len() > config.max_dependencies {
        return Err(AppError::new(
            ErrorKind::SandboxPolicy,
            "dependency count exceeds the configured maximum",
        ));
    }
    for dep in &tool.dependencies {
        if config.blocked_packages.contains(&dep.name) {
            return Err(AppError::new(
                ErrorKind::SandboxPolicy,
                format!("dependency '{}' is blocked", dep.name),
            ));
        }
    }
    Ok(())
}

#[must_use]
pub fn effective_timeout(tool: &DynamicTool, config: &SandboxConfig) -> Duration {
    Duration::from_millis(u64::from(tool.timeout_ms).min(config.max_timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dependency;
    use chrono::Utc;

    fn tool(image: &str, deps: Vec<Dependency>) -> DynamicTool {
        DynamicTool {
            name: "dynamic.t".into(),
            title: None,
            description: "d".into(),
            image: image.into(),
            timeout_ms: 5000,
            dependencies: deps,
            code: "return 1;".into(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 1,
        }
    }

    #[test]
    fn rejects_image_not_on_allowlist() {
        let mut cfg = SandboxConfig {
            backend: crate::config::SandboxBackendMode::Fork,
            memory_mb: 256,
            cpu_limit: 1.0,
            max_dependencies: 4,
            max_output_bytes: 1000,
            max_timeout_ms: 10_000,
            allowed_images: vec!["node:20".into()],
            blocked_packages: vec![],
            session_ttl_seconds: 300,
            max_sessions: 4,
        };
        let t = tool("node:18", vec![]);
        assert_eq!(check_policy(&t, &cfg).unwrap_err().kind, ErrorKind::SandboxPolicy);
        cfg.allowed_images.clear();
        assert!(check_policy(&t, &cfg).is_ok());
    }

    #[test]
    fn rejects_blocked_dependency() {
        let cfg = SandboxConfig {
            backend: crate::config::SandboxBackendMode::Fork,
            memory_mb: 256,
            cpu_limit: 1.0,
            max_dependencies: 4,
            max_output_bytes: 1000,
            max_timeout_ms: 10_000,
            allowed_images: vec![],
            blocked_packages: vec!["evil-pkg".into()],
            session_ttl_seconds: 300,
            max_sessions: 4,
        };
        let t = tool(
            "node:20",
            vec![Dependency {
                name: "evil-pkg".into(),
                version: "1.0.0".into(),
            }],
        );
        assert_eq!(check_policy(&t, &cfg).unwrap_err().kind, ErrorKind::SandboxPolicy);
    }

    #[test]
    fn effective_timeout_is_bounded_by_max() {
        let cfg = SandboxConfig {
            backend: crate::config::SandboxBackendMode::Fork,
            memory_mb: 256,
            cpu_limit: 1.0,
            max_dependencies: 4,
            max_output_bytes: 1000,
            max_timeout_ms: 2_000,
            allowed_images: vec![],
            blocked_packages: vec![],
            session_ttl_seconds: 300,
            max_sessions: 4,
        };
        let t = tool("node:20", vec![]);
        assert_eq!(effective_timeout(&t, &cfg), Duration::from_millis(2_000));
    }
}
