// ABOUTME: `run_js_ephemeral` — register, execute, discard without registry persistence
// ABOUTME: Routed through the guard under the `dynamic.exec.run_js_ephemeral` scope

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use crate::error::AppError;
use crate::guard::ExecutionGuard;
use crate::model::{validate_dependency_name, validate_image, Dependency, DynamicTool};
use crate::sandbox::resolver::EngineResolver;

const EPHEMERAL_SCOPE: &str = "dynamic.exec.run_js_ephemeral";
const EPHEMERAL_NAME: &str = "run_js_ephemeral";

/// The inline request body for the built-in ephemeral execution operation
/// (spec section 4.3, "Ephemeral execution").
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRunRequest {
    pub code: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub args: Value,
}

fn default_image() -> String {
    "node:20-slim".to_owned()
}

fn default_timeout_ms() -> u32 {
    10_000
}

/// Runs `req.code` once with no persistence, no revision, no registry
/// interaction. Still goes through the Execution Guard and sandbox policy
/// like any registered tool (spec section 9, open question resolution:
/// built-ins route through the guard too).
pub async fn run_js_ephemeral(
    req: EphemeralRunRequest,
    guard: &Arc<ExecutionGuard>,
    resolver: &Arc<EngineResolver>,
) -> Result<Value, AppError> {
    validate_image(&req.image)?;
    for dep in &req.dependencies {
        validate_dependency_name(&dep.name)?;
    }
    if req.code.is_empty() || req.code.len() > 200_000 {
        return Err(AppError::validation("code must be 1-200000 chars"));
    }

    let now = Utc::now();
    let tool = DynamicTool {
        name: EPHEMERAL_NAME.to_owned(),
        title: None,
        description: "ephemeral inline execution".to_owned(),
        image: req.image,
        timeout_ms: req.timeout_ms,
        dependencies: req.dependencies,
        code: req.code,
        enabled: true,
        created_at: now,
        updated_at: now,
        revision: 0,
    };

    let executor = resolver.resolve().await;
    let outcome = guard.run(EPHEMERAL_SCOPE, executor.execute(&tool, req.args)).await?;
    let result = outcome?;
    Ok(serde_json::to_value(result)?)
}
