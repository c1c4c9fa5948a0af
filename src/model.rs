// ABOUTME: Domain types for dynamic tools, store files, and change events
// ABOUTME: Owns the validation grammar that the service enforces at the boundary

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const RESERVED_PREFIX: &str = "dynamic.tool.";
pub const RESERVED_BUILTIN: &str = "run_js_ephemeral";

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9._:-]{2,63}$").expect("valid regex"));
static IMAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/:-]{0,199}$").expect("valid regex"));
static PACKAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(@[A-Za-z0-9][A-Za-z0-9._-]*/)?[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// Persisted dynamic tool record (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    pub image: String,
    pub timeout_ms: u32,
    pub dependencies: Vec<Dependency>,
    pub code: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
}

/// A partial update to an existing tool; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image: Option<String>,
    pub timeout_ms: Option<u32>,
    pub dependencies: Option<Vec<Dependency>>,
    pub code: Option<String>,
}

/// A full creation request, prior to server-assigned fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCreateRequest {
    pub name: String,
    pub title: Option<String>,
    pub description: String,
    pub image: String,
    pub timeout_ms: u32,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub code: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Read-facing projection of a tool (spec section 4.1 "Tool view projection").
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolView {
    pub name: String,
    pub title: Option<String>,
    pub description: String,
    pub image: String,
    pub timeout_ms: u32,
    pub dependencies: Vec<Dependency>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
    pub code_size_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl DynamicTool {
    #[must_use]
    pub fn to_view(&self, include_code: bool) -> ToolView {
        ToolView {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            image: self.image.clone(),
            timeout_ms: self.timeout_ms,
            dependencies: self.dependencies.clone(),
            enabled: self.enabled,
            created_at: self.created_at,
            updated_at: self.updated_at,
            revision: self.revision,
            code_size_bytes: self.code.len(),
            code: include_code.then(|| self.code.clone()),
        }
    }
}

/// `{version: 1, tools: [...]}` — the file backend's on-disk shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFile {
    pub version: u32,
    pub tools: Vec<DynamicTool>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: 1,
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    Enable,
    Disable,
}

/// Cross-instance / in-process change bus payload (spec section 3). The SQL
/// backend's `NOTIFY` payload shape is `{action, target?, schema, instanceId}`
/// (spec section 4.2); `schema` is `None` for purely in-process events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryChangeEvent {
    #[serde(rename = "instanceId")]
    pub origin_id: String,
    pub action: ChangeAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Checks the reserved-name policy (spec section 4.1).
pub fn check_reserved_name(name: &str) -> Result<(), AppError> {
    if name.starts_with(RESERVED_PREFIX) || name == RESERVED_BUILTIN {
        return Err(AppError::reserved_name(name));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<(), AppError> {
    if !NAME_RE.is_match(name) {
        return Err(AppError::validation(format!(
            "name '{name}' does not match the required grammar"
        )));
    }
    check_reserved_name(name)
}

pub fn validate_image(image: &str) -> Result<(), AppError> {
    if image.is_empty() || image.len() > 200 || !IMAGE_RE.is_match(image) {
        return Err(AppError::validation("image fails the image grammar"));
    }
    Ok(())
}

pub fn validate_dependency_name(name: &str) -> Result<(), AppError> {
    if !PACKAGE_RE.is_match(name) {
        return Err(AppError::validation(format!(
            "dependency name '{name}' fails the package grammar"
        )));
    }
    Ok(())
}

/// Validates a partial update against the same grammar `create` enforces
/// (spec section 4.1, `update`'s `validation` failure mode) — only the
/// fields actually present in the patch are checked.
pub fn validate_patch(patch: &ToolPatch) -> Result<(), AppError> {
    if let Some(title) = &patch.title {
        if title.is_empty() || title.len() > 120 {
            return Err(AppError::validation("title must be 1-120 chars"));
        }
    }
    if let Some(description) = &patch.description {
        if description.is_empty() || description.len() > 4000 {
            return Err(AppError::validation("description must be 1-4000 chars"));
        }
    }
    if let Some(image) = &patch.image {
        validate_image(image)?;
    }
    if let Some(timeout_ms) = patch.timeout_ms {
        if !(1000..=120_000).contains(&timeout_ms) {
            return Err(AppError::validation("timeoutMs must be within 1000-120000"));
        }
    }
    if let Some(dependencies) = &patch.dependencies {
        if dependencies.len() > 64 {
            return Err(AppError::validation("at most 64 dependencies are allowed"));
        }
        for dep in dependencies {
            validate_dependency_name(&dep.name)?;
            if dep.version.is_empty() || dep.version.len() > 128 {
                return Err(AppError::validation("dependency version must be 1-128 chars"));
            }
        }
    }
    if let Some(code) = &patch.code {
        if code.is_empty() || code.len() > 200_000 {
            return Err(AppError::validation("code must be 1-200000 chars"));
        }
    }
    Ok(())
}

pub fn validate_create_request(req: &ToolCreateRequest) -> Result<(), AppError> {
    validate_name(&req.name)?;
    if let Some(title) = &req.title {
        if title.is_empty() || title.len() > 120 {
            return Err(AppError::validation("title must be 1-120 chars"));
        }
    }
    if req.description.is_empty() || req.description.len() > 4000 {
        return Err(AppError::validation("description must be 1-4000 chars"));
    }
    validate_image(&req.image)?;
    if !(1000..=120_000).contains(&req.timeout_ms) {
        return Err(AppError::validation("timeoutMs must be within 1000-120000"));
    }
    if req.dependencies.len() > 64 {
        return Err(AppError::validation("at most 64 dependencies are allowed"));
    }
    for dep in &req.dependencies {
        validate_dependency_name(&dep.name)?;
        if dep.version.is_empty() || dep.version.len() > 128 {
            return Err(AppError::validation("dependency version must be 1-128 chars"));
        }
    }
    if req.code.is_empty() || req.code.len() > 200_000 {
        return Err(AppError::validation("code must be 1-200000 chars"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_prefix() {
        assert!(validate_name("dynamic.tool.foo").is_err());
    }

    #[test]
    fn rejects_reserved_builtin() {
        assert!(validate_name("run_js_ephemeral").is_err());
    }

    #[test]
    fn accepts_well_formed_name() {
        assert!(validate_name("dynamic.greeter").is_ok());
    }

    #[test]
    fn rejects_too_short_name() {
        assert!(validate_name("ab").is_err());
    }

    #[test]
    fn image_grammar_rejects_empty() {
        assert!(validate_image("").is_err());
    }
}
