// ABOUTME: Configuration structs covering every key enumerated in spec section 6
// ABOUTME: Environment-variable loading only; argv/dotenv parsing is an external concern

use std::env;
use std::time::Duration;

fn env_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureProfile {
    Mvp,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    File,
    Sql,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackendMode {
    Auto,
    Container,
    Fork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Jwt,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub session_id_header: String,
    pub session_ttl_seconds: u64,
    pub max_request_bytes: usize,
}

impl HttpConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            host: env_var_or("DYNMCP_HTTP_HOST", "0.0.0.0"),
            port: env_parse_or("DYNMCP_HTTP_PORT", 8080),
            path: env_var_or("DYNMCP_HTTP_PATH", "/mcp"),
            session_id_header: env_var_or("DYNMCP_SESSION_HEADER", "mcp-session-id"),
            session_ttl_seconds: env_parse_or::<u64>("DYNMCP_SESSION_TTL_SECONDS", 1800).min(604_800),
            max_request_bytes: env_parse_or::<usize>("DYNMCP_MAX_REQUEST_BYTES", 1_000_000)
                .min(100_000_000),
        }
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        let derived = self.session_ttl_seconds / 10;
        Duration::from_secs(derived.clamp(1, 30))
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub backend: RegistryBackend,
    pub file_path: String,
    pub max_tools: usize,
    pub read_only: bool,
    pub admin_token: Option<String>,
    pub require_admin_token: bool,
}

impl RegistryConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let backend = match env_var_or("DYNMCP_REGISTRY_BACKEND", "file").as_str() {
            "sql" => RegistryBackend::Sql,
            _ => RegistryBackend::File,
        };
        Self {
            backend,
            file_path: env_var_or("DYNMCP_REGISTRY_FILE", "dynamic_tools.json"),
            max_tools: env_parse_or::<usize>("DYNMCP_MAX_TOOLS", 500).clamp(1, 10_000),
            read_only: env_parse_or("DYNMCP_READ_ONLY", false),
            admin_token: env::var("DYNMCP_ADMIN_TOKEN").ok(),
            require_admin_token: env_parse_or("DYNMCP_REQUIRE_ADMIN_TOKEN", false),
        }
    }

    /// Admin policy (spec section 4.1): when a token is configured, every
    /// management operation requires a caller-supplied token equal to it.
    pub fn check_admin(&self, supplied: Option<&str>) -> Result<(), crate::error::AppError> {
        if !self.require_admin_token {
            return Ok(());
        }
        match (&self.admin_token, supplied) {
            (Some(expected), Some(got)) if expected == got => Ok(()),
            _ => Err(crate::error::AppError::admin_denied()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlConfig {
    pub connection_string: String,
    pub schema: String,
    pub init_max_attempts: u32,
    pub init_backoff_ms: u64,
}

impl SqlConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            connection_string: env_var_or("DYNMCP_SQL_URL", "postgres://localhost/dynmcp"),
            schema: env_var_or("DYNMCP_SQL_SCHEMA", "public"),
            init_max_attempts: env_parse_or::<u32>("DYNMCP_SQL_INIT_MAX_ATTEMPTS", 10).min(100),
            init_backoff_ms: env_parse_or::<u64>("DYNMCP_SQL_INIT_BACKOFF_MS", 200).min(60_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackendMode,
    pub memory_mb: u64,
    pub cpu_limit: f64,
    pub max_dependencies: usize,
    pub max_output_bytes: usize,
    pub max_timeout_ms: u64,
    pub allowed_images: Vec<String>,
    pub blocked_packages: Vec<String>,
    pub session_ttl_seconds: u64,
    pub max_sessions: usize,
}

impl SandboxConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let backend = match env_var_or("DYNMCP_SANDBOX_BACKEND", "auto").as_str() {
            "container" => SandboxBackendMode::Container,
            "fork" => SandboxBackendMode::Fork,
            _ => SandboxBackendMode::Auto,
        };
        let list = |key: &str| -> Vec<String> {
            env::var(key)
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect())
                .unwrap_or_default()
        };
        Self {
            backend,
            memory_mb: env_parse_or("DYNMCP_SANDBOX_MEMORY_MB", 256),
            cpu_limit: env_parse_or("DYNMCP_SANDBOX_CPU_LIMIT", 1.0),
            max_dependencies: env_parse_or::<usize>("DYNMCP_SANDBOX_MAX_DEPENDENCIES", 64).min(64),
            max_output_bytes: env_parse_or("DYNMCP_SANDBOX_MAX_OUTPUT_BYTES", 65_536),
            max_timeout_ms: env_parse_or::<u64>("DYNMCP_SANDBOX_MAX_TIMEOUT_MS", 120_000).min(120_000),
            allowed_images: list("DYNMCP_SANDBOX_ALLOWED_IMAGES"),
            blocked_packages: list("DYNMCP_SANDBOX_BLOCKED_PACKAGES"),
            session_ttl_seconds: env_parse_or("DYNMCP_SANDBOX_SESSION_TTL_SECONDS", 300),
            max_sessions: env_parse_or("DYNMCP_SANDBOX_MAX_SESSIONS", 16),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub max_concurrency: usize,
    pub max_calls_per_window: usize,
    pub window_ms: u64,
}

impl GuardConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_concurrency: env_parse_or("DYNMCP_GUARD_MAX_CONCURRENCY", 8),
            max_calls_per_window: env_parse_or("DYNMCP_GUARD_MAX_CALLS_PER_WINDOW", 60),
            window_ms: env_parse_or("DYNMCP_GUARD_WINDOW_MS", 60_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub jwks_url: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub required_scopes: Vec<String>,
    /// Shared HS256 verification secret. The JWKS URL is carried for a future
    /// asymmetric-key rollout; the in-repo verifier implements the shared-secret
    /// path since remote key fetch is out of this crate's scope (spec section 1).
    pub jwt_secret: Option<String>,
}

impl AuthConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let mode = match env_var_or("DYNMCP_AUTH_MODE", "none").as_str() {
            "jwt" => AuthMode::Jwt,
            _ => AuthMode::None,
        };
        Self {
            mode,
            jwks_url: env::var("DYNMCP_AUTH_JWKS_URL").ok(),
            issuer: env::var("DYNMCP_AUTH_ISSUER").ok(),
            audience: env::var("DYNMCP_AUTH_AUDIENCE").ok(),
            required_scopes: env::var("DYNMCP_AUTH_SCOPES")
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect())
                .unwrap_or_default(),
            jwt_secret: env::var("DYNMCP_AUTH_JWT_SECRET").ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub enabled: bool,
    pub path: String,
    pub max_event_bytes: usize,
    pub max_file_bytes: u64,
    pub max_files: usize,
}

impl AuditConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            enabled: env_parse_or("DYNMCP_AUDIT_ENABLED", true),
            path: env_var_or("DYNMCP_AUDIT_PATH", "audit.log"),
            max_event_bytes: env_parse_or("DYNMCP_AUDIT_MAX_EVENT_BYTES", 32_768),
            max_file_bytes: env_parse_or("DYNMCP_AUDIT_MAX_FILE_BYTES", 10_000_000),
            max_files: env_parse_or("DYNMCP_AUDIT_MAX_FILES", 5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub transport: Transport,
    pub profile: FeatureProfile,
    pub http: HttpConfig,
    pub registry: RegistryConfig,
    pub sql: SqlConfig,
    pub sandbox: SandboxConfig,
    pub guard: GuardConfig,
    pub auth: AuthConfig,
    pub audit: AuditConfig,
}

impl ServerConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let transport = match env_var_or("DYNMCP_TRANSPORT", "http").as_str() {
            "stdio" => Transport::Stdio,
            _ => Transport::Http,
        };
        let profile = match env_var_or("DYNMCP_PROFILE", "mvp").as_str() {
            "enterprise" => FeatureProfile::Enterprise,
            _ => FeatureProfile::Mvp,
        };
        Self {
            transport,
            profile,
            http: HttpConfig::from_env(),
            registry: RegistryConfig::from_env(),
            sql: SqlConfig::from_env(),
            sandbox: SandboxConfig::from_env(),
            guard: GuardConfig::from_env(),
            auth: AuthConfig::from_env(),
            audit: AuditConfig::from_env(),
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "transport={:?} profile={:?} registry_backend={:?} sandbox_backend={:?} http_port={}",
            self.transport, self.profile, self.registry.backend, self.sandbox.backend, self.http.port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_is_clamped() {
        let mut cfg = HttpConfig::from_env();
        cfg.session_ttl_seconds = 3;
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
        cfg.session_ttl_seconds = 1_000;
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(30));
    }
}
