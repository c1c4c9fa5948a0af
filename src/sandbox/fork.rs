// ABOUTME: Forked-process sandbox backend — fallback when no container daemon is available
// ABOUTME: Same harness as the container backend; dynamic dependencies are not supported

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::{AppError, ErrorKind};
use crate::model::DynamicTool;
use crate::sandbox::harness::{encode_args, render_runner_module, render_tool_module};
use crate::sandbox::output::{clip_output, parse_output, ParsedOutput};
use crate::sandbox::{check_policy, effective_timeout, ExecutionResult, SandboxExecutor};

pub struct ForkExecutor {
    config: SandboxConfig,
}

impl ForkExecutor {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// 75% of the configured container memory hint, clamped to [128, 4096]
    /// MiB (spec section 4.3, "Forked-process backend").
    #[must_use]
    pub fn memory_hint_mb(&self) -> u64 {
        ((self.config.memory_mb * 3) / 4).clamp(128, 4096)
    }
}

#[async_trait]
impl SandboxExecutor for ForkExecutor {
    fn supports_dependencies(&self) -> bool {
        false
    }

    async fn execute(&self, tool: &DynamicTool, args: Value) -> Result<ExecutionResult, AppError> {
        check_policy(tool, &self.config)?;
        if !tool.dependencies.is_empty() {
            return Err(AppError::new(
                ErrorKind::SandboxPolicy,
                "the fork backend does not support dynamic dependencies",
            ));
        }

        let workspace = TempDir::new()?;
        tokio::fs::write(workspace.path().join("tool.mjs"), render_tool_module(&tool.code)).await?;
        tokio::fs::write(workspace.path().join("runner.mjs"), render_runner_module()).await?;

        let timeout = effective_timeout(tool, &self.config);
        let start = Instant::now();

        let mut command = Command::new("node");
        command
            .arg(workspace.path().join("runner.mjs"))
            .current_dir(workspace.path())
            .env_clear()
            .env("DYNMCP_ARGS_B64", encode_args(&args))
            .env("NODE_OPTIONS", format!("--max-old-space-size={}", self.memory_hint_mb()))
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Ok(tz) = std::env::var("TZ") {
            command.env("TZ", tz);
        }

        let mut child = command.spawn().map_err(|e| {
            AppError::new(ErrorKind::SandboxExec, format!("failed to spawn sandbox process: {e}"))
        })?;
        let mut stdout_pipe = child.stdout.take().expect("piped stdout");
        let mut stderr_pipe = child.stderr.take().expect("piped stderr");

        let run = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (status, _, _) = tokio::join!(
                child.wait(),
                stdout_pipe.read_to_end(&mut stdout_buf),
                stderr_pipe.read_to_end(&mut stderr_buf),
            );
            (status, stdout_buf, stderr_buf)
        };

        let (_status, stdout_buf, stderr_buf) = match tokio::time::timeout(timeout, run).await {
            Ok((status, stdout_buf, stderr_buf)) => match status {
                Ok(status) => (status, stdout_buf, stderr_buf),
                Err(e) => {
                    return Err(AppError::new(ErrorKind::SandboxExec, format!("sandbox process failed: {e}")))
                }
            },
            Err(_) => {
                let _ = child.kill().await;
                return Err(AppError::new(
                    ErrorKind::SandboxTimeout,
                    format!("sandbox execution exceeded {}ms", timeout.as_millis()),
                ));
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let mut combined = String::from_utf8_lossy(&stdout_buf).into_owned();
        combined.push_str(&String::from_utf8_lossy(&stderr_buf));

        match parse_output(&combined, self.config.max_output_bytes) {
            ParsedOutput::Success { result, .. } => Ok(ExecutionResult {
                ok: true,
                result: Some(result),
                error: None,
                duration_ms,
                raw_output: None,
            }),
            ParsedOutput::Failure { error, .. } => Ok(ExecutionResult {
                ok: false,
                result: None,
                error: Some(error),
                duration_ms,
                raw_output: None,
            }),
            ParsedOutput::NoMarker { raw } => Ok(ExecutionResult {
                ok: true,
                result: None,
                error: None,
                duration_ms,
                raw_output: Some(clip_output(&raw, self.config.max_output_bytes)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SandboxConfig {
        SandboxConfig {
            backend: crate::config::SandboxBackendMode::Fork,
            memory_mb: 256,
            cpu_limit: 1.0,
            max_dependencies: 4,
            max_output_bytes: 65_536,
            max_timeout_ms: 10_000,
            allowed_images: vec![],
            blocked_packages: vec![],
            session_ttl_seconds: 300,
            max_sessions: 4,
        }
    }

    #[test]
    fn memory_hint_is_clamped() {
        let mut cfg = config();
        cfg.memory_mb = 64;
        let exec = ForkExecutor::new(cfg);
        assert_eq!(exec.memory_hint_mb(), 128);

        let mut cfg = config();
        cfg.memory_mb = 8192;
        let exec = ForkExecutor::new(cfg);
        assert_eq!(exec.memory_hint_mb(), 4096);
    }

    #[tokio::test]
    async fn rejects_tools_declaring_dependencies() {
        use crate::model::{Dependency, DynamicTool};
        use chrono::Utc;

        let exec = ForkExecutor::new(config());
        let tool = DynamicTool {
            name: "dynamic.t".into(),
            title: None,
            description: "d".into(),
            image: "node:20".into(),
            timeout_ms: 5000,
            dependencies: vec![Dependency {
                name: "zod".into(),
                version: "^4".into(),
            }],
            code: "return 1;".into(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 1,
        };
        let err = exec.execute(&tool, serde_json::json!({})).await.unwrap_err();
        assert!(err.message.contains("does not support dynamic dependencies"));
    }
}
