// ABOUTME: Container sandbox backend (default) — runs the harness under the exact security profile
// ABOUTME: from spec section 4.3: read-only root, tmpfs /tmp, dropped caps, PID/mem/cpu limits

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::service::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use serde_json::Value;
use tempfile::TempDir;
use tracing::warn;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{AppError, ErrorKind};
use crate::model::DynamicTool;
use crate::sandbox::harness::{encode_args, render_manifest, render_runner_module, render_tool_module};
use crate::sandbox::output::{clip_output, parse_output, ParsedOutput};
use crate::sandbox::{check_policy, effective_timeout, ExecutionResult, SandboxExecutor};

pub struct ContainerExecutor {
    config: SandboxConfig,
}

impl ContainerExecutor {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn host_config(&self, network_mode: &str) -> HostConfig {
        HostConfig {
            readonly_rootfs: Some(true),
            tmpfs: Some(HashMap::from([(
                "/tmp".to_owned(),
                "rw,noexec,nosuid,size=67108864".to_owned(),
            )])),
            cap_drop: Some(vec!["ALL".to_owned()]),
            security_opt: Some(vec!["no-new-privileges".to_owned()]),
            pids_limit: Some(256),
            memory: Some((self.config.memory_mb as i64) * 1024 * 1024),
            nano_cpus: Some((self.config.cpu_limit * 1_000_000_000.0) as i64),
            network_mode: Some(network_mode.to_owned()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxExecutor for ContainerExecutor {
    fn supports_dependencies(&self) -> bool {
        true
    }

    async fn execute(&self, tool: &DynamicTool, args: Value) -> Result<ExecutionResult, AppError> {
        check_policy(tool, &self.config)?;

        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| AppError::new(ErrorKind::SandboxExec, format!("docker connect failed: {e}")))?;

        let workspace = TempDir::new()?;
        tokio::fs::write(workspace.path().join("tool.mjs"), render_tool_module(&tool.code)).await?;
        tokio::fs::write(workspace.path().join("runner.mjs"), render_runner_module()).await?;
        tokio::fs::write(workspace.path().join("package.json"), render_manifest(tool)).await?;

        let has_deps = !tool.dependencies.is_empty();
        let network_mode = if has_deps { "bridge" } else { "none" };

        let name = format!("dynmcp-exec-{}", Uuid::new_v4());
        let bind = format!("{}:/workspace", workspace.path().to_string_lossy());
        let mut host_config = self.host_config(network_mode);
        host_config.binds = Some(vec![bind]);

        let shell_cmd = if has_deps {
            "cd /workspace && npm install --no-audit --no-fund --omit=dev >/dev/null 2>&1; node runner.mjs"
        } else {
            "cd /workspace && node runner.mjs"
        };

        let container_config = Config {
            image: Some(tool.image.clone()),
            cmd: Some(vec!["/bin/sh".to_owned(), "-c".to_owned(), shell_cmd.to_owned()]),
            env: Some(vec![
                format!("DYNMCP_ARGS_B64={}", encode_args(&args)),
                "NODE_ENV=production".to_owned(),
            ]),
            working_dir: Some("/workspace".to_owned()),
            user: Some("1000:1000".to_owned()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| AppError::new(ErrorKind::SandboxExec, format!("failed to create container: {e}")))?;

        let start = Instant::now();
        let timeout = effective_timeout(tool, &self.config);

        let run = async {
            docker
                .start_container(&created.id, None::<bollard::container::StartContainerOptions<String>>)
                .await
                .map_err(|e| AppError::new(ErrorKind::SandboxExec, format!("failed to start container: {e}")))?;

            let mut wait_stream = docker.wait_container(&created.id, None::<WaitContainerOptions<String>>);
            while wait_stream.next().await.is_some() {}

            let mut logs_stream = docker.logs(
                &created.id,
                Some(LogsOptions::<String> {
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let mut combined = String::new();
            while let Some(chunk) = logs_stream.next().await {
                if let Ok(log) = chunk {
                    combined.push_str(&log.to_string());
                }
            }
            Ok::<String, AppError>(combined)
        };

        let outcome = tokio::time::timeout(timeout, run).await;

        let cleanup = docker.remove_container(
            &created.id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        );
        if let Err(e) = cleanup.await {
            warn!("failed to remove sandbox container {}: {e}", created.id);
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        let combined = match outcome {
            Ok(Ok(combined)) => combined,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(AppError::new(
                    ErrorKind::SandboxTimeout,
                    format!("sandbox execution exceeded {}ms", timeout.as_millis()),
                ));
            }
        };

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
