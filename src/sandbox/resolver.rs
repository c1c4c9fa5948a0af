// ABOUTME: Picks the container or fork sandbox backend based on configuration and probing
// ABOUTME: `auto` mode probes container daemon availability, caching the result for 30s

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::{SandboxBackendMode, SandboxConfig};
use crate::sandbox::fork::ForkExecutor;
use crate::sandbox::SandboxExecutor;

const PROBE_CACHE_TTL: Duration = Duration::from_secs(30);

struct ProbeCache {
    last_probe: Option<(Instant, bool)>,
}

/// Resolves which `SandboxExecutor` backend to use for a given configuration,
/// probing container daemon availability for `auto` mode (spec section 4.3
/// "Backend selection").
pub struct EngineResolver {
    config: SandboxConfig,
    probe_cache: Mutex<ProbeCache>,
}

impl EngineResolver {
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            probe_cache: Mutex::new(ProbeCache { last_probe: None }),
        }
    }

    /// Returns the concrete executor to use right now.
    pub async fn resolve(&self) -> Arc<dyn SandboxExecutor> {
        match self.config.backend {
            SandboxBackendMode::Fork => Arc::new(ForkExecutor::new(self.config.clone())),
            #[cfg(feature = "container")]
            SandboxBackendMode::Container => {
                Arc::new(crate::sandbox::container::ContainerExecutor::new(self.config.clone()))
            }
            #[cfg(not(feature = "container"))]
            SandboxBackendMode::Container => Arc::new(ForkExecutor::new(self.config.clone())),
            SandboxBackendMode::Auto => {
                if self.container_available().await {
                    #[cfg(feature = "container")]
                    {
                        Arc::new(crate::sandbox::container::ContainerExecutor::new(self.config.clone()))
                    }
                    #[cfg(not(feature = "container"))]
                    {
                        Arc::new(ForkExecutor::new(self.config.clone()))
                    }
                } else {
                    Arc::new(ForkExecutor::new(self.config.clone()))
                }
            }
        }
    }

    async fn container_available(&self) -> bool {
        let mut cache = self.probe_cache.lock().await;
        if let Some((checked_at, available)) = cache.last_probe {
            if checked_at.elapsed() < PROBE_CACHE_TTL {
                return available;
            }
        }
        let available = probe_container_daemon().await;
        cache.last_probe = Some((Instant::now(), available));
        available
    }
}

#[cfg(feature = "container")]
async fn probe_container_daemon() -> bool {
    use bollard::Docker;
    match Docker::connect_with_local_defaults() {
        Ok(docker) => docker.ping().await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(not(feature = "container"))]
async fn probe_container_daemon() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: SandboxBackendMode) -> SandboxConfig {
        SandboxConfig {
            backend: mode,
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

    #[tokio::test]
    async fn fork_mode_resolves_without_probing() {
        let resolver = EngineResolver::new(config(SandboxBackendMode::Fork));
        let executor = resolver.resolve().await;
        assert!(!executor.supports_dependencies());
    }
}
