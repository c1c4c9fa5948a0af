// ABOUTME: Binary entrypoint — wires configuration, registry, guard, sandbox and HTTP transport
// ABOUTME: CLI/argv parsing and dotenv loading are external concerns; everything is env-driven

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use dynmcp_server::audit::AuditLogger;
use dynmcp_server::change_bus::ChangeBus;
use dynmcp_server::config::ServerConfig;
use dynmcp_server::guard::ExecutionGuard;
use dynmcp_server::http::session::SessionTable;
use dynmcp_server::http::{self, AppState};
use dynmcp_server::logging::LoggingConfig;
use dynmcp_server::registry::factory::Registry;
use dynmcp_server::sandbox::resolver::EngineResolver;
use dynmcp_server::service::DynamicToolService;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let logging = LoggingConfig::from_env();
    logging.init().ok();

    let config = ServerConfig::from_env();
    info!(summary = %config.summary(), "starting dynamic tool MCP server");

    let change_bus = ChangeBus::new();
    let guard = Arc::new(ExecutionGuard::new(config.guard.clone()));
    let resolver = Arc::new(EngineResolver::new(config.sandbox.clone()));
    let audit = Arc::new(AuditLogger::new(config.audit.clone()).await?);
    let sessions = SessionTable::new(Duration::from_secs(config.http.session_ttl_seconds));

    let registry = Registry::connect(&config.registry, &config.sql, change_bus.clone()).await?;

    let service = DynamicToolService::new(
        registry,
        guard.clone(),
        resolver.clone(),
        sessions.clone(),
        change_bus,
        audit.clone(),
        config.registry.clone(),
    )
    .await?;

    let state = AppState::new(
        service,
        guard,
        resolver,
        audit,
        sessions,
        config.auth.clone(),
        config.http.clone(),
    );

    if let Err(err) = http::serve(state, http::shutdown_signal()).await {
        error!(error = %err.message, "server exited with an error");
        return Err(anyhow::anyhow!(err.message));
    }

    Ok(())
}
