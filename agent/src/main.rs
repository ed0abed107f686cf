// agent/src/main.rs

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing_subscriber::EnvFilter;

use iac_agent::config::AgentConfig;
use iac_agent::dispatcher::Dispatcher;
use iac_agent::orchestrator::Orchestrator;
use iac_agent::repository::{MemoryCatalog, MemoryDeploymentRepository};
use iac_agent::server;
use iac_agent::service::DeploymentService;
use iac_agent::sys::aws_cli::AwsCli;
use iac_agent::sys::credentials::AwsStsBroker;
use iac_agent::sys::sandbox::SandboxManager;
use iac_agent::sys::store::{AwsS3Store, SourceStore};
use iac_agent::sys::tool::{TerraformCli, ToolInvoker};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("IAC_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment (SLA Layer)
    // ==============================================================================

    init_tracing();
    let config = AgentConfig::load()?;

    // ==============================================================================
    // 2. Secure Socket Initialization
    // ==============================================================================

    let socket_path = config.socket_path.as_path();
    if let Some(socket_dir) = socket_path.parent() {
        fs::create_dir_all(socket_dir)?;
    }

    // Clean up existing socket file if it exists from a previous crash/run
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    // 🛡️ SECURITY BOUNDARY: Restrict socket permissions
    // 0o660 (rw-rw----): the agent and the API's group only.
    let mut perms = fs::metadata(socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(socket_path, perms)?;

    // ==============================================================================
    // 3. Dependency Injection & Service Start
    // ==============================================================================

    fs::create_dir_all(&config.sandbox_root)?;
    let aws = AwsCli::new(&config.aws_binary, &config.region).with_call_timeout(config.aws_timeout);
    let deployments = Arc::new(MemoryDeploymentRepository::new());
    let catalog = Arc::new(MemoryCatalog::new());

    let orchestrator = Arc::new(Orchestrator::new(
        &config.source_bucket,
        SourceStore::new(Arc::new(AwsS3Store::new(aws.clone()))),
        Arc::new(AwsStsBroker::new(aws, &config.session_name)),
        SandboxManager::new(&config.sandbox_root),
        ToolInvoker::new(Arc::new(
            TerraformCli::new(&config.tool_binary, &config.region)
                .with_stage_timeout(config.stage_timeout),
        )),
        deployments.clone(),
        catalog.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::spawn(
        orchestrator.clone(),
        config.worker_count,
        config.queue_capacity,
    ));
    let service = Arc::new(DeploymentService::new(
        orchestrator,
        dispatcher.clone(),
        deployments,
        catalog.clone(),
        catalog,
    ));

    tracing::info!(
        socket = %socket_path.display(),
        bucket = %config.source_bucket,
        workers = config.worker_count,
        stage_timeout = ?config.stage_timeout,
        "⚙️ IaC agent starting"
    );

    server::serve(listener, service, config.expected_api_uid, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await;

    // Queued and running jobs finish before the process exits.
    dispatcher.shutdown().await;
    let _ = fs::remove_file(socket_path);
    tracing::info!("IaC agent stopped");
    Ok(())
}
