// src/main.rs

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod orchestrator;
mod server;
mod sys;

use crate::config::{AgentConfig, LogFormat};
use crate::orchestrator::{Orchestrator, Settings};
use crate::server::DevCenterAgentService;
use crate::server::devcenter_agent::environment_agent_server::EnvironmentAgentServer;
use crate::sys::container::DockerComposeBackend;
use crate::sys::database::MongoBackend;
use crate::sys::dns::DnsmasqBackend;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devcenter_agent=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining requests");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ==============================================================================
    // 1. Configuration & Environment (SLA Layer)
    // ==============================================================================

    // Refuse to start on any invalid setting; nothing has been touched yet.
    let config = AgentConfig::load()?;
    init_tracing(config.log_format);

    let socket_path = config.socket_path.clone();
    let socket_dir = socket_path
        .parent()
        .ok_or("socket path has no parent directory")?
        .to_path_buf();

    // ==============================================================================
    // 2. Backends & Orchestrator
    // ==============================================================================

    let settings = Settings::from_config(&config);
    let dns = Arc::new(DnsmasqBackend::new(&config.dns));
    let containers = Arc::new(DockerComposeBackend::new(
        &config.container,
        config.database.host.clone(),
        config.database.auth_db.clone(),
    ));
    let database = Arc::new(MongoBackend::new(config.database));
    let orchestrator = Orchestrator::new(dns, database, containers, settings);

    // A backend being down at boot is not fatal; unknown environments are
    // looked up live on first use.
    match orchestrator.adopt().await {
        Ok(adopted) => info!(adopted, "existing environments registered"),
        Err(e) => warn!(error = %e, "could not read backends at startup"),
    }

    // ==============================================================================
    // 3. Secure Socket Initialization
    // ==============================================================================

    if !socket_dir.exists() {
        fs::create_dir_all(&socket_dir)?;
    }

    // Clean up a stale socket from a previous crash/run
    if socket_path.exists() {
        fs::remove_file(&socket_path)?;
    }

    let uds = UnixListener::bind(&socket_path)?;

    // 🛡️ SECURITY BOUNDARY: 0o660 lets root and the operator group connect;
    // the per-call peer uid check narrows it further.
    let mut perms = fs::metadata(&socket_path)?.permissions();
    perms.set_mode(0o660);
    fs::set_permissions(&socket_path, perms)?;

    let uds_stream = UnixListenerStream::new(uds);

    // ==============================================================================
    // 4. Service Start
    // ==============================================================================

    let agent_service = DevCenterAgentService::new(orchestrator, config.expected_api_uid);

    info!(socket = %socket_path.display(), zone = %config.dns.zone, subnet = %config.subnet, "⚙️ devcenter agent starting");

    Server::builder()
        .add_service(EnvironmentAgentServer::new(agent_service))
        .serve_with_incoming_shutdown(uds_stream, shutdown_signal())
        .await?;

    let _ = fs::remove_file(&socket_path);
    info!("devcenter agent stopped");
    Ok(())
}
