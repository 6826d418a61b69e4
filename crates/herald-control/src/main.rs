use std::sync::Arc;
use std::time::Duration;

use herald_agent::{AgentSettings, JobLauncher, JobRegistry, StaleSweeper, TemplateSet};
use herald_control::config::ControlConfig;
use herald_control::credentials::FileCredentialStore;
use herald_control::state::AppState;
use herald_control::{routes, telemetry};

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_file_dir = herald_agent::settings::env_path("HERALD_LOG_FILE_DIR");
    let _log_guard = telemetry::init_tracing(log_file_dir.as_deref())?;

    let config = ControlConfig::from_env()?;
    let settings = AgentSettings::from_env();
    tracing::info!(
        storage_root = %settings.storage_root.display(),
        scratch_dir = %settings.scratch_dir.display(),
        script_dir = %settings.script_dir.display(),
        program = %settings.program,
        "agent settings loaded"
    );

    let registry = JobRegistry::new(settings.kill_grace);
    let templates = TemplateSet::builtin(&settings);
    let shutdown_wait = settings.kill_grace + Duration::from_secs(5);
    let launcher = JobLauncher::new(registry.clone(), settings, templates);

    let sweeper = StaleSweeper::from_env(registry.clone());
    tracing::info!(max_age_secs = sweeper.max_age().as_secs(), "stale sweeper enabled");
    let sweeper_task = sweeper.spawn();

    let state = AppState {
        launcher,
        credentials: Arc::new(FileCredentialStore::new(&config.credentials_dir)),
        config: Arc::new(config.clone()),
    };
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "herald-control HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper_task.abort();
    let stopped = registry.shutdown(shutdown_wait).await;
    tracing::info!(stopped, "all jobs stopped");
    Ok(())
}
