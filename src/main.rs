use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use quiz_forge::api::build_router;
use quiz_forge::config::{LlmConfig, ServiceConfig};
use quiz_forge::generation::{AnthropicGenerator, QuizGenerationJob};
use quiz_forge::store::{LibSqlBackend, TaskStore};
use quiz_forge::tasks::{ProgressHub, TaskRunner, TaskSupervisor, recover_tasks};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = ServiceConfig::from_env().context("Invalid service configuration")?;

    // Initialize tracing; the guard flushes the writer on exit
    let (writer, _log_guard) = match &config.log_dir {
        Some(dir) => tracing_appender::non_blocking(tracing_appender::rolling::daily(
            dir,
            "quiz-forge.log",
        )),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(writer)
        .init();

    let llm_config = LlmConfig::from_env().context("Invalid LLM configuration")?;

    eprintln!("📝 Quiz Forge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Task API: http://0.0.0.0:{}/api/tasks", config.port);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );

    // ── Task orchestration ───────────────────────────────────────────────
    let generator = Arc::new(AnthropicGenerator::new(&llm_config)?);
    let runner = TaskRunner::new(
        Arc::clone(&store),
        Arc::new(TaskSupervisor::new()),
        ProgressHub::with_capacity(config.subscriber_capacity),
        Arc::new(QuizGenerationJob::new(generator)),
    );

    // ── Startup Recovery ─────────────────────────────────────────────────
    let report = recover_tasks(store.as_ref(), &runner).await;
    if !report.relaunched.is_empty() || report.left_paused > 0 {
        eprintln!(
            "   Recovered {} tasks ({} paused awaiting resume)",
            report.relaunched.len(),
            report.left_paused
        );
    }

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = build_router(Arc::clone(&runner), config.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.port))?;
    info!(port = config.port, "Task server started");

    // Progress streams stay open until the hub closes them, so the runner
    // shuts down before axum waits for connections to drain.
    let shutdown_runner = Arc::clone(&runner);
    let grace = config.shutdown_grace;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown_runner.shutdown(grace).await;
        })
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}
