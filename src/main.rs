use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use toxicity_worker::{
    app::{ComponentRegistry, build_router},
    config::Config,
    scheduler::spawn_interval_daemon,
};

/// Alt toxicity classification worker.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run a single pipeline pass and exit instead of serving.
    #[arg(long, env = "TOXICITY_RUN_ONCE")]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(String::as_str)
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let cli = Cli::parse();

    // Tracing initialization is handled by Telemetry::new()
    let config = Config::from_env().context("failed to load configuration")?;
    let bind_addr = config.http_bind();
    let run_interval = config.run_interval();
    let registry =
        ComponentRegistry::build(config).context("failed to build component registry")?;
    let scheduler = registry.scheduler().clone();

    if cli.once {
        let report = scheduler.run_exclusive().await;
        info!(
            run_id = %report.run_id,
            persisted = report.total_persisted(),
            report = %serde_json::to_string(&report.tables).unwrap_or_default(),
            "single pipeline run finished"
        );
        return Ok(());
    }

    let daemon = spawn_interval_daemon(scheduler, run_interval);
    let router = build_router(registry);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;

    info!(%bind_addr, interval_secs = run_interval.as_secs(), "listening");

    if let Err(error) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        warn!(error = %error, "server exited with error");
    }
    daemon.abort();

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
