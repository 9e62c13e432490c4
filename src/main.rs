/// Trove - self-hosted personal file storage server
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use trove::{jobs::JobScheduler, server, AppContext, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first: it decides the log format
    let config = ServerConfig::from_env().context("invalid configuration")?;

    init_tracing(config.logging.json);
    print_banner();

    // Create application context
    let ctx = Arc::new(
        AppContext::new(config)
            .await
            .context("failed to initialise services")?,
    );

    let shutdown = CancellationToken::new();

    // Start background jobs
    let scheduler = Arc::new(JobScheduler::new(Arc::clone(&ctx), shutdown.child_token()));
    let jobs = scheduler.start();

    tokio::spawn(wait_for_signal(shutdown.clone()));

    // Start server
    let result = server::serve((*ctx).clone(), shutdown.clone()).await;

    shutdown.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            warn!("Background job ended abnormally: {}", e);
        }
    }
    ctx.store.close().await;
    info!("Shutdown complete");

    result.context("HTTP server failed")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trove=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn wait_for_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }
}

fn print_banner() {
    println!(
        r#"
  _
 | |_ _ __ _____   _____
 | __| '__/ _ \ \ / / _ \
 | |_| | | (_) \ V /  __/
  \__|_|  \___/ \_/ \___|

  Personal file storage v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
