// Photo-to-poetry backend: captions uploaded images and turns captions into poems
// by calling out to external generator processes.

use anyhow::Context;
use photo_poetry::{build_state, config::Config, routes};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("photo_poetry=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    tracing::info!(
        uploads_dir = %config.uploads_dir.display(),
        caption_command = %config.caption_command.program,
        poem_command = %config.poem_command.program,
        timeout = ?config.generator_timeout,
        max_concurrent = config.max_concurrent_generations,
        "configuration loaded"
    );

    let state = build_state(&config);
    let app = routes::router(state, config.allowed_origin.clone(), config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    tracing::info!(addr = %config.bind_addr, base_url = %config.public_base_url, "backend running");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    tracing::info!("backend stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
