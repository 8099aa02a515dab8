use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sift::config::Config;
use sift::dispatch::ollama::OllamaClient;
use sift::form::FormDefaults;
use sift::server::{self, AppState};
use sift::summarize::Pipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // .env next to the binary first, then the working directory.
    let beside_exe = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
        .filter(|path| path.exists());
    match beside_exe {
        Some(path) => {
            dotenvy::from_path(&path).ok();
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = Config::load()?;
    tracing::info!(
        listen = %config.server.listen_addr,
        backend = %config.backend.base_url,
        model = %config.backend.default_model,
        "sift starting"
    );

    let backend = Arc::new(OllamaClient::new(&config.ollama_settings())?);
    let pipeline = Pipeline::new(backend, config.pipeline_settings());
    let state = AppState::new(
        pipeline,
        FormDefaults::from_config(&config),
        config.extract_limits(),
    );

    let listener = TcpListener::bind(&config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            shutdown.cancel();
        }
    });

    server::serve(listener, state, shutdown)
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    tracing::info!("sift shutting down");
    Ok(())
}
