use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use devlease_server::config::{Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devlease_server=info,devlease=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args)?;
    let app = devlease_server::build_app(&config)?;

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;

    info!("devlease-server listening on http://{}", config.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("shutting down");
        })
        .await?;
    Ok(())
}
