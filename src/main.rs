use std::time::Duration;

use chatgate::{app, build_state_from_env};
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads RUST_LOG; defaults to info.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let state = build_state_from_env()?;
    let limiter = state.rate_limiter.clone();
    limiter.start(Duration::from_millis(state.config.rate_sweep_ms));
    tracing::info!(
        limit = state.config.rate_limit.limit,
        window_ms = state.config.rate_limit.window_ms,
        sweep_ms = state.config.rate_sweep_ms,
        "rate limiter started"
    );
    let addr: std::net::SocketAddr = ([0, 0, 0, 0], state.config.port).into();
    let app = app(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    limiter.stop();
    tracing::info!("rate limiter stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
