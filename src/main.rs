use anyhow::Result;
use hook_relay::{RelayConfig, TcpRelay};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::from_env()?;

    // Prefer RUST_LOG, fall back to RELAY_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let shutdown = CancellationToken::new();
    spawn_signal_handlers(&shutdown);

    let relay = TcpRelay::bind(config).await?;
    relay.start(shutdown).await?;

    info!("Bye.");
    Ok(())
}

fn spawn_signal_handlers(shutdown: &CancellationToken) {
    let on_ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C.");
            return;
        }
        on_ctrl_c.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let on_terminate = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    terminate.recv().await;
                    on_terminate.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to listen for SIGTERM."),
            }
        });
    }
}
