// Wi-Fi radio-resource daemon: drives the radio service from bridge events.

mod bridge;
mod config;

use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("wlan-linux {}", VERSION);
            return Ok(());
        }
    }

    let cfg = config::load();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(filter)
        .init();
    info!(version = VERSION, bridge = %cfg.bridge_socket.display(), "starting");

    // The service is single-threaded; everything runs on one task.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        tokio::select! {
            r = bridge::run(cfg) => r,
            r = shutdown_signal() => {
                info!("shutting down");
                r
            }
        }
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown, runtime and tasks exit; systemd may restart if configured.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
