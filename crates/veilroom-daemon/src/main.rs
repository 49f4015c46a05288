use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use veilroom_daemon::{sync_server, tor, Daemon, DaemonConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,veilroom_daemon=debug")),
        )
        .init();

    info!("Starting veilroom daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::from_env();
    info!(?config, "Loaded configuration");

    tokio::fs::create_dir_all(&config.base_dir).await?;

    // Hash the control password up front so it lands on the router's
    // command line.
    let hashed_pass = if config.use_control_pass {
        let password = control_password();
        Some(tor::hash_password(&config.tor_exe, &password).await?)
    } else {
        None
    };

    let args = tor::router_args(&config, hashed_pass.as_deref());
    let router = tor::launch(&config.tor_exe, &args, config.tor_log.as_deref()).await?;
    info!(pid = ?router.id(), "Onion router running");

    let daemon = Daemon::new(config.clone()).await?;
    let listener = TcpListener::bind(config.listen_addr).await?;

    tokio::select! {
        _ = sync_server::serve(listener, daemon.room_registry()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    router.kill().await?;
    Ok(())
}

fn control_password() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}
