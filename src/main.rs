use clap::Parser;
use echochat::config::SignalingConfig;
use echochat::directory::PermissiveDirectory;
use echochat::server::{CallService, Coordinator, MemoryCallStore, PresenceRegistry};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Standalone EchoChat signaling server.
#[derive(Parser, Debug)]
#[command(name = "echochat-server")]
struct Args {
    /// Address to listen on for WebSocket connections.
    #[arg(long, default_value = "127.0.0.1:9443")]
    listen: String,

    /// Seconds between stale-call expiry sweeps.
    #[arg(long, default_value_t = 30)]
    sweep_interval: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                chrono::Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let config = SignalingConfig::default();
        let store = Arc::new(MemoryCallStore::new());
        let directory = Arc::new(PermissiveDirectory);
        let service = CallService::new(config.clone(), store, directory);
        let registry = Arc::new(PresenceRegistry::new());
        let coordinator = Coordinator::new(config, registry, service.clone());

        let listener = TcpListener::bind(&args.listen).await?;

        // Background sweep resolving call records orphaned by crashed
        // clients or lost relay acks.
        let sweep_service = service.clone();
        let sweep_interval = Duration::from_secs(args.sweep_interval.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = sweep_service.expire_stale().await {
                    error!("Expiry sweep failed: {e}");
                }
            }
        });

        tokio::select! {
            _ = coordinator.serve(listener) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
            }
        }
        Ok(())
    })
}
