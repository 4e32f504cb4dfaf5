// peer-upgrade daemon: serve our installers, discover peers, fetch newer ones.

use std::sync::Arc;

use anyhow::Context;
use peer_upgrade::config::{self, Config};
use peer_upgrade::{logging, MulticastTransport, UpgradeManager};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peer-upgrade {}", VERSION);
            return Ok(());
        }
    }

    logging::init_logging();
    let cfg = config::load().context("loading configuration")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let options = cfg.manager_options()?;
    let transport = MulticastTransport::bind(cfg.discovery_port)
        .await
        .with_context(|| format!("binding discovery port {}", cfg.discovery_port))?;
    let manager = UpgradeManager::new(options, Arc::new(transport))?;

    if let (Some(path), Some(version)) = (&cfg.apk_path, &cfg.apk_version) {
        manager
            .set_apk_info(path, version.clone())
            .await
            .with_context(|| format!("registering {}", path.display()))?;
    }

    let mut states = manager.subscribe_state();
    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            match serde_json::to_string(&state) {
                Ok(json) => info!(state = %json, "upgrade state"),
                Err(e) => warn!(error = %e, "upgrade state not serializable"),
            }
        }
    });

    manager.start_services().await?;
    info!(version = VERSION, "peer-upgrade running");
    shutdown_signal().await?;
    manager.stop_services().await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
