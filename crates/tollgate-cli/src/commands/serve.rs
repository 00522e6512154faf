//! `tollgate serve` -- run the guardrail proxy.
//!
//! Binds the configured address, mounts the per-provider routes, and
//! serves until Ctrl+C. In-flight requests are allowed to finish.
//!
//! # Example
//!
//! ```text
//! tollgate serve
//! tollgate serve --port 9100 --config /etc/tollgate/config.json
//! ```

use clap::Args;
use tracing::{info, warn};

use tollgate_types::config::Config;

/// Arguments for the `tollgate serve` subcommand.
#[derive(Args)]
pub struct ServeArgs {
    /// Bind address (overrides `server.host`).
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port (overrides `server.port`).
    #[arg(short, long)]
    pub port: Option<u16>,
}

/// Apply command-line overrides on top of the loaded config.
fn apply_overrides(args: ServeArgs, mut config: Config) -> Config {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config
}

/// Run the proxy until Ctrl+C.
pub async fn run(args: ServeArgs, config: Config) -> anyhow::Result<()> {
    let config = apply_overrides(args, config);

    if config.agents.is_empty() {
        warn!("no agents configured; requests will create per-client default agents");
    }
    if !config.classifier.enabled {
        warn!("trust classifier disabled; every request is treated as untrusted");
    }

    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    };

    tollgate_services::serve(&config, shutdown).await?;
    Ok(())
}
