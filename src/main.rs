//! Localrelay command line tool
//!
//! Starts every relay in a relays file and runs until Ctrl+C.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;

use localrelay::common::{init_logger, RelayError, Result};
use localrelay::config::{self, defaults};
use localrelay::{Relay, RelayManager, APP_NAME, VERSION};

/// Reverse relay for TCP, UDP, HTTP and HTTPS with SOCKS5 proxies
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Relays file (JSON)
    #[clap(short, long, default_value = defaults::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level, overrides the file
    #[clap(long)]
    log_level: Option<String>,

    /// Dial timeout in seconds for every relay, overrides the file
    #[clap(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = config::load_file(&args.config)?;

    let log_level = args.log_level.as_deref().unwrap_or(&file.log_level);
    init_logger(log_level);

    info!("Starting {} v{}", APP_NAME, VERSION);
    info!("Loaded {} relay(s) from {}", file.relays.len(), args.config.display());

    let manager = RelayManager::new();

    for mut relay_config in file.relays {
        if let Some(secs) = args.timeout.or(relay_config.timeout_secs).or(file.timeout_secs) {
            relay_config.timeout_secs = Some(secs);
        }

        let relay = match Relay::from_config(&relay_config) {
            Ok(relay) => relay,
            Err(e) => {
                error!("[{}] Invalid relay: {}", relay_config.name, e);
                continue;
            }
        };

        if let Err(e) = manager.start(relay).await {
            error!("[{}] Failed to start: {}", relay_config.name, e);
        }
    }

    if manager.names().is_empty() {
        return Err(RelayError::Config("no relay could be started".to_string()));
    }

    tokio::signal::ctrl_c().await?;
    warn!("Interrupted, stopping relays");

    match serde_json::to_string(&manager.status()) {
        Ok(status) => info!("Final status: {}", status),
        Err(e) => warn!("Failed to encode relay status: {}", e),
    }

    manager.stop_all().await;
    info!("All relays stopped");

    Ok(())
}
