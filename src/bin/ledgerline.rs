//! Ledgerline broker.
//!
//! ## Running
//!
//! Three brokers on one machine (in separate terminals):
//! ```bash
//! BROKER_ID=0 BOOTSTRAP=true DATA_DIR=/tmp/ll0 cargo run
//! BROKER_ID=1 DATA_DIR=/tmp/ll1 CLIENT_PORT=9192 REPLICATION_PORT=9193 RAFT_PORT=9194 \
//!   GOSSIP_PORT=9195 SEEDS=127.0.0.1:9095 cargo run
//! BROKER_ID=2 DATA_DIR=/tmp/ll2 CLIENT_PORT=9292 REPLICATION_PORT=9293 RAFT_PORT=9294 \
//!   GOSSIP_PORT=9295 SEEDS=127.0.0.1:9095 cargo run
//! ```
//!
//! Set `LOG_FORMAT=json` for log aggregators and `PROFILE=production` for
//! quorum acknowledgements and periodic fsync.

use ledgerline::cluster::{Broker, BrokerConfig};
use ledgerline::telemetry::{LogFormat, init_logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;

    let config = BrokerConfig::from_env()?;
    let broker = Broker::start(config).await?;
    info!(
        broker_id = broker.broker_id(),
        endpoints = ?broker.endpoints(),
        "Broker ready"
    );

    wait_for_signal().await?;
    info!("Received shutdown signal");

    if let Err(e) = broker.shutdown().await {
        error!(error = %e, "Broker did not shut down cleanly");
        return Err(e.into());
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
