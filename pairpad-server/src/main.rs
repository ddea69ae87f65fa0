//! Pairpad relay server.
//!
//! Serves WebSocket rooms at `ws://<host>:<port>/<room>` and a plain-text
//! liveness response to ordinary HTTP requests on the same port.
//!
//! Configuration comes from the environment: `PORT`, `RELAY_HOST`,
//! `RELAY_QUEUE_CAPACITY`, `RELAY_HEARTBEAT_SECS`, `RELAY_IDLE_TIMEOUT_SECS`.
//! Log verbosity follows `RUST_LOG` (default `info`).

use log::{error, info};

use pairpad_relay::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!("Starting Pairpad relay on {}", config.bind_addr);

    let server = RelayServer::bind(config).await?;
    let shutdown = server.shutdown_trigger();
    let relay = server.relay();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                if let Ok(stats) = relay.stats().await {
                    info!(
                        "Relayed {} events to {} recipients ({} superseded, {} dropped)",
                        stats.events_relayed, stats.deliveries, stats.superseded, stats.dropped
                    );
                }
                shutdown.trigger();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {e}"),
        }
    });

    server.run().await?;
    Ok(())
}
