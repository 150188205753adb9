//! Quill collaboration server.
//!
//! Serves the WebSocket sync protocol and the HTTP side channel. All
//! settings come from `QUILL_*` environment variables; logging follows
//! `RUST_LOG` and defaults to `info`.

use log::{error, info};
use std::process::ExitCode;

use quill_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting Quill server...");
    info!("  WebSocket sync:  ws://{}", config.bind_addr);
    info!("  HTTP API:        http://{}", config.http_addr);
    info!("  Room cleanup grace: {:?}", config.cleanup_grace);

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
    ExitCode::SUCCESS
}
