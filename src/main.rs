//! Ingress proxy
//!
//! ```text
//!                      ┌──────────────────────────────────────────────────┐
//!                      │                     INGRESS                      │
//!   Client request     │  ┌──────────┐   ┌───────────┐   ┌─────────────┐  │
//!   ───────────────────┼─▶│ listener │──▶│ admission │──▶│   planner   │  │
//!                      │  └──────────┘   └───────────┘   └──────┬──────┘  │
//!                      │                                        ▼         │
//!   Client response    │  ┌──────────┐   ┌───────────┐   ┌─────────────┐  │    Node 1..N
//!   ◀──────────────────┼──│ response │◀──│ breaker   │◀──│ forwarders  │◀─┼────────────
//!                      │  └──────────┘   └───────────┘   └─────────────┘  │
//!                      └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use ingress_proxy::config::load_config;
use ingress_proxy::lifecycle::{signals, startup, Shutdown};
use ingress_proxy::net::listener;
use ingress_proxy::IngressServer;

/// Upgrade relays get this long to finish after the server stops.
const RELAY_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "ingress-proxy", version, about = "HTTP/WebSocket ingress for a node cluster")]
struct Args {
    /// Path to a TOML config file; INGRESS_* variables override it.
    #[arg(short, long, env = "INGRESS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ingress-proxy: {}", e);
            std::process::exit(1);
        }
    };

    startup::init_observability(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ingress-proxy starting");

    let listener = match listener::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Listener failed");
            std::process::exit(1);
        }
    };

    let server = IngressServer::new(config);
    let state = server.state();
    startup::announce(&state);

    let shutdown = Shutdown::new();
    signals::spawn_signal_handler(shutdown.clone());
    server.run(listener, shutdown.subscribe()).await?;

    state.relays.close_all();
    let remaining = state.relays.drain(RELAY_GRACE).await;
    if remaining > 0 {
        tracing::warn!(remaining, "Relays still open at exit");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
