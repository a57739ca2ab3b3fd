//! BitChat TCP Relay Hub
//!
//! A publicly reachable node that helps peers behind NAT find each other.
//! Clients register the network ids they serve; anyone connected can ask
//! which endpoints are registered for a network id. The hub only ever sees
//! network ids and endpoints, never chat content.
//!
//! Usage:
//!   relay-hub --bind 0.0.0.0:41734

use bitchat_net::tcp_relay::TcpRelayService;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "relay-hub", about = "BitChat TCP relay node")]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:41734")]
    bind: SocketAddr,

    /// Drop clients silent for this many seconds
    #[arg(long, default_value_t = 120)]
    idle_timeout: u64,

    /// Log level (debug, info, warn, error); RUST_LOG overrides it
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn level_filter(level: &str) -> log::LevelFilter {
    match level {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(level_filter(&args.log_level))
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    log::info!("BitChat relay hub starting on {}", args.bind);
    let listener = TcpListener::bind(args.bind).await?;

    let service = Arc::new(TcpRelayService::with_idle_timeout(Duration::from_secs(
        args.idle_timeout,
    )));
    tokio::spawn(service.clone().stats_task());

    tokio::select! {
        result = service.clone().serve(listener) => {
            if let Err(e) = result {
                log::error!("Relay hub stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = service.stats().await;
            log::info!(
                "Shutting down: {} clients, {} connections served, {} queries answered",
                stats.active_clients,
                stats.total_connections,
                stats.queries_answered
            );
        }
    }

    Ok(())
}
