use clap::Parser;
use log::info;
use server::network::{Server, ServerConfig};
use shared::protocol::{DEFAULT_PUBLISH_PORT, DEFAULT_REQUEST_PORT};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Port of the request/reply endpoint
    #[arg(short = 'r', long, default_value_t = DEFAULT_REQUEST_PORT)]
    request_port: u16,

    /// Port of the publish endpoint
    #[arg(short = 'p', long, default_value_t = DEFAULT_PUBLISH_PORT)]
    publish_port: u16,

    /// Maximum number of peers
    #[arg(short = 'm', long, default_value = "16")]
    max_clients: usize,

    /// Seconds of silence before a peer is dropped
    #[arg(short = 't', long, default_value = "5")]
    peer_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let config = ServerConfig {
        host: args.host,
        request_port: args.request_port,
        publish_port: args.publish_port,
        max_clients: args.max_clients,
        peer_timeout: Duration::from_secs(args.peer_timeout_secs),
    };

    info!("Starting relay server...");
    info!(
        "Max peers: {}, peer timeout: {}s",
        config.max_clients, args.peer_timeout_secs
    );

    let mut server = Server::new(&config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
    }

    Ok(())
}
