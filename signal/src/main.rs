use std::net::SocketAddr;

use clap::Parser;
use roulette_signal::{config, Args, Switchboard};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::setup_logging();
    let args = Args::parse();

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    roulette_signal::serve(listener, Switchboard::new(), args.keepalive()).await?;
    Ok(())
}
