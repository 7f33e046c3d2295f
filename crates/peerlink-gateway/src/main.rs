use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;

use peerlink_gateway::AppState;

#[derive(Parser, Debug)]
#[command(name = "peerlink-gateway")]
#[command(about = "PeerLink rendezvous signaling server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "PEERLINK_GATEWAY_LISTEN", default_value = "0.0.0.0:5520")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    peerlink_common::init_tracing();
    let args = Args::parse();

    let listener = TcpListener::bind(args.listen).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!("gateway listening on {}", bound_addr);
    tracing::info!("gateway signaling url ws://{}/websocket", bound_addr);

    tokio::select! {
        result = peerlink_gateway::serve(listener, AppState::new()) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    Ok(())
}
