//! Tunnel proxy standalone binary.

use clap::Parser;
use tunnel_proxy::cli::{self, ProxyArgs};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ProxyArgs::parse();
    cli::run(args).await
}
