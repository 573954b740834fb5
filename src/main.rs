//! Unified tunnel-rs CLI.
//!
//! - `tunnel-rs run` - Run the proxy
//! - `tunnel-rs hash` - Print the credential hash of a password
//!
//! The proxy can also be run as the standalone `tunnel-proxy` binary.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// Tunnel-rs unified CLI.
#[derive(Parser)]
#[command(
    name = "tunnel-rs",
    version,
    about = "A composable tunneling proxy",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy.
    #[command(name = "run", alias = "serve")]
    Run(Box<tunnel_proxy::ProxyArgs>),

    /// Show password hash (for manual configuration).
    Hash {
        /// Password to hash.
        password: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => tunnel_proxy::cli::run(*args).await,
        Commands::Hash { password } => {
            println!("{}", tunnel_auth::sha224_hex(&password));
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
