//! JTNT Agent - Operator CLI
//!
//! Enrollment and diagnostics for the endpoint agent: `enroll` against a
//! hub with a one-time token, `status` for the stored identity, and
//! `test-connection` to probe the hub through the full transport stack.

#![forbid(unsafe_code)]

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "jtnt-agent")]
#[command(author, version, about = "JTNT agent CLI - enrollment and diagnostics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll this host with a hub
    Enroll {
        /// One-time enrollment token
        #[arg(long)]
        token: String,

        /// Hub base URL
        #[arg(long)]
        hub: String,
    },

    /// Show agent enrollment status
    Status,

    /// Show agent version
    Version,

    /// Test connectivity to the hub
    TestConnection,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Enroll { token, hub } => commands::enroll::run(&token, &hub).await,
        Commands::Status => commands::status::run(),
        Commands::Version => {
            println!("JTNT Agent version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::TestConnection => commands::test_connection::run().await,
    }
}
