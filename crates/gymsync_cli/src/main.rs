//! gymsync CLI
//!
//! Operator tools for the gym sync engine.
//!
//! # Commands
//!
//! - `send` - Queue one operation and wait until it reaches the server
//! - `watch` - Print inbound changes and conflicts as JSON lines
//! - `encode` - Wrap a JSON payload in a wire envelope
//! - `decode` - Verify and unwrap a wire envelope

mod commands;

use clap::{Parser, Subcommand};
use commands::Endpoint;
use gymsync_engine::DEFAULT_WEBSOCKET_URL;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// gymsync command-line tools.
#[derive(Parser)]
#[command(name = "gymsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Sync server WebSocket URL
    #[arg(global = true, long, env = "GYMSYNC_URL", default_value = DEFAULT_WEBSOCKET_URL)]
    url: String,

    /// Bearer token for the sync server
    #[arg(global = true, long, env = "GYMSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// User id announced in the handshake
    #[arg(global = true, long, env = "GYMSYNC_USER_ID", default_value = "operator")]
    user_id: String,

    /// Device id of this client
    #[arg(global = true, long, env = "GYMSYNC_DEVICE_ID", default_value = "gymsync-cli")]
    device_id: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue one operation and wait until it is sent
    Send {
        /// Target table
        #[arg(short, long)]
        table: String,

        /// Operation kind (create, update, delete)
        #[arg(short, long, default_value = "update")]
        operation: String,

        /// Record as a JSON object; must carry an `id`
        #[arg(short, long)]
        data: String,

        /// Seconds to wait for delivery
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Print inbound changes until interrupted
    Watch {
        /// Only subscribe to these tables (comma separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Wrap a JSON payload in a wire envelope
    Encode {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Payload size above which compression is attempted
        #[arg(long)]
        threshold: Option<usize>,

        /// Never compress
        #[arg(long)]
        no_compress: bool,
    },

    /// Verify and unwrap a wire envelope
    Decode {
        /// Input file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let endpoint = Endpoint {
        url: cli.url,
        token: cli.token,
        user_id: cli.user_id,
        device_id: cli.device_id,
    };

    match cli.command {
        Commands::Send {
            table,
            operation,
            data,
            timeout,
        } => {
            commands::send::run(
                &endpoint,
                &table,
                &operation,
                &data,
                Duration::from_secs(timeout),
            )
            .await?;
        }
        Commands::Watch { tables, duration } => {
            commands::watch::run(&endpoint, tables, duration.map(Duration::from_secs)).await?;
        }
        Commands::Encode {
            input,
            threshold,
            no_compress,
        } => {
            commands::envelope::encode(input.as_deref(), threshold, no_compress)?;
        }
        Commands::Decode { input } => {
            commands::envelope::decode(input.as_deref())?;
        }
    }

    Ok(())
}
