//! TillSync CLI
//!
//! Command-line tools for TillSync operators.
//!
//! # Commands
//!
//! - `process` - Run an upload through an in-memory engine and print the result
//! - `decode` - Print a CBOR sync message as JSON
//! - `token` - Create or verify device tokens
//! - `config` - Print or check an engine configuration

mod commands;

use clap::{Parser, Subcommand};
use commands::decode::MessageKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// TillSync command-line tools.
#[derive(Parser)]
#[command(name = "tillsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an upload through an in-memory engine
    Process {
        /// Upload request (JSON)
        upload: PathBuf,

        /// Engine configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Records to store before processing (JSON: entity -> id -> data)
        #[arg(short, long)]
        seed: Option<PathBuf>,

        /// Entity types to register
        #[arg(short, long, value_delimiter = ',', default_value = "Product,Customer,Category")]
        entities: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Print a CBOR sync message as JSON
    Decode {
        /// Encoded message file
        input: PathBuf,

        /// Message type
        #[arg(short, long, value_enum, default_value = "request")]
        kind: MessageKind,

        /// Input is hex text instead of raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Create or verify device tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Print the default engine configuration, or check one
    Config {
        /// Configuration file to check
        #[arg(short, long)]
        check: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum TokenAction {
    /// Issue a token
    Create {
        /// HMAC secret
        #[arg(long)]
        secret: String,

        /// Device id
        #[arg(short, long)]
        device: String,

        /// User id
        #[arg(short, long)]
        user: String,

        /// Branch scope
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Check a token and print its claims
    Verify {
        /// HMAC secret
        #[arg(long)]
        secret: String,

        /// Token to check
        token: String,

        /// Require the token to belong to this device
        #[arg(short, long)]
        device: Option<String>,

        /// Token lifetime in hours
        #[arg(long, default_value = "24")]
        expiry_hours: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Process {
            upload,
            config,
            seed,
            entities,
            format,
        } => {
            commands::process::run(&upload, config.as_deref(), seed.as_deref(), &entities, &format)?;
        }
        Commands::Decode { input, kind, hex } => {
            commands::decode::run(&input, kind, hex)?;
        }
        Commands::Token { action } => match action {
            TokenAction::Create {
                secret,
                device,
                user,
                branch,
            } => {
                commands::token::create(&secret, &device, &user, branch.as_deref())?;
            }
            TokenAction::Verify {
                secret,
                token,
                device,
                expiry_hours,
            } => {
                commands::token::verify(&secret, &token, device.as_deref(), expiry_hours)?;
            }
        },
        Commands::Config { check } => {
            commands::config::run(check.as_deref())?;
        }
        Commands::Version => {
            println!("TillSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Sync protocol v{}", tillsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
