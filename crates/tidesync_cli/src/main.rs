//! tidesync CLI
//!
//! Command-line tools for tidesync snapshot files.
//!
//! # Commands
//!
//! - `seed` - Add sample accounts, addresses and people to a snapshot
//! - `inspect` - Display row, tombstone and watermark counts
//! - `sync` - Sync a local snapshot with a server snapshot in-process
//! - `prune-tombstones` - Drop tombstones older than a cutoff
//! - `token` - Sign an access token for an account

mod commands;

use clap::{Parser, Subcommand};
use commands::CliError;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// tidesync command-line tools.
#[derive(Parser)]
#[command(name = "tidesync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the snapshot file
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add sample data to a snapshot
    Seed {
        /// Number of people to add
        #[arg(long, default_value = "10")]
        people: usize,
    },

    /// Display snapshot contents and watermarks
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Sync the snapshot at --path with a server snapshot
    Sync {
        /// Server snapshot file
        #[arg(short, long)]
        remote: PathBuf,

        /// Access token (hex) presented to the server
        #[arg(short, long)]
        token: Option<String>,

        /// Secret the server validates tokens with; no secret disables auth
        #[arg(short, long)]
        secret: Option<String>,

        /// Items per page
        #[arg(long, default_value = "100")]
        page_size: u32,
    },

    /// Drop tombstones older than a number of days
    PruneTombstones {
        /// Age in days
        #[arg(long)]
        older_than_days: u32,
    },

    /// Sign an access token
    Token {
        /// Signing secret
        #[arg(short, long)]
        secret: String,

        /// Account the token is issued to
        #[arg(short, long)]
        account: Uuid,

        /// Issue an administrator token
        #[arg(long)]
        admin: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Seed { people } => {
            let path = cli.path.ok_or(CliError::PathRequired("seed"))?;
            commands::seed::run(&path, people)?;
        }
        Commands::Inspect { format } => {
            let path = cli.path.ok_or(CliError::PathRequired("inspect"))?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Sync {
            remote,
            token,
            secret,
            page_size,
        } => {
            let path = cli.path.ok_or(CliError::PathRequired("sync"))?;
            commands::sync::run(
                &path,
                &remote,
                token.as_deref(),
                secret.as_deref(),
                page_size,
            )?;
        }
        Commands::PruneTombstones { older_than_days } => {
            let path = cli.path.ok_or(CliError::PathRequired("prune-tombstones"))?;
            commands::prune::run(&path, older_than_days)?;
        }
        Commands::Token {
            secret,
            account,
            admin,
        } => {
            commands::token::run(&secret, account, admin)?;
        }
        Commands::Version => {
            println!("tidesync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Snapshot format v{}", tidesync_store::SNAPSHOT_FORMAT);
        }
    }

    Ok(())
}
