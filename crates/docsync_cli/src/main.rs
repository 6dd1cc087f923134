//! docsync CLI
//!
//! Command-line tools for docsync stores.
//!
//! # Commands
//!
//! - `put` / `get` / `list` - Write and read documents
//! - `query` - Run a filter through declared indexes
//! - `compact` - Rewrite the store log
//! - `pull` / `push` / `sync` - Replicate with a remote

mod commands;

use clap::{Args, Parser, Subcommand};
use commands::replicate::Mode;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync command-line tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long, env = "DOCSYNC_STORE")]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Where to replicate to.
#[derive(Args)]
struct RemoteArgs {
    /// Remote locator, e.g. file:///srv/docsync
    #[arg(short, long, env = "DOCSYNC_REMOTE")]
    remote: String,

    /// Remote database name
    #[arg(short, long)]
    database: String,

    /// Credential key
    #[arg(long, env = "DOCSYNC_KEY")]
    key: Option<String>,

    /// Credential secret
    #[arg(long, env = "DOCSYNC_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a JSON document (uses its `_id` if present)
    Put {
        /// Document body as a JSON object
        json: String,
    },

    /// Print a document
    Get {
        /// Document id
        id: String,
    },

    /// List document ids and revisions
    List,

    /// Query documents with a JSON filter
    Query {
        /// Filter, e.g. '{"name": "Ada"}' or '{"name": {"$contains": "A"}}'
        #[arg(default_value = "{}")]
        filter: String,

        /// Declare an index before querying, as NAME=field[,field...]
        #[arg(short, long = "index")]
        indexes: Vec<String>,
    },

    /// Compact the store log
    Compact,

    /// Pull remote changes into the store
    Pull(RemoteArgs),

    /// Push local changes to the remote
    Push(RemoteArgs),

    /// Pull, then push
    Sync(RemoteArgs),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store = cli.store.ok_or("Store path required (--store or DOCSYNC_STORE)")?;

    match cli.command {
        Commands::Put { json } => commands::document::put(&store, &json)?,
        Commands::Get { id } => commands::document::get(&store, &id)?,
        Commands::List => commands::document::list(&store)?,
        Commands::Query { filter, indexes } => commands::document::query(&store, &filter, &indexes)?,
        Commands::Compact => commands::document::compact(&store)?,
        Commands::Pull(remote) => run_replication(&store, remote, Mode::Pull)?,
        Commands::Push(remote) => run_replication(&store, remote, Mode::Push)?,
        Commands::Sync(remote) => run_replication(&store, remote, Mode::Sync)?,
    }

    Ok(())
}

fn run_replication(
    store: &std::path::Path,
    args: RemoteArgs,
    mode: Mode,
) -> Result<(), Box<dyn std::error::Error>> {
    if args.key.is_some() != args.secret.is_some() {
        return Err("--key and --secret must be given together".into());
    }
    let target = commands::replicate::Target {
        locator: args.remote,
        database: args.database,
        credentials: args.key.zip(args.secret),
    };
    commands::replicate::run(store, &target, mode)
}
