//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "weft",
    version,
    about = "Hybrid semantic, keyword and link-graph retrieval over a folder of notes",
    long_about = "Weft indexes a folder of markdown notes into a vector, keyword and link-graph \
                  index, keeps it in sync as notes change, and answers queries with ranked, \
                  hydrated results or a budgeted context block."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/weft/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Notes folder to index (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub vault: Option<PathBuf>,

    /// Profile to apply on top of the config file
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build or refresh the index, then save it
    Index {
        /// Discard any stored shard and rebuild from scratch
        #[arg(long)]
        rebuild: bool,
    },

    /// Keep the index in sync with the notes folder until interrupted
    Watch {
        /// How often to poll the folder for changes
        #[arg(long, default_value = "2s")]
        interval: String,
    },

    /// Search the index
    Query {
        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Assemble a context block for a query within a character budget
    Context {
        /// Query text
        query: String,

        /// Character budget (defaults to context.budget_chars)
        #[arg(short, long)]
        budget: Option<usize>,

        /// Number of search results to draw from
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Show the assembled context as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show index and sync status
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Manage stored index shards
    Shards {
        #[command(subcommand)]
        action: ShardAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ShardAction {
    /// List shards in both storage tiers
    List,

    /// Delete shards that do not match the configured embedding model
    Prune,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
