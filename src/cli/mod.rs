use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod admin;

#[derive(Parser)]
#[command(name = "mongofs")]
#[command(author, version, about = "Storage engine for a MongoDB-backed filesystem", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate a default configuration file
    Init {
        #[arg(default_value = "mongofs.toml")]
        path: PathBuf,
    },
    /// Show entry and chunk counts for the configured database
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Drop every stored entry and chunk
    ///
    /// Destroys the whole tree, root included. Requires --yes.
    Reset {
        #[arg(short, long)]
        config: PathBuf,
        /// Skip the confirmation check
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
