use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the context daemon in the foreground.
    /// Callers start it on demand, there is rarely a need to run it by hand.
    Daemon {},

    /// Print past messages similar to the given text
    Search {
        /// Text to find similar messages for
        text: String,

        /// Maximum number of messages (config default_limit if omitted)
        #[clap(short, long)]
        limit: Option<usize>,
    },

    /// Build the vector store from a JSON Lines file of mail records
    Index {
        /// One {"text","subject","sender","date","path"} object per line
        records: PathBuf,

        /// Records embedded per batch (config index_batch_size if omitted)
        #[clap(long)]
        batch_size: Option<usize>,

        /// Don't show a progress bar
        #[clap(long, default_value = "false")]
        quiet: bool,
    },

    /// Show whether a daemon is running
    Status {},

    /// Stop the running daemon
    Stop {},
}
