use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Log at debug level (RUST_LOG takes precedence)
    #[clap(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Find pairs similar to "Item1 vs Item2"
    Similar {
        /// The pair, e.g. "Cats vs Dogs"
        pair: String,

        /// Number of results (defaults to semantic_search.default_k)
        #[clap(short, long)]
        k: Option<usize>,

        /// Print results as JSON
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Load the model and the pair cache, then print status
    Warm {},

    /// Drop the persisted cache and refetch everything
    Refresh {},

    /// Show cache status without touching the network
    Status {},

    /// Print the embedding of a text in the backend's base64 format
    Embed {
        text: String,
    },

    /// Time full fetches over a grid of page sizes and concurrency levels
    BenchFetch {
        /// Page sizes to try
        #[clap(long, value_delimiter = ',', default_value = "50,100,200,300,500,800,1000,2000,4000")]
        counts: Vec<usize>,

        /// Concurrency levels to try
        #[clap(long, value_delimiter = ',', default_value = "1,2,4,8,16,32,64")]
        concurrency: Vec<usize>,
    },
}
