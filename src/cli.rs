use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "crawlgrid", about = "Distributed web crawler coordination fabric")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a crawl worker instance
    Worker,
    /// Run the discovery coordinator
    Discovery,
    /// Publish discovery messages for one or more domains
    Seed {
        /// Domains to discover (comma-separated or repeated)
        #[arg(short, long, value_delimiter = ',', required = true)]
        domains: Vec<String>,

        /// Message priority (1-10)
        #[arg(short, long, default_value = "1")]
        priority: u8,

        /// Cap on URLs discovered per domain
        #[arg(short, long)]
        max_urls: Option<usize>,

        /// Sitemap recursion depth
        #[arg(long, default_value = "3")]
        depth: u32,
    },
    /// Sweep expired leases back to pending
    Reclaim {
        /// Maximum records to sweep
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
    /// Return completed URLs to pending for a fresh crawl
    Recrawl {
        /// URLs to re-seed
        #[arg(short, long, value_delimiter = ',', required = true)]
        urls: Vec<String>,
    },
    /// Show queue depths and optionally per-domain pending work
    Status {
        /// Inspect one domain's pending records
        #[arg(short, long)]
        domain: Option<String>,
    },
}
