use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ingot-connector",
    version,
    about = "Connection front-end for the ingot mining pool",
    long_about = "Accepts miner TCP connections, frames their line-delimited JSON \
                 and shuttles messages between clients and the stratifier and \
                 generator processes."
)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the connector
    Start {
        /// Listen address (repeatable, overrides config file)
        #[arg(short, long)]
        bind: Vec<String>,

        /// Maximum concurrent clients (overrides config file if provided)
        #[arg(long)]
        max_clients: Option<usize>,

        /// Run as a passthrough to an upstream pool
        #[arg(long)]
        passthrough: bool,

        /// Proxy mode (default listen port becomes 3334)
        #[arg(long)]
        proxy: bool,

        /// Open the accept gate immediately instead of waiting for the
        /// supervisor's accept command
        #[arg(long)]
        accept: bool,
    },

    /// Validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Generate an example configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = "ingot.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
