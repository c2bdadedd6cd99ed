use cache_connector::Address;
use clap::{Parser, Subcommand};

/// Watches NEM addresses and prints their confirmed transfers as JSON lines.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch the addresses listed in a configuration file.
    Run(RunCmd),
    /// Watch addresses given on the command line against a single node.
    Watch(WatchCmd),
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Path to the watcher configuration TOML file.
    /// If not provided, default values will be used.
    #[arg(short, long)]
    pub config: Option<String>,
}

/// Arguments for the `watch` subcommand.
#[derive(Parser, Debug)]
pub struct WatchCmd {
    /// Node to connect to, as `host` or `host:port`.
    #[arg(short, long)]
    pub node: String,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    pub level: String,

    /// Addresses to watch.
    #[arg(required = true)]
    pub addresses: Vec<Address>,
}
