//! Clap CLI definitions for Switchyard.

use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  switchyard serve                       Run a router with ~/.switchyard/router.toml
  switchyard serve --port 4000 -v        Override the port, log at debug level
  switchyard cookie                      Print a fresh cookie for the config file
  switchyard reload --cookie <HEX>       Re-read reserved agents on a running router
  switchyard probe                       Register a test agent and measure a round trip";

/// Switchyard: a message router for agents.
#[derive(Parser)]
#[command(name = "switchyard", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to the router config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the router until Ctrl+C.
    Serve(ServeArgs),
    /// Ask a running router to reload its reserved agents.
    Reload {
        /// Router address.
        #[arg(long, default_value = "127.0.0.1:33647")]
        addr: String,
        /// Admin cookie, 32 hex digits.
        #[arg(long)]
        cookie: String,
    },
    /// Print a random cookie in config-file format.
    Cookie,
    /// Register with a router and time a request to ourselves.
    Probe {
        /// Router address.
        #[arg(long, default_value = "127.0.0.1:33647")]
        addr: String,
        /// Number of round trips.
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
}

/// Flags that override values from the config file.
#[derive(clap::Args, Default)]
pub struct ServeArgs {
    /// Address to bind.
    #[arg(long)]
    pub bind: Option<IpAddr>,
    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,
    /// Heartbeat timeout in milliseconds.
    #[arg(long)]
    pub heartbeat_timeout: Option<u64>,
    /// Client eviction timeout in milliseconds.
    #[arg(long)]
    pub eviction_timeout: Option<u64>,
    /// Runtime worker threads.
    #[arg(long)]
    pub workers: Option<usize>,
    /// Maximum concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,
}
