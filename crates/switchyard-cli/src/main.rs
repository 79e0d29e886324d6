//! Switchyard CLI: run a router and administer it.

mod cli;
mod cmd;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;

fn init_tracing_stderr(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr(cli.verbose);

    match cli.command {
        Commands::Serve(args) => cmd::serve::cmd_serve(cli.config, args),
        Commands::Reload { addr, cookie } => cmd::admin::cmd_reload(&addr, &cookie),
        Commands::Cookie => cmd::admin::cmd_cookie(),
        Commands::Probe { addr, count } => cmd::admin::cmd_probe(&addr, count),
    }
}
