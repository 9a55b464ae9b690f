use clap::{Parser, Subcommand};

/// kraken-agent — deployment agent core.
#[derive(Debug, Parser)]
#[command(name = "kraken-agent", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the polling loop (default when no subcommand is given).
    Run {
        /// Optional environment overlay name, e.g. `agentsettings.<env>.json`.
        environment: Option<String>,
    },
    /// Print version information.
    Version,
}
