use clap::Parser;
use std::path::PathBuf;

/// Identity broker: authenticates users against the configured identity
/// providers and issues OAuth2 access tokens to registered clients.
#[derive(Parser, Debug)]
#[command(name = "broker-server", version, about)]
pub struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "BROKER_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Overrides `listen_address` from the configuration
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}
