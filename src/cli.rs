use std::{net::SocketAddr, path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Runnable web services straight from a repository URL.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Address the API server listens on.
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Path to the persisted state file.
    #[arg(short, long, default_value = "slipway-state.json")]
    pub state: PathBuf,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
