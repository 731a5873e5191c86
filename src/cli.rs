use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "chaperone", about = "Chaperone polite forward HTTP proxy")]
pub struct Cli {
    /// Path to the rate-limit/cache-override config file (overrides $CONFIGFILE).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Port to listen on (overrides $PORT).
    #[arg(long)]
    pub port: Option<u16>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
