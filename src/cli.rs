use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rallyprobe",
    version,
    about = "Measure latency to rally-point relay servers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Probe every server in a JSON server list and print median pings
    Probe {
        /// Path to a JSON array of server descriptors
        servers: PathBuf,
        /// Seconds to wait for results before exiting
        #[arg(long, default_value_t = 3)]
        wait: u64,
        /// Per-batch response timeout in milliseconds
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
    },
    /// Run a ping responder, the exchange a relay server answers with
    Serve {
        /// UDP port to listen on
        #[arg(long, default_value_t = 14098)]
        port: u16,
    },
}
