//! CLI argument definitions for the Trove worker binary.

use clap::{Parser, Subcommand};

use trove::constants::{DEFAULT_HOST, DEFAULT_PORT};

/// Trove worker daemon
#[derive(Parser, Debug)]
#[command(name = "troved")]
#[command(about = "Trove: in-memory data store worker for local processes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker (the default when no subcommand is given)
    Serve(ServeArgs),
}

/// Arguments for the serve command
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Port to listen on. 0 picks a free port, reported on stdout.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "TROVE_PORT")]
    pub port: u16,

    /// Bind address. The protocol has no transport security, so anything
    /// other than a loopback address is on you.
    #[arg(long, default_value = DEFAULT_HOST, env = "TROVE_HOST")]
    pub host: String,

    /// Require this secret in the init handshake before serving a connection
    #[arg(short, long, env = "TROVE_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Milliseconds between expiry sweeps
    #[arg(long, default_value_t = 1000, env = "TROVE_SWEEP_INTERVAL_MS")]
    pub sweep_interval_ms: u64,
}

impl Default for ServeArgs {
    fn default() -> Self {
        ServeArgs {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            secret_key: None,
            sweep_interval_ms: 1000,
        }
    }
}
