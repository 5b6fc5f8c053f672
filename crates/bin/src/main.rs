use std::time::Duration;

use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use trove::server::{Server, ServerConfig};

mod cli;

use cli::{Cli, Commands, ServeArgs};

#[tokio::main]
async fn main() {
    // Initialize tracing. Diagnostics go to stderr; stdout carries only the
    // readiness line a spawning process waits for.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("trove=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let args = match cli.command {
        Some(Commands::Serve(args)) => args,
        None => ServeArgs::default(),
    };
    std::process::exit(serve(args).await);
}

async fn serve(args: ServeArgs) -> i32 {
    let config = ServerConfig {
        host: args.host,
        port: args.port,
        secret_key: args.secret_key,
        sweep_interval: Duration::from_millis(args.sweep_interval_ms.max(1)),
    };

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(error) => {
            println!(
                "{}",
                json!({"event": "error", "message": "failed to start", "detail": error.to_string()})
            );
            return 1;
        }
    };
    let addr = match server.local_addr() {
        Ok(addr) => addr,
        Err(error) => {
            println!(
                "{}",
                json!({"event": "error", "message": "failed to start", "detail": error.to_string()})
            );
            return 1;
        }
    };
    // The spawner reads this line to learn the actual port.
    println!(
        "{}",
        json!({"event": "listening", "host": addr.ip().to_string(), "port": addr.port()})
    );

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }
    0
}
