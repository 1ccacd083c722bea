//! cmdwire - command-line probe
//!
//! Opens one connection, sends a single command and prints the normalized
//! reply. Command monitoring events are logged through `tracing`.

use bson::{doc, Document};
use cmdwire::connection::{Connection, ConnectionOptions, DispatchOptions, ServerAddress};
use cmdwire::events::TracingEventHandler;
use cmdwire::protocol::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Probe configuration
struct Config {
    /// Server host
    host: String,
    /// Server port
    port: u16,
    /// Target database
    db: String,
    /// Command to send
    command: String,
    /// Socket timeout in milliseconds
    timeout_ms: u64,
    /// Connect through a load balancer
    load_balanced: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27017,
            db: "admin".to_string(),
            command: "ping".to_string(),
            timeout_ms: 5000,
            load_balanced: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host");
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--db" | "-d" => {
                    config.db = value_of(&args, i, "--db");
                    i += 2;
                }
                "--command" | "-c" => {
                    config.command = value_of(&args, i, "--command");
                    i += 2;
                }
                "--timeout-ms" | "-t" => {
                    config.timeout_ms =
                        value_of(&args, i, "--timeout-ms").parse().unwrap_or_else(|_| {
                            eprintln!("Error: invalid timeout");
                            std::process::exit(1);
                        });
                    i += 2;
                }
                "--load-balanced" => {
                    config.load_balanced = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("cmdwire version {}", cmdwire::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn address(&self) -> ServerAddress {
        ServerAddress::new(self.host.clone(), self.port)
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
cmdwire - send one command over a monitored connection

USAGE:
    cmdwire [OPTIONS]

OPTIONS:
    -h, --host <HOST>          Server host (default: 127.0.0.1)
    -p, --port <PORT>          Server port (default: 27017)
    -d, --db <DB>              Target database (default: admin)
    -c, --command <NAME>       Command to send as {{<NAME>: 1}} (default: ping)
    -t, --timeout-ms <MS>      Socket timeout (default: 5000)
        --load-balanced        Mark the connection as load balanced
    -v, --version              Print version information
        --help                 Print this help message

Set RUST_LOG=cmdwire=debug to see command monitoring events.
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut options = ConnectionOptions::new(config.address())
        .with_event_handler(Arc::new(TracingEventHandler));
    options.load_balanced = config.load_balanced;

    let connection = Connection::connect(options).await?;
    info!(
        connection = %connection.id(),
        sessions = connection.has_session_support(),
        "Connected"
    );

    let mut body = Document::new();
    body.insert(config.command.as_str(), 1);
    let dispatch = DispatchOptions::default()
        .with_socket_timeout(Duration::from_millis(config.timeout_ms));

    match connection
        .dispatch(Command::modern(config.db.as_str(), body), dispatch)
        .await
    {
        Ok(Some(reply)) => println!("{}", reply),
        Ok(None) => println!("{}", doc! {}),
        Err(e) => {
            error!(error = %e, "Command failed");
            connection.close().await;
            return Err(e.into());
        }
    }

    connection.close().await;
    Ok(())
}
