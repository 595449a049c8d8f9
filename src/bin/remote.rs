//! Remote relay binary
//!
//! Usage: udprelay-remote [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to TOML configuration file
//!   -g, --generate       Generate a default configuration
//!   -h, --help           Print help information

use std::env;

use udprelay::server::{Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level (e.g. RUST_LOG=debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_server(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"udprelay-remote - remote endpoint of the UDP relay

USAGE:
    udprelay-remote [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Generate a default configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a configuration:
        udprelay-remote --generate > remote.toml

    Run the relay:
        udprelay-remote --config remote.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let config = ServerConfig::default();

    println!("# udprelay remote configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!("#");
    println!("# destination_transport: \"udp\" sends each chunk as one datagram,");
    println!("# \"tcp\" opens a connection per chunk and reads one reply.");
    println!();
    println!("{}", config.to_toml().map_err(|e: String| anyhow::anyhow!(e))?);

    Ok(())
}

async fn run_server(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let config = ServerConfig::from_toml(&content).map_err(|e: String| anyhow::anyhow!(e))?;

    tracing::info!("Starting remote relay on {}", config.listen_endpoint());
    tracing::info!(
        "Retransmission timeout {}ms, {} attempts, pool of {}",
        config.transport.retransmission_timeout_ms,
        config.transport.max_attempts,
        config.pool.capacity
    );

    let server = Server::new(config)?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            server.shutdown();
        }
    }

    tracing::info!("\n{}", server.metrics().format_report());
    Ok(())
}
