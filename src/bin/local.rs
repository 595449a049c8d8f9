//! Local relay binary
//!
//! Usage: udprelay-local [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to JSON configuration file
//!   -p, --print-config   Print a default configuration
//!   -h, --help           Print help information

use std::env;

use udprelay::proxy::{LocalConfig, LocalRelay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level (e.g. RUST_LOG=udprelay=debug)
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
        "-p" | "--print-config" => {
            let config = LocalConfig::new("REMOTE_RELAY_IP", udprelay::DEFAULT_REMOTE_PORT);
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_local(&args[2]).await?;
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
        r#"udprelay-local - SOCKS5 front end of the UDP relay

USAGE:
    udprelay-local [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    -p, --print-config   Print a default configuration
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "listen_addr": "127.0.0.1",
        "listen_port": 1080,
        "remote_addr": "relay.example.com",
        "remote_port": 10000,
        "transport": {{ "retransmission_timeout_ms": 5000, "max_attempts": 8 }},
        "pool": {{ "capacity": 50 }}
    }}

EXAMPLES:
    Write a starting configuration:
        udprelay-local --print-config > local.json

    Run the relay:
        udprelay-local --config local.json
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<LocalConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: LocalConfig = serde_json::from_str(&content)?;
    config.validate().map_err(|e: String| anyhow::anyhow!(e))?;
    Ok(config)
}

async fn run_local(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    tracing::info!("Starting local relay on {}", config.listen_endpoint());
    tracing::info!("Remote relay: {}", config.remote_endpoint());

    let relay = LocalRelay::new(config).await?;

    tokio::select! {
        result = relay.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, closing {} sessions", relay.sessions().count());
            relay.shutdown();
        }
    }

    Ok(())
}
