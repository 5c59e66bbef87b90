//! Switchboard orchestrator binary.
//!
//! Usage:
//!   switchboard --config switchboard.toml
//!   switchboard --agent-port 3000 --client-port 3001 --service-port 3002
//!   switchboard --bind 0.0.0.0
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Log filter (overrides the configured log level)
//! - `SWITCHBOARD_BIND_ADDR` - Bind address (overridden by --bind)

use switchboard_orchestrator::config::OrchestratorConfig;
use switchboard_orchestrator::Orchestrator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments (simple for now)
    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = None;
    let mut agent_port: Option<u16> = None;
    let mut client_port: Option<u16> = None;
    let mut service_port: Option<u16> = None;
    let mut bind_addr: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--agent-port" => {
                if i + 1 < args.len() {
                    agent_port = Some(args[i + 1].parse().expect("Invalid agent port"));
                    i += 1;
                }
            }
            "--client-port" => {
                if i + 1 < args.len() {
                    client_port = Some(args[i + 1].parse().expect("Invalid client port"));
                    i += 1;
                }
            }
            "--service-port" => {
                if i + 1 < args.len() {
                    service_port = Some(args[i + 1].parse().expect("Invalid service port"));
                    i += 1;
                }
            }
            "--bind" | "-b" => {
                if i + 1 < args.len() {
                    bind_addr = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Switchboard Orchestrator");
                println!();
                println!("Usage: switchboard [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>       Path to switchboard.toml (default: ./switchboard.toml)");
                println!("  -b, --bind <ADDR>         Bind address (default: 127.0.0.1, env: SWITCHBOARD_BIND_ADDR)");
                println!("      --agent-port <PORT>   Agent channel port (default: 3000)");
                println!("      --client-port <PORT>  Client channel port (default: 3001)");
                println!("      --service-port <PORT> Service channel port (default: 3002)");
                println!("  -h, --help                Show this help message");
                println!();
                println!("Environment variables:");
                println!("  RUST_LOG                  Log filter (overrides configured log level)");
                println!("  SWITCHBOARD_BIND_ADDR     Bind address (overridden by --bind flag)");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let mut config = match &config_path {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::load_or_default("switchboard.toml"),
    };
    if let Some(addr) = bind_addr.or_else(|| std::env::var("SWITCHBOARD_BIND_ADDR").ok()) {
        config.bind_addr = addr;
    }
    if let Some(port) = agent_port {
        config.agent_port = port;
    }
    if let Some(port) = client_port {
        config.client_port = port;
    }
    if let Some(port) = service_port {
        config.service_port = port;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            format!("{},switchboard=debug", config.log_level).into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.bind_addr == "0.0.0.0" {
        tracing::warn!(
            "Binding to 0.0.0.0 — the orchestrator channels are exposed to all network \
             interfaces. Ensure a firewall is in place."
        );
    }
    if let Some(path) = &config_path {
        tracing::info!(path = %path, "Loaded configuration");
    }

    let orchestrator = Orchestrator::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    orchestrator.shutdown();
    Ok(())
}
