//! Overmesh - userspace multi-hop mesh overlay agent
//!
//! SOCKS5 in, real TCP/UDP out, any number of encrypted transit hops in
//! between.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use overmesh::config::Config;
use overmesh::identity::AgentId;
use overmesh::Agent;
use std::path::PathBuf;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "overmesh")]
#[command(version = VERSION)]
#[command(about = "Userspace multi-hop mesh overlay agent", long_about = None)]
struct Cli {
    /// Enable verbose logging (-v info, -vv debug, -vvv trace, -vvvv all modules trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent
    Run {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE", default_value = "overmesh.toml")]
        config: PathBuf,
    },

    /// Generate (or show) the persistent agent identity
    Genkey {
        /// Identity file path
        #[arg(long, default_value = "agent.id")]
        identity: PathBuf,
    },

    /// Write a starter configuration file
    Genconf {
        /// Output path
        #[arg(short, long, default_value = "overmesh.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_logging(verbose: u8) {
    let log_level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();
    if verbose >= 4 {
        logger.filter_level(log::LevelFilter::Trace);
    } else if verbose >= 3 {
        logger.filter_module("overmesh", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(log_level);
    }
    logger.format_timestamp_millis().format_module_path(true).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // rustls needs one process-wide crypto provider before any TLS config
    // is built.
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let code = match cli.command {
        Commands::Run { config } => run(config).await,
        Commands::Genkey { identity } => genkey(identity).await.map(|_| 0).unwrap_or_else(|e| {
            eprintln!("error: {:#}", e);
            1
        }),
        Commands::Genconf { output, force } => genconf(output, force).map(|_| 0).unwrap_or_else(|e| {
            eprintln!("error: {:#}", e);
            1
        }),
    };
    std::process::exit(code);
}

async fn run(config_path: PathBuf) -> i32 {
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: loading {}: {:#}", config_path.display(), e);
            return 1;
        }
    };

    let agent = match Agent::new(config).await {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("error: {}", e);
            return e.exit_code();
        }
    };
    if let Err(e) = agent.start().await {
        eprintln!("error: {}", e);
        return e.exit_code();
    }

    info!("overmesh {} running as {}", VERSION, agent.id());
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received"),
        Err(e) => log::error!("waiting for interrupt: {}", e),
    }
    agent.shutdown().await;
    0
}

async fn genkey(identity: PathBuf) -> Result<()> {
    let id = AgentId::load_or_generate(&identity)
        .await
        .with_context(|| format!("loading or creating {}", identity.display()))?;
    println!("agent id: {}", id);
    println!("file:     {}", identity.display());
    Ok(())
}

fn genconf(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }
    let starter = r#"# Overmesh agent configuration.
identity_file = "agent.id"
display_name = "my-agent"

# Listeners accept connections from other agents.
# [[listeners]]
# transport = "quic"           # quic | h2 | ws
# bind = "0.0.0.0:7443"
# tls_cert = "certs/agent.pem"
# tls_key = "certs/agent.key"
# tls_client_ca = "certs/mesh-ca.pem"   # enables mutual TLS

# Peers this agent dials.
# [[peers]]
# transport = "quic"
# address = "hub.example.com:7443"
# persistent = true
# id = "<expected 32-hex-char agent id>"

[routing]
advertise_interval = "2m"
route_ttl = "5m"
max_hops = 16

[limits]
buffer_size = 262144
max_streams_per_peer = 1000
max_streams_total = 10000
max_pending_opens = 100
stream_open_timeout = "30s"

[connection]
keepalive_interval = "30s"
keepalive_timeout = "10s"
keepalive_jitter = 0.3
handshake_timeout = "10s"

[reconnect]
initial_delay = "1s"
max_delay = "60s"
multiplier = 2.0
jitter = 0.2
max_attempts = 0               # 0 = unlimited

[exit]
enabled = false
# routes = ["10.0.0.0/8"]
# domain_routes = ["*.internal.corp"]
# [exit.dns]
# servers = ["10.0.0.53:53"]
# timeout = "5s"

[socks5]
enabled = false
listen = "127.0.0.1:1080"
# [[socks5.users]]
# username = "ops"
# password_hash = "$2b$12$..."   # bcrypt
"#;
    std::fs::write(&output, starter)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(())
}
