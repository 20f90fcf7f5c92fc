use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use voxrelay_core::config::{Config, LoggingConfig};
use voxrelay_gateway::GatewayState;

#[derive(Parser)]
#[command(
    name = "voxrelay",
    about = "Real-time voice gateway between audio clients and streaming inference stages",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 18790)
        #[arg(long)]
        port: Option<u16>,

        /// Address to bind (default: 0.0.0.0)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show configuration summary and whether a gateway is answering
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Check the configuration for errors
    Validate,
}

fn log_filter(logging: &LoggingConfig, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let level = if verbose {
        "debug"
    } else {
        logging.level.as_deref().unwrap_or("info")
    };
    let mut filter = EnvFilter::new(level);
    for directive in &logging.filters {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring invalid log filter '{directive}': {e}"),
        }
    }
    filter
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(log_filter(logging, verbose));
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().with_writer(std::io::stdout).init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.with_writer(std::io::stdout).init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

/// Probe a running gateway's health endpoint.
async fn probe_health(port: u16) -> Option<serde_json::Value> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;
    let resp = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .ok()?;
    resp.json().await.ok()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);

    match cli.command {
        Commands::Serve { port, bind } => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                tracing::warn!("{warning}");
            }
            if !errors.is_empty() {
                for error in &errors {
                    tracing::error!("{error}");
                }
                anyhow::bail!("invalid configuration in {}", config_path.display());
            }

            if let Some(bind) = bind {
                let mut server = config.server();
                server.bind = Some(bind);
                config.server = Some(server);
            }
            let port = port.unwrap_or_else(|| config.port());
            let inference = config.inference();
            tracing::info!(
                port,
                auth = config.auth_mode(),
                recognition = %inference.recognition.provider,
                reasoning = %inference.reasoning.provider,
                synthesis = %inference.synthesis.provider,
                "Starting VoxRelay gateway"
            );

            let state = Arc::new(GatewayState::new(config));
            voxrelay_gateway::start_gateway(state, port).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK: {}", config_path.display());
            }
        },
        Commands::Status => {
            let port = config.port();
            let inference = config.inference();
            println!("VoxRelay v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Listen: {}:{port}", config.bind_addr());
            println!("Auth: {}", config.auth_mode());
            println!(
                "Stages: recognition={} reasoning={} synthesis={}",
                inference.recognition.provider,
                inference.reasoning.provider,
                inference.synthesis.provider
            );
            match probe_health(port).await {
                Some(health) => println!(
                    "Status: running ({} connections, {} sessions)",
                    health["connections"], health["sessions"]
                ),
                None => println!("Status: not running"),
            }
        }
    }

    Ok(())
}
