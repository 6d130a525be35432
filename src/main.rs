//! JSON Mock Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::builder::FalseyValueParser;
use clap::{ArgAction, Parser};
use json_mock_server::dispatcher::RouteTable;
use json_mock_server::lifecycle::{DEFAULT_CONFIG_FILE, DEFAULT_PORT};
use json_mock_server::{start, ServerConfig, ServerError, ServerOptions};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "json-mock-server",
    about = "Configuration-driven HTTP mock server with templated JSON responses",
    version
)]
struct Args {
    /// Path to the routes file (JSON, or YAML for .yaml/.yml)
    #[arg(env = "MOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "MOCK_HOST", default_value = "0.0.0.0")]
    host: IpAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Verbose logging, same as --log-level debug
    #[arg(
        short,
        long,
        env = "MOCK_DEBUG",
        action = ArgAction::SetTrue,
        value_parser = FalseyValueParser::new()
    )]
    verbose: bool,

    /// How long to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 10_000)]
    shutdown_timeout_ms: u64,

    /// Do not reload routes when the config file changes
    #[arg(long)]
    no_watch: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { args.log_level };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(config_path) = resolve_config_path(args.config) else {
        eprintln!(
            "Usage: json-mock-server <CONFIG>\n\nNo config file given and ./{} not found",
            DEFAULT_CONFIG_FILE
        );
        return Ok(ExitCode::FAILURE);
    };

    // Validate and exit if requested
    if args.validate {
        let config = ServerConfig::load(&config_path)
            .await
            .with_context(|| format!("Invalid configuration {}", config_path.display()))?;
        let table = RouteTable::build(&config)?;
        println!("Configuration is valid ({} routes defined)", table.len());
        return Ok(ExitCode::SUCCESS);
    }

    let options = ServerOptions::new(&config_path)
        .with_addr(SocketAddr::new(args.host, args.port))
        .with_shutdown_timeout(Duration::from_millis(args.shutdown_timeout_ms))
        .with_watch_config(!args.no_watch);

    info!(path = %config_path.display(), "Loading configuration");
    let handle = start(options)
        .await
        .with_context(|| format!("Failed to start server with {}", config_path.display()))?;

    match handle.wait().await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(ServerError::ShutdownTimeout { .. }) => Ok(ExitCode::FAILURE),
        Err(err) => Err(err.into()),
    }
}

fn resolve_config_path(arg: Option<PathBuf>) -> Option<PathBuf> {
    arg.or_else(|| {
        let default = Path::new(DEFAULT_CONFIG_FILE);
        default.exists().then(|| default.to_path_buf())
    })
}
