use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sshmux::cli::{Cli, Commands, run_auth_methods, run_capture, run_exec, run_fingerprint};
use sshmux::config::{Config, default_config_path, load_config};
use sshmux::ports::Connector;
use sshmux::{ExecOptions, RusshConnector};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // stdout carries command output; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // An explicit --config must exist; the default location is optional.
    let config = match cli.config {
        Some(path) => load_config(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            let path = default_config_path();
            if path.exists() {
                load_config(&path)
                    .with_context(|| format!("Failed to load config from {}", path.display()))?
            } else {
                debug!(config = %path.display(), "No configuration file, using raw hostnames");
                Config::default()
            }
        }
    };

    sshmux::startup();
    let connector: Arc<dyn Connector> = Arc::new(RusshConnector::new());

    let code = match cli.command {
        Commands::Exec {
            host,
            command,
            chomp,
            limit,
            target,
        } => {
            let opts = ExecOptions { limit, chomp };
            run_exec(connector, &config, &host, &command, opts, &target).await?;
            ExitCode::SUCCESS
        }
        Commands::Capture {
            host,
            command,
            target,
        } => {
            if run_capture(connector, &config, &host, &command, &target).await? {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::AuthMethods {
            host,
            login,
            target,
        } => {
            run_auth_methods(connector, &config, &host, &login, &target).await?;
            ExitCode::SUCCESS
        }
        Commands::Fingerprint { host, target } => {
            run_fingerprint(connector, &config, &host, &target).await?;
            ExitCode::SUCCESS
        }
    };

    sshmux::shutdown();
    Ok(code)
}
