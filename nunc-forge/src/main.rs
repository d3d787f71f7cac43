//! nunc-forge - Main entry point
//!
//! The controller daemon provisions Hetzner Cloud servers for queued GitHub
//! Actions jobs and runs each one as an ephemeral self-hosted runner.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use nunc_forge::bootstrap::{BootstrapSettings, Bootstrapper};
use nunc_forge::config::{self, Config, GitHubCredentials};
use nunc_forge::fleet::FleetManager;
use nunc_forge::github::{GitHubClient, RunnerRegistry};
use nunc_forge::provider::{HetznerProvider, InstanceProvider};
use nunc_forge::provisioner::Provisioner;
use nunc_forge::runner_state::RunnerStore;
use nunc_forge::server::{ServerConfig, run_server};
use nunc_forge::ssh::SshExecutor;
use nunc_forge::webhook::WebhookState;

/// Ephemeral GitHub Actions runners on Hetzner Cloud
#[derive(Parser)]
#[command(name = "nunc-forge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write daily rotated log files to this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Serve {
        /// Address to listen on (overrides config)
        #[arg(long)]
        listen: Option<SocketAddr>,
    },

    /// Generate a default configuration file
    InitConfig {
        /// Output path (defaults to stdout if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    match cli.command {
        Commands::Serve { listen } => {
            match &cli.log_dir {
                Some(log_dir) => init_daemon_logging(log_dir, filter)?,
                None => init_cli_logging(filter),
            }
            serve(&cli.config, listen).await
        }
        Commands::InitConfig { output } => {
            init_cli_logging(filter);
            generate_config(output)
        }
        Commands::CheckConfig => {
            init_cli_logging(filter);
            check_config(&cli.config)
        }
    }
}

/// Initialize logging for CLI commands (stdout only).
fn init_cli_logging(filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Initialize logging for daemon mode (stdout + rotating file).
fn init_daemon_logging(log_dir: &Path, filter: EnvFilter) -> Result<()> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

    // Daily rotating file, e.g. nunc-forge.2026-01-15.log
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("nunc-forge")
        .filename_suffix("log")
        .build(log_dir)
        .with_context(|| "Failed to create log file appender")?;

    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the lifetime of the daemon
    std::mem::forget(_guard);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false)) // stdout
        .with(fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking)) // file
        .init();

    info!("Logging to: {}", log_dir.display());
    Ok(())
}

/// Run the controller daemon
async fn serve(config_path: &Path, listen_override: Option<SocketAddr>) -> Result<()> {
    let config = Config::load(config_path)?;

    let listen_addr = match listen_override {
        Some(addr) => addr,
        None => config.listen_addr()?,
    };

    let executor = SshExecutor::from_config(&config.ssh).context("Failed to load SSH key")?;
    let public_key = executor.public_key_openssh()?;

    let provider: Arc<dyn InstanceProvider> =
        Arc::new(HetznerProvider::new(&config.hetzner, &public_key)?);

    let github_client =
        GitHubClient::new(config.github.repository()?, &config.github.credentials()?)?;

    // Catch credential problems before the first webhook arrives
    github_client
        .validate()
        .await
        .context("GitHub API validation failed")?;

    let registry: Arc<dyn RunnerRegistry> = Arc::new(github_client);
    let store = Arc::new(RunnerStore::new());

    let bootstrapper = Arc::new(Bootstrapper::new(
        store.clone(),
        provider.clone(),
        registry.clone(),
        Arc::new(executor),
        BootstrapSettings::from_config(&config)?,
    ));

    let provisioner = Arc::new(Provisioner::new(
        store.clone(),
        provider.clone(),
        bootstrapper,
        config.instances.clone(),
    ));

    let fleet_manager = FleetManager::new(
        store,
        provider,
        registry,
        config.reconcile.policy()?,
        config.reconcile.interval(),
    );

    let state = Arc::new(WebhookState {
        secret: config.github.webhook_secret.clone(),
        provisioner,
    });

    info!(
        "nunc-forge starting for {} in {}",
        config.github.repository, config.hetzner.location
    );

    let server_config = ServerConfig {
        listen_addr,
        webhook_path: config.http.webhook_path.clone(),
    };

    tokio::select! {
        result = run_server(server_config, state) => {
            info!("Shutting down");
            result
        }
        _ = fleet_manager.run() => {
            // Fleet manager runs forever, shouldn't exit
            Ok(())
        }
    }
}

/// Generate a default configuration file
fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = config::default_config_template();

    match output {
        Some(path) => {
            std::fs::write(&path, &config)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to: {}", path.display());
        }
        None => {
            print!("{}", config);
        }
    }

    Ok(())
}

/// Validate configuration and the SSH key without contacting any API
fn check_config(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let executor = SshExecutor::from_config(&config.ssh).context("Failed to load SSH key")?;
    executor.public_key_openssh()?;

    let auth = match config.github.credentials()? {
        GitHubCredentials::Token(_) => "personal access token".to_string(),
        GitHubCredentials::App { app_id, .. } => format!("GitHub App {app_id}"),
    };

    println!("Configuration OK: {}", config_path.display());
    println!("  Repository:  {} ({})", config.github.repository, auth);
    println!(
        "  Servers:     amd64={} arm64={} in {} ({})",
        config.instances.amd64, config.instances.arm64, config.hetzner.location, config.hetzner.image
    );
    println!(
        "  Listening:   {}{}",
        config.http.listen_addr, config.http.webhook_path
    );
    println!("  Reconcile:   every {}s", config.reconcile.interval_secs);

    Ok(())
}
