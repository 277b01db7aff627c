use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use tokio_util::sync::CancellationToken;

use wharf::Wharf;
use wharf::config::{self, APP_NAME, WharfConfig};
use wharf::container::SqliteContainerStore;
use wharf::db::Database;
use wharf::permissions::RoleGate;
use wharf::runtime::{ContainerRuntime, RuntimeType};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_path.display());

    match cli.command {
        Command::Serve => async_serve(ctx),
        Command::Check => async_check(ctx),
        Command::Config => handle_config(&ctx),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Wharf - containerized workspaces with terminals and port forwarding.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "WHARF_CONFIG")]
    config: Option<PathBuf>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Emit JSON log lines
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Restore state and manage containers until interrupted
    Serve,
    /// Check that the container runtime is reachable
    Check,
    /// Print the effective configuration as TOML
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_path: PathBuf,
    config: WharfConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_path = match common.config.clone() {
            Some(path) => path,
            None => {
                let path = config::default_config_path()?;
                config::write_default(&path)?;
                path
            }
        };
        let config = config::load(&config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?;
        Ok(Self {
            common,
            config_path,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={}", level.as_str().to_lowercase())));

        if self.common.json || self.config.logging.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()
                .ok();
        }

        // The library logs through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
        let configured = self
            .config
            .logging
            .level
            .parse()
            .unwrap_or(LevelFilter::Info);
        match self.common.verbose {
            0 => configured,
            1 => configured.max(LevelFilter::Debug),
            _ => LevelFilter::Trace,
        }
    }

    fn runtime(&self) -> ContainerRuntime {
        let settings = &self.config.runtime;
        match (settings.runtime, settings.binary.as_deref()) {
            (Some(runtime_type), Some(binary)) => {
                ContainerRuntime::with_binary(runtime_type, binary)
            }
            (Some(runtime_type), None) => ContainerRuntime::with_type(runtime_type),
            (None, Some(binary)) => {
                ContainerRuntime::with_binary(guess_runtime_type(binary), binary)
            }
            (None, None) => ContainerRuntime::new(),
        }
    }
}

fn guess_runtime_type(binary: &str) -> RuntimeType {
    if binary.contains("docker") {
        RuntimeType::Docker
    } else {
        RuntimeType::Podman
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext) -> Result<()> {
    let db_path = ctx.config.database_path()?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let database = Database::new(&db_path)
        .await
        .with_context(|| format!("opening database {}", db_path.display()))?;

    let runtime = ctx.runtime();
    info!(
        "using {} runtime ({})",
        runtime.runtime_type(),
        runtime.binary()
    );
    let store = Arc::new(SqliteContainerStore::new(database.pool().clone()));
    let gate = Arc::new(RoleGate::from_settings(&ctx.config.permissions));
    let wharf = Wharf::new(Arc::new(runtime), store, gate, &ctx.config)
        .context("initializing managers")?;

    let cancel = CancellationToken::new();
    let (report, tasks) = wharf
        .start(cancel.clone())
        .await
        .context("restoring containers")?;
    tracing::info!(
        containers = report.containers,
        dropped = report.dropped,
        forwards = report.forwards,
        "wharf ready"
    );

    shutdown_signal().await;
    info!("shutdown signal received, closing sessions and forwards...");
    cancel.cancel();
    wharf.shutdown().await;
    for task in tasks {
        if let Err(e) = task.await {
            warn!("background task ended abnormally: {e}");
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn async_check(ctx: RuntimeContext) -> Result<()> {
    let runtime = ctx.runtime();
    let version = runtime
        .health_check()
        .await
        .with_context(|| format!("checking {} runtime", runtime.runtime_type()))?;
    println!("{} ({}) is available: {}", runtime.runtime_type(), runtime.binary(), version);
    Ok(())
}

fn handle_config(ctx: &RuntimeContext) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&ctx.config).context("serializing configuration to TOML")?;
    println!("# {}", ctx.config_path.display());
    print!("{rendered}");
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_global_flags() {
        let cli = Cli::try_parse_from(["wharf", "-vv", "--json", "serve"]).unwrap();
        assert_eq!(cli.common.verbose, 2);
        assert!(cli.common.json);
        assert!(matches!(cli.command, Command::Serve));
    }

    #[test]
    fn test_guess_runtime_type() {
        assert_eq!(guess_runtime_type("/usr/local/bin/docker"), RuntimeType::Docker);
        assert_eq!(guess_runtime_type("podman-remote"), RuntimeType::Podman);
    }
}
