//! termbridge session host
//!
//! Serves interactive shell sessions over WebSocket channels.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::session::{resolve_shell, RegistrySettings, SessionRegistry};
use daemon::Server;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// termbridge - serve shell sessions over WebSocket channels.
#[derive(Parser, Debug)]
#[command(name = "termbridge-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the session host
    Start {
        /// Address to listen on (overrides the config file)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,

        /// Shell to launch (overrides config and environment)
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,
    },

    /// Print the shell new sessions would run
    Shell,

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    if let Commands::Start { ref listen, ref shell } = cli.command {
        if let Some(listen) = listen {
            config.daemon.listen_addr = listen.clone();
        }
        if let Some(shell) = shell {
            config.session.default_shell = Some(shell.clone());
        }
    }

    config.validate()?;

    let _log_guard = init_logging(&config, cli.verbose)?;

    match cli.command {
        Commands::Start { .. } => run(config).await,
        Commands::Shell => {
            println!("{}", resolve_shell(config.session.default_shell.as_deref()));
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shell = resolve_shell(config.session.default_shell.as_deref());
    let registry = Arc::new(SessionRegistry::new(RegistrySettings::from_config(
        &config, shell,
    )));

    let addr = config.listen_addr()?;
    let server = Server::bind(addr, registry)
        .await
        .with_context(|| format!("Cannot listen on {addr}"))?;

    tracing::info!(
        addr = %server.local_addr()?,
        grace_secs = config.session.reconnect_grace_secs,
        "termbridge session host started"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    server.run(shutdown).await?;
    tracing::info!("termbridge session host stopped");
    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Initializes tracing. Returns the file appender guard, which must live as
/// long as the process logs.
fn init_logging(
    config: &Config,
    verbose: bool,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.daemon.log_level.to_lowercase()))
    };

    let (file_layer, guard) = match config.daemon.log_dir {
        Some(ref dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "termbridge.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl-C");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_start_command() {
        let cli = Cli::try_parse_from(["termbridge-daemon", "start"]).unwrap();
        match cli.command {
            Commands::Start { listen, shell } => {
                assert!(listen.is_none());
                assert!(shell.is_none());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_start_with_overrides() {
        let cli = Cli::try_parse_from([
            "termbridge-daemon",
            "-v",
            "start",
            "--listen",
            "127.0.0.1:4000",
            "--shell",
            "/bin/sh",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Start { listen, shell } => {
                assert_eq!(listen.as_deref(), Some("127.0.0.1:4000"));
                assert_eq!(shell.as_deref(), Some("/bin/sh"));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli =
            Cli::try_parse_from(["termbridge-daemon", "shell", "--config", "/tmp/tb.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/tb.toml")));
        assert!(matches!(cli.command, Commands::Shell));
    }

    #[test]
    fn test_init_config_force() {
        let cli = Cli::try_parse_from(["termbridge-daemon", "init-config", "--force"]).unwrap();
        assert!(matches!(cli.command, Commands::InitConfig { force: true }));
    }

    #[test]
    fn test_missing_subcommand_is_error() {
        assert!(Cli::try_parse_from(["termbridge-daemon"]).is_err());
    }

    #[test]
    fn test_init_config_writes_and_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("termbridge").join("config.toml");

        init_config(&path, false).unwrap();
        assert_eq!(Config::load(&path).unwrap(), Config::default());

        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
    }
}
