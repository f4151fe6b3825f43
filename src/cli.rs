// CLI module - command-line argument parsing
//
// Flags override environment variables, which override built-in defaults.
// `podchill config --show` prints the effective configuration and exits;
// with no subcommand the proxy runs.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};

/// podchill - scale-to-zero activity proxy for GPU inference pods
#[derive(Parser)]
#[command(name = "podchill")]
#[command(version = VERSION)]
#[command(about = "Scale-to-zero activity proxy for GPU inference pods", long_about = None)]
pub struct Cli {
    /// Port to listen on (overrides PODCHILL_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Namespace of the backend pod (overrides PODCHILL_NAMESPACE)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Default model id (overrides PODCHILL_MODEL_ID)
    #[arg(long)]
    pub model: Option<String>,

    /// Idle timeout, e.g. "10m" or bare seconds (overrides PODCHILL_IDLE_TIMEOUT)
    #[arg(long)]
    pub idle_timeout: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },
}

/// Parse the CLI and fold flags into the env-derived config.
///
/// Returns `None` if a subcommand was handled and the process should exit.
pub fn load() -> Option<Config> {
    let cli = Cli::parse();

    let mut config = Config::from_env();

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(model) = cli.model {
        config.model_id = model;
    }
    if let Some(raw) = cli.idle_timeout {
        if let Ok(secs) = raw.parse::<u64>() {
            config.idle_timeout = std::time::Duration::from_secs(secs);
        } else if let Ok(d) = humantime::parse_duration(&raw) {
            config.idle_timeout = d;
        } else {
            eprintln!("Error: invalid --idle-timeout value: {}", raw);
            std::process::exit(2);
        }
    }

    match cli.command {
        Some(Commands::Config { show }) => {
            if show {
                println!("{:#?}", config);
            } else {
                println!("Usage: podchill config --show");
            }
            None
        }
        None => Some(config),
    }
}
