//! kproxy CLI - Local proxy for Kubernetes clusters behind a remote authority

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod mfa;
mod profile;
mod proxy_kube;

use profile::ProfileManager;
use proxy_kube::ProxyKubeArgs;

/// kproxy - Reach Kubernetes clusters through a local proxy
#[derive(Parser, Debug)]
#[command(name = "kproxy")]
#[command(about = "Reach Kubernetes clusters through a local proxy", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Profile directory (default: ~/.kproxy)
    #[arg(long, global = true, env = "KPROXY_HOME")]
    home: Option<PathBuf>,

    /// Proxy address (host:port), overrides the profile
    #[arg(long, global = true, env = "KPROXY_PROXY")]
    proxy: Option<String>,

    /// User name, overrides the profile
    #[arg(long, global = true, env = "KPROXY_USER")]
    user: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run local proxies
    Proxy {
        #[command(subcommand)]
        command: ProxyCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ProxyCommands {
    /// Start a local proxy for Kubernetes clusters
    #[command(long_about = r#"
Start a local proxy for one or more Kubernetes clusters and write a
kubeconfig that routes kubectl through it.

EXAMPLES:
  # Proxy two kube clusters of the root cluster
  kproxy proxy kube prod staging

  # Proxy the clusters already in the default kubeconfig on a fixed port
  kproxy proxy kube --port 8443

  # Evaluate the export line directly in fish
  kproxy proxy kube prod --format fish | source

ENVIRONMENT VARIABLES:
  KPROXY_HOME        Profile directory
  KPROXY_PROXY       Proxy address
  KPROXY_USER        User name
  KPROXY_CLUSTER     Remote cluster
  KPROXY_KUBECONFIG  Where to write the kubeconfig
    "#)]
    Kube(ProxyKubeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level)?;
    debug!(
        "kproxy {} ({}) built {}",
        env!("GIT_TAG"),
        env!("GIT_HASH"),
        env!("BUILD_TIME")
    );

    let profiles = ProfileManager::new(cli.home)?;
    let mut profile = profiles.load()?;
    if let Some(proxy) = cli.proxy {
        profile.proxy_addr = Some(proxy);
    }
    if let Some(user) = cli.user {
        profile.username = Some(user);
    }

    let result = match cli.command {
        Commands::Proxy {
            command: ProxyCommands::Kube(args),
        } => proxy_kube::run(args, &profiles, profile).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
