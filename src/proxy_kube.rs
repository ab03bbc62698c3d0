//! `kproxy proxy kube` command

use anyhow::{bail, Context, Result};
use clap::{Args, ValueEnum};
use kproxy_credentials::{
    ClusterSelector, CredentialResolver, FileCredentialStore, HttpAuthority, HttpAuthorityConfig,
    KeyDir,
};
use kproxy_lib::{
    local_proxy_clusters_from_config, make_kube_local_proxy, ConfigPublisher, KubeConfig,
    LocalProxyConfig, ProxyError, PublisherConfig,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mfa::TerminalMfaPrompt;
use crate::profile::{Profile, ProfileManager};

/// Output format of the start banner
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShellFormat {
    Text,
    Bash,
    Fish,
    Powershell,
    Cmd,
}

impl ShellFormat {
    /// Shell statement pointing KUBECONFIG at `path`
    pub fn export_line(&self, path: &Path) -> String {
        let path = path.display();
        match self {
            ShellFormat::Text | ShellFormat::Bash => format!("export KUBECONFIG={}", path),
            ShellFormat::Fish => format!("set -gx KUBECONFIG {}", path),
            ShellFormat::Powershell => format!("$Env:KUBECONFIG=\"{}\"", path),
            ShellFormat::Cmd => format!("set KUBECONFIG={}", path),
        }
    }
}

#[derive(Args, Debug)]
pub struct ProxyKubeArgs {
    /// Kube clusters to proxy; defaults to the local proxy contexts in the
    /// default kubeconfig
    pub kube_clusters: Vec<String>,

    /// Remote cluster the kube clusters are routed through
    #[arg(short = 'c', long = "cluster", env = "KPROXY_CLUSTER")]
    pub remote_cluster: Option<String>,

    /// Kubernetes user to impersonate
    #[arg(long = "as")]
    pub impersonate_user: Option<String>,

    /// Kubernetes groups to impersonate
    #[arg(long = "as-groups", value_delimiter = ',')]
    pub impersonate_groups: Vec<String>,

    /// Default namespace of the generated contexts
    #[arg(short = 'n', long = "kube-namespace")]
    pub namespace: Option<String>,

    /// Local port for the proxy; 0 picks a free one
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Output format of the start banner
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: ShellFormat,

    /// Write the kubeconfig here instead of the profile directory
    #[arg(long, env = "KPROXY_KUBECONFIG")]
    pub kubeconfig_out: Option<PathBuf>,
}

/// Selectors from the command line, or from the default kubeconfig when no
/// kube cluster is named
pub fn cluster_selectors(
    args: &ProxyKubeArgs,
    profile: &Profile,
    base: &KubeConfig,
    kube_cluster_addr: &str,
) -> Result<Vec<ClusterSelector>> {
    let remote_cluster = args
        .remote_cluster
        .clone()
        .or_else(|| profile.site_name.clone());

    if args.kube_clusters.is_empty() {
        let selectors: Vec<ClusterSelector> =
            local_proxy_clusters_from_config(base, kube_cluster_addr)
                .into_iter()
                .filter(|selector| match &remote_cluster {
                    Some(remote) => &selector.remote_cluster == remote,
                    None => true,
                })
                .collect();

        if selectors.is_empty() {
            bail!(
                "No kube clusters to proxy. Name them on the command line, \
                 or add local proxy contexts for {} to your default kubeconfig",
                kube_cluster_addr
            );
        }
        return Ok(selectors);
    }

    let remote_cluster = remote_cluster
        .context("No remote cluster given; pass --cluster or set a site name in the profile")?;

    Ok(args
        .kube_clusters
        .iter()
        .map(|kube_cluster| {
            let mut selector = ClusterSelector::new(&remote_cluster, kube_cluster)
                .with_impersonation(
                    args.impersonate_user.clone().unwrap_or_default(),
                    args.impersonate_groups.clone(),
                );
            if let Some(namespace) = &args.namespace {
                selector = selector.with_namespace(namespace);
            }
            selector
        })
        .collect())
}

/// Two-column table of the clusters about to be proxied
pub fn prepare_table(selectors: &[ClusterSelector]) -> String {
    const REMOTE: &str = "Remote Cluster";
    const KUBE: &str = "Kube Cluster";

    // Format padding counts chars
    let width = selectors
        .iter()
        .map(|selector| selector.remote_cluster.chars().count())
        .chain(std::iter::once(REMOTE.len()))
        .max()
        .unwrap_or(REMOTE.len());
    let kube_width = selectors
        .iter()
        .map(|selector| selector.sub_cluster.chars().count())
        .chain(std::iter::once(KUBE.len()))
        .max()
        .unwrap_or(KUBE.len());

    let mut table = String::from("Preparing the following clusters:\n\n");
    table.push_str(&format!("{:<width$} {}\n", REMOTE, KUBE, width = width));
    table.push_str(&format!(
        "{} {}\n",
        "-".repeat(width),
        "-".repeat(kube_width)
    ));
    for selector in selectors {
        table.push_str(&format!(
            "{:<width$} {}\n",
            selector.remote_cluster,
            selector.sub_cluster,
            width = width
        ));
    }
    table
}

/// What to print once the proxy is listening
///
/// Shell formats print only the export statement so the output can be
/// evaluated directly.
pub fn start_banner(
    addr: SocketAddr,
    random_port: bool,
    format: ShellFormat,
    kubeconfig: &Path,
) -> String {
    if format != ShellFormat::Text {
        return format!("{}\n", format.export_line(kubeconfig));
    }

    let mut banner = format!(
        "Started local proxy for Kubernetes on {}\n\n\
         Set KUBECONFIG to use the local proxy:\n  {}\n",
        addr,
        format.export_line(kubeconfig)
    );
    if random_port {
        banner.push_str(&format!(
            "\nThe proxy picked a random port. Use --port {} to keep the same \
             address and kubeconfig across restarts.\n",
            addr.port()
        ));
    }
    banner
}

fn authority_roots(key_dir: &KeyDir, selectors: &[ClusterSelector]) -> Vec<Vec<u8>> {
    let mut remotes: Vec<&str> = selectors
        .iter()
        .map(|selector| selector.remote_cluster.as_str())
        .collect();
    remotes.sort_unstable();
    remotes.dedup();

    remotes
        .into_iter()
        .filter_map(|remote| std::fs::read(key_dir.cas_path(remote)).ok())
        .collect()
}

pub async fn run(args: ProxyKubeArgs, profiles: &ProfileManager, profile: Profile) -> Result<()> {
    let proxy_host = profile
        .proxy_host()
        .context("No proxy address; pass --proxy or set it in the profile")?
        .to_string();
    let proxy_addr = profile.proxy_addr.clone().unwrap_or_default();
    let username = profile
        .username
        .clone()
        .context("No user; pass --user or set it in the profile")?;
    let kube_cluster_addr = profile
        .kube_cluster_addr()
        .unwrap_or(&proxy_addr)
        .to_string();

    let key_dir = KeyDir::new(profiles.home(), &proxy_host, &username);
    let client_key_pem = key_dir
        .load_or_create_private_key()
        .context("Failed to load client key")?;

    let base = KubeConfig::load_default().context("Failed to load default kubeconfig")?;
    let selectors = cluster_selectors(&args, &profile, &base, &kube_cluster_addr)?;
    print!("{}", prepare_table(&selectors));
    println!();

    let tokens = profile
        .session_tokens()
        .context("No session in the profile; log in first")?;
    let authority = Arc::new(
        HttpAuthority::new(HttpAuthorityConfig {
            base_url: if proxy_addr.starts_with("https://") {
                proxy_addr.clone()
            } else {
                format!("https://{}", proxy_addr)
            },
            client_key_pem,
            tokens: tokens.clone(),
            root_certs_pem: authority_roots(&key_dir, &selectors),
        })
        .context("Failed to create authority client")?,
    );
    let resolver = CredentialResolver::new(
        Arc::new(FileCredentialStore::new(key_dir.clone())),
        authority.clone(),
        Arc::new(TerminalMfaPrompt),
    );

    let config = LocalProxyConfig::new(args.port, kube_cluster_addr.clone(), key_dir.clone());
    let result = make_kube_local_proxy(config, &resolver, &selectors).await;

    // A relogin during resolution renews the session
    let renewed = authority.tokens();
    if renewed != tokens {
        let mut profile = profile.clone();
        profile.set_session_tokens(renewed);
        if let Err(e) = profiles.save(&profile) {
            warn!("Failed to save renewed session: {:#}", e);
        } else {
            debug!("Saved renewed session to profile");
        }
    }

    let proxy = result.context("Failed to start local proxy")?;

    let publisher = ConfigPublisher::new(PublisherConfig {
        path_override: args.kubeconfig_out.clone(),
        key_dir,
        kube_cluster_addr,
    });
    let kubeconfig = proxy
        .write_kubeconfig(&publisher, &base, &selectors)
        .context("Failed to write kubeconfig")?;

    print!(
        "{}",
        start_banner(proxy.addr(), args.port == 0, args.format, &kubeconfig)
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(wait_for_signal(), cancel.clone()));

    let result = proxy.start(cancel).await;
    finish_run(result, proxy.close())?;

    info!("✅ Local proxy stopped");
    Ok(())
}

/// Report the run outcome; a start error wins over a close error
fn finish_run(started: Result<(), ProxyError>, closed: Result<(), ProxyError>) -> Result<()> {
    match (started, closed) {
        (Err(e), closed) => {
            if let Err(close_err) = closed {
                warn!("Failed to close local proxy: {}", close_err);
            }
            Err(e).context("Local proxy stopped with an error")
        }
        (Ok(()), closed) => closed.context("Failed to close local proxy"),
    }
}

/// Cancel once `signal` fires
///
/// Without signal handlers the proxy keeps running until it stops on its own.
async fn cancel_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutting down local proxy...");
            cancel.cancel();
        }
        Err(e) => warn!("Failed to listen for shutdown signals: {}", e),
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => debug!("Received SIGTERM"),
            _ = sigint.recv() => debug!("Received SIGINT (Ctrl+C)"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ProxyKubeArgs,
    }

    fn parse(argv: &[&str]) -> ProxyKubeArgs {
        let mut full = vec!["kube"];
        full.extend_from_slice(argv);
        TestCli::parse_from(full).args
    }

    #[test]
    fn test_export_lines() {
        let path = Path::new("/tmp/kc");
        assert_eq!(ShellFormat::Text.export_line(path), "export KUBECONFIG=/tmp/kc");
        assert_eq!(ShellFormat::Bash.export_line(path), "export KUBECONFIG=/tmp/kc");
        assert_eq!(ShellFormat::Fish.export_line(path), "set -gx KUBECONFIG /tmp/kc");
        assert_eq!(
            ShellFormat::Powershell.export_line(path),
            "$Env:KUBECONFIG=\"/tmp/kc\""
        );
        assert_eq!(ShellFormat::Cmd.export_line(path), "set KUBECONFIG=/tmp/kc");
    }

    #[test]
    fn test_selectors_from_arguments() {
        let args = parse(&[
            "prod",
            "staging",
            "--cluster",
            "clusterA",
            "--as",
            "bob",
            "--as-groups",
            "dev,ops",
            "-n",
            "web",
        ]);
        let selectors =
            cluster_selectors(&args, &Profile::default(), &KubeConfig::default(), "k:3026")
                .unwrap();

        assert_eq!(selectors.len(), 2);
        assert_eq!(selectors[0].remote_cluster, "clusterA");
        assert_eq!(selectors[1].sub_cluster, "staging");
        assert_eq!(selectors[0].impersonate_user, "bob");
        assert_eq!(selectors[0].impersonate_groups, vec!["dev", "ops"]);
        assert_eq!(selectors[0].namespace, "web");
    }

    #[test]
    fn test_remote_cluster_defaults_to_site() {
        let args = parse(&["prod"]);
        let profile = Profile {
            site_name: Some("root".to_string()),
            ..Default::default()
        };
        let selectors =
            cluster_selectors(&args, &profile, &KubeConfig::default(), "k:3026").unwrap();
        assert_eq!(selectors[0].remote_cluster, "root");

        assert!(
            cluster_selectors(&args, &Profile::default(), &KubeConfig::default(), "k:3026")
                .is_err()
        );
    }

    #[test]
    fn test_no_clusters_names_both_remedies() {
        let args = parse(&[]);
        let err = cluster_selectors(&args, &Profile::default(), &KubeConfig::default(), "k:3026")
            .unwrap_err()
            .to_string();
        assert!(err.contains("command line"));
        assert!(err.contains("kubeconfig"));
    }

    #[test]
    fn test_prepare_table() {
        let table = prepare_table(&[
            ClusterSelector::new("clusterA", "prod"),
            ClusterSelector::new("a-much-longer-cluster", "staging"),
        ]);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines[0], "Preparing the following clusters:");
        assert_eq!(lines[2], "Remote Cluster        Kube Cluster");
        assert_eq!(lines[3], "--------------------- ------------");
        assert_eq!(lines[4], "clusterA              prod");
        assert_eq!(lines[5], "a-much-longer-cluster staging");
    }

    #[test]
    fn test_prepare_table_aligns_non_ascii_names() {
        let table = prepare_table(&[
            ClusterSelector::new("zürich", "prod"),
            ClusterSelector::new("a-much-longer-cluster", "staging"),
        ]);
        let lines: Vec<&str> = table.lines().collect();

        assert_eq!(lines[4], format!("zürich{} prod", " ".repeat(15)));
        assert_eq!(lines[5], "a-much-longer-cluster staging");

        let wide = prepare_table(&[ClusterSelector::new("clusterA", "ünïcödé-kube-cluster")]);
        let dashes = wide.lines().nth(3).unwrap();
        assert_eq!(dashes, format!("{} {}", "-".repeat(14), "-".repeat(20)));
    }

    #[test]
    fn test_start_error_wins_over_close_error() {
        let err = finish_run(
            Err(ProxyError::AlreadyStarted),
            Err(ProxyError::Close(Vec::new())),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "Local proxy stopped with an error");
        assert!(matches!(
            err.downcast_ref::<ProxyError>(),
            Some(ProxyError::AlreadyStarted)
        ));

        let err = finish_run(Ok(()), Err(ProxyError::Closed)).unwrap_err();
        assert_eq!(err.to_string(), "Failed to close local proxy");

        assert!(finish_run(Ok(()), Ok(())).is_ok());
    }

    #[tokio::test]
    async fn test_signal_cancels() {
        let cancel = CancellationToken::new();
        cancel_on_signal(async { Ok(()) }, cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_signal_setup_failure_keeps_running() {
        let cancel = CancellationToken::new();
        let no_driver = async {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no signal driver",
            ))
        };
        cancel_on_signal(no_driver, cancel.clone()).await;
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_banner() {
        let addr: SocketAddr = "127.0.0.1:8443".parse().unwrap();
        let path = Path::new("/tmp/kc");

        let text = start_banner(addr, true, ShellFormat::Text, path);
        assert!(text.contains("127.0.0.1:8443"));
        assert!(text.contains("export KUBECONFIG=/tmp/kc"));
        assert!(text.contains("--port 8443"));

        let fixed = start_banner(addr, false, ShellFormat::Text, path);
        assert!(!fixed.contains("--port"));

        assert_eq!(
            start_banner(addr, true, ShellFormat::Fish, path),
            "set -gx KUBECONFIG /tmp/kc\n"
        );
    }
}
