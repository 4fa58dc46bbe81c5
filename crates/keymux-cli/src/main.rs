//! keymux CLI - key-rotating intercepting proxy for one upstream API.
//!
//! Configuration comes from the environment (see the deployment docs);
//! flags override individual values. Runs until SIGINT/SIGTERM, exits
//! non-zero on fatal startup errors.

use clap::Parser;
use keymux::config::KeySource;
use keymux::ProxyConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keymux", version, about = "Key-rotating HTTPS-intercepting proxy")]
struct Cli {
    /// Listen address (overrides LISTEN_ADDR)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Comma-separated upstream API key pool (overrides API_KEYS)
    #[arg(long, value_delimiter = ',')]
    api_keys: Option<Vec<String>>,

    /// Origin hostname to intercept (overrides INTERCEPT_HOST)
    #[arg(long)]
    intercept_host: Option<String>,

    /// Upstream HTTP CONNECT proxy URL (overrides UPSTREAM_PROXY)
    #[arg(long)]
    upstream_proxy: Option<String>,

    /// Directory for the root CA material (overrides CA_DIR)
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Client credential location: header or query (overrides AUTH_KEY_SOURCE)
    #[arg(long)]
    auth_key_source: Option<KeySource>,

    /// Print the root CA certificate PEM and exit
    #[arg(long)]
    export_ca: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("keymux: {}", e);
        std::process::exit(1);
    }
}

fn run() -> keymux::Result<()> {
    let cli = Cli::parse();

    let mut config = ProxyConfig::from_env()?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(keys) = cli.api_keys {
        config.api_keys = keys;
    }
    if let Some(host) = cli.intercept_host {
        config.intercept_host = host.to_ascii_lowercase();
    }
    if let Some(proxy) = cli.upstream_proxy {
        config.upstream_proxy = Some(proxy);
    }
    if let Some(dir) = cli.ca_dir {
        config.ca_dir = dir;
    }
    if let Some(source) = cli.auth_key_source {
        config.auth.key_source = source;
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| keymux::ProxyError::Config(format!("cannot start runtime: {}", e)))?;

    if cli.export_ca {
        return runtime.block_on(export_ca(config));
    }

    runtime.block_on(serve(config))
}

async fn serve(config: ProxyConfig) -> keymux::Result<()> {
    let handle = keymux::start(config).await?;
    info!(addr = %handle.local_addr, "keymux running, ctrl-c to stop");

    wait_for_signal().await;
    handle.shutdown();
    info!("shut down cleanly");
    Ok(())
}

/// Print the root certificate so operators can install it into client
/// trust stores.
async fn export_ca(config: ProxyConfig) -> keymux::Result<()> {
    let ca_dir = config.ca_dir.clone();
    let ca = tokio::task::spawn_blocking(move || keymux::ca::CertificateAuthority::open(&ca_dir))
        .await
        .map_err(|e| keymux::ProxyError::Ca(format!("CA init task failed: {}", e)))??;
    print!("{}", ca.root_certificate_pem());
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
