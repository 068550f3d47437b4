//! vpki demo - HTTPS server with certificates issued per SNI host name
//!
//! Certificates come from an in-process CA by default, or from Vault's PKI
//! engine with `--vault` (configured through VAULT_ADDR, VAULT_TOKEN,
//! VPKI_MOUNT, VPKI_ROLE and VPKI_EMAIL).
//!
//! ```text
//! cargo run --example local_ca_server -- --ca-out /tmp/vpki-ca.pem
//! curl --cacert /tmp/vpki-ca.pem --resolve app.localhost:8443:127.0.0.1 https://app.localhost:8443/
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpki::{
    CacheConfig, LocalCa, PrometheusCertErrors, SignerCapability, TlsServer, TlsServerConfig,
    VaultConfig, VaultSigner, DEFAULT_KEY_STRENGTH,
};

/// Serve HTTPS with certificates issued on demand
#[derive(Parser, Debug)]
#[command(name = "local_ca_server")]
#[command(version)]
struct Cli {
    /// Address to accept TLS connections on
    #[arg(long, env = "VPKI_BIND", default_value = "127.0.0.1:8443")]
    bind: SocketAddr,

    /// Address serving Prometheus metrics over plain HTTP
    #[arg(long, env = "VPKI_METRICS_BIND", default_value = "127.0.0.1:9090")]
    metrics_bind: SocketAddr,

    /// Lifetime of issued certificates, in seconds
    #[arg(long, default_value_t = 3600)]
    ttl_secs: u64,

    /// ECDSA curve size for issued keys (256 or 384)
    #[arg(long, default_value_t = DEFAULT_KEY_STRENGTH)]
    key_strength: u32,

    /// Sign through Vault instead of the in-process CA
    #[arg(long)]
    vault: bool,

    /// Write the in-process CA certificate here, for client trust stores
    #[arg(long)]
    ca_out: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn build_signer(cli: &Cli) -> Result<SignerCapability> {
    if cli.vault {
        let config = VaultConfig::from_env();
        info!("Signing certificates through Vault at {}", config.addr);
        let signer = VaultSigner::new(config).context("Failed to create Vault signer")?;
        return Ok(SignerCapability::issue(signer));
    }

    let ca = LocalCa::generate("vpki demo CA").context("Failed to generate local CA")?;
    if let Some(path) = &cli.ca_out {
        tokio::fs::write(path, ca.ca_cert_pem())
            .await
            .with_context(|| format!("Failed to write CA certificate to {}", path))?;
        info!("Wrote CA certificate to {}", path);
    }

    Ok(SignerCapability::issue(ca))
}

async fn metrics(State(registry): State<Arc<Registry>>) -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let registry = Arc::new(Registry::new());
    let errors = PrometheusCertErrors::registered(&registry)
        .context("Failed to register certificate error counter")?;

    let metrics_app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry);
    let metrics_listener = tokio::net::TcpListener::bind(cli.metrics_bind)
        .await
        .with_context(|| format!("Failed to bind metrics listener on {}", cli.metrics_bind))?;
    info!("Metrics available at http://{}/metrics", cli.metrics_bind);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_app).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let signer = build_signer(&cli).await?;
    let config = TlsServerConfig {
        bind_addr: cli.bind,
        cache: CacheConfig {
            ttl: Duration::from_secs(cli.ttl_secs),
            key_strength: cli.key_strength,
            ..Default::default()
        },
        ..Default::default()
    };

    let app = Router::new().route("/", get(|| async { "Hello from vpki!\n" }));

    TlsServer::new(config, signer)
        .with_error_counter(Arc::new(errors))
        .serve(app)
        .await
        .context("TLS server failed")
}
