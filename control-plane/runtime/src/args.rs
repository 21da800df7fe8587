use crate::{
    admin::Admin,
    api::Api,
    heartbeat::Monitor,
    manager::Manager,
    metrics::AuthzMetrics,
    peer::HttpConnector,
    resources::Resources,
    server,
    tls::{self, TlsConfig},
    token::AccessTokens,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use mesh_control_plane_index::{metrics as index_metrics, ControlIndex};
use prometheus_client::registry::Registry;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{net::TcpListener, sync::watch, time::Duration};
use tokio_rustls::TlsAcceptor;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "mesh", about = "A multi-cluster connectivity control plane")]
pub struct Args {
    #[clap(long, default_value = "mesh=info,warn", env = "MESH_CONTROL_PLANE_LOG")]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    /// The name other peers know this peer by. With TLS, the identity
    /// certificate must carry it as a DNS name.
    #[clap(long, env = "MESH_PEER_NAME")]
    peer_name: String,

    #[clap(long, default_value = "0.0.0.0:8443")]
    api_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    /// PEM bundle of the certificate authorities peers are verified against.
    #[clap(long, requires = "identity")]
    trust_bundle: Option<PathBuf>,

    /// PEM certificate chain and private key presented to peers.
    #[clap(long, requires = "trust_bundle")]
    identity: Option<PathBuf>,

    /// Without TLS, take the requesting peer's name from the `mesh-client-id`
    /// header. For development only: any client can claim any peer.
    #[clap(long, conflicts_with = "trust_bundle")]
    trust_client_id_header: bool,

    #[clap(long, default_value = "5000")]
    peer_timeout_ms: u64,

    #[clap(long, default_value = "10")]
    heartbeat_interval_secs: u64,

    /// A JSON file of peers, imports, exports, policies and pods to load at
    /// startup.
    #[clap(long)]
    resources: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            peer_name,
            api_addr,
            admin_addr,
            trust_bundle,
            identity,
            trust_client_id_header,
            peer_timeout_ms,
            heartbeat_interval_secs,
            resources,
        } = self;

        init_tracing(&log_level, log_format)?;
        let interval = Duration::from_secs(heartbeat_interval_secs);
        if interval.is_zero() {
            bail!("heartbeat interval must be positive");
        }
        info!(peer = %peer_name, "Starting control plane");

        let tls = match (trust_bundle, identity) {
            (Some(trust_bundle), Some(identity)) => Some(TlsConfig {
                trust_bundle: read(&trust_bundle)?,
                identity: read(&identity)?,
            }),
            (None, None) => None,
            _ => bail!("--trust-bundle and --identity must be set together"),
        };
        let acceptor = match &tls {
            Some(config) => {
                let config = tls::server_config(config, &peer_name)
                    .context("invalid TLS configuration")?;
                Some(TlsAcceptor::from(config))
            }
            None => {
                warn!("No TLS configured; peers are served and contacted over plaintext HTTP");
                None
            }
        };
        let connect = HttpConnector::new(tls, Duration::from_millis(peer_timeout_ms));

        // Key generation is CPU bound.
        let tokens = tokio::task::spawn_blocking(AccessTokens::generate)
            .await
            .context("key generation panicked")??;

        let mut prom = <Registry>::default();
        let index = ControlIndex::shared();
        index_metrics::register(prom.sub_registry_with_prefix("control_index"), index.clone());
        let metrics = AuthzMetrics::register(prom.sub_registry_with_prefix("authz"));

        let manager = Arc::new(Manager::new(index, Arc::new(connect), tokens, metrics));
        if let Some(path) = resources {
            Resources::load(&path)?.apply(&manager)?;
        }

        let (ready_tx, ready_rx) = watch::channel(false);
        let admin = bind(admin_addr).await?;
        tokio::spawn(
            server::serve(admin, None, Admin::new(ready_rx, Arc::new(prom)))
                .instrument(info_span!("admin")),
        );

        let mut api = Api::new(manager.clone());
        if trust_client_id_header {
            warn!("Trusting client-supplied peer names");
            api = api.with_client_id_header();
        }
        let listener = bind(api_addr).await?;
        tokio::spawn(server::serve(listener, acceptor, api).instrument(info_span!("api")));

        tokio::spawn(
            Monitor::new(manager)
                .run(interval)
                .instrument(info_span!("heartbeat")),
        );

        let _ = ready_tx.send(true);
        shutdown().await?;
        info!("Shutting down");
        Ok(())
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_new(level).with_context(|| format!("invalid log filter {level}"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Plain => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|error| anyhow!(error))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;
    Ok(())
}
