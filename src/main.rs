use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cursed::ca;
use cursed::config::{Config, Settings};
use cursed::store::KeyStore;
use cursed::tls::{server_config, MutualTlsAcceptor};
use cursed::web::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cursed=info,axum=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    settings.validate()?;

    // The SSH CA key is provisioned out of band and must already exist.
    let ssh_signer = ca::load_ssh_ca(&settings.cakeyfile)?;

    let db_path = settings.db_path();
    let store = KeyStore::open(Path::new(&db_path))
        .with_context(|| format!("could not open database file {db_path}"))?;

    // First start generates the TLS CA; later starts reload it.
    let tls_ca = ca::init_tls_ca(&settings, &store)?;

    let broker_fp = ca::broker_fingerprint(&settings.sslbrokercert)?;
    let conf = Config::resolve(&settings, broker_fp)?;

    let tls = server_config(&settings.sslcert, &settings.sslkey, &tls_ca.client_ca)?;

    let state = Arc::new(AppState {
        conf,
        store,
        tls_ca,
        ssh_signer,
    });
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", settings.addr, settings.port)
        .parse()
        .context("invalid listen address")?;
    info!("starting HTTPS server on {addr}");
    axum_server::bind(addr)
        .acceptor(MutualTlsAcceptor::new(tls))
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("listener service failed")?;

    Ok(())
}
