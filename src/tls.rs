//! Mutually authenticated HTTPS listener.
//!
//! Builds the rustls server configuration (client certificates required and
//! verified against the configured CA bundle, TLS 1.2 minimum) and wraps the
//! axum-server acceptor so the verified peer certificate is visible to
//! request handlers through a request extension. Fingerprint pinning itself
//! happens at the application layer, in the dispatcher.

use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tower_http::add_extension::{AddExtension, AddExtensionLayer};

/// DER encoding of the client certificate presented on this connection,
/// if one was presented.
#[derive(Debug, Clone)]
pub struct ClientCert(pub Option<Vec<u8>>);

/// Assemble the listener TLS configuration.
pub fn server_config(
    cert_path: &Path,
    key_path: &Path,
    client_ca_path: &Path,
) -> Result<ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(client_ca_path)? {
        roots
            .add(cert)
            .context("failed to add client ca certificate to the trust store")?;
    }
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("failed to build client certificate verifier")?;

    let config = ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_client_cert_verifier(verifier)
    .with_single_cert(certs, key)
    .context("failed to assemble tls configuration")?;
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("failed to parse private key in {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Acceptor that performs the TLS handshake and then exposes the peer
/// certificate to handlers as a [`ClientCert`] extension.
#[derive(Clone)]
pub struct MutualTlsAcceptor {
    inner: RustlsAcceptor,
}

impl MutualTlsAcceptor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config))),
        }
    }
}

impl<I, S> Accept<I, S> for MutualTlsAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, ClientCert>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;

            let (_, connection) = stream.get_ref();
            let peer = connection
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec());

            let service = AddExtensionLayer::new(ClientCert(peer)).layer(service);
            Ok((stream, service))
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::ca::init_tls_ca;
    use crate::config::Settings;
    use crate::store::KeyStore;

    #[test]
    fn generated_material_yields_a_working_listener_config() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            sslkey: dir.path().join("cursed.key"),
            sslcert: dir.path().join("cursed.crt"),
            sslca: dir.path().join("ca.crt"),
            ..Settings::default()
        };
        let store = KeyStore::open(&dir.path().join("cursed.db")).unwrap();
        let ca = init_tls_ca(&settings, &store).unwrap();

        // The generated EC key and certificate must satisfy rustls, with
        // the CA file accepted as the client trust anchor.
        server_config(&settings.sslcert, &settings.sslkey, &ca.client_ca).unwrap();
    }

    #[test]
    fn missing_key_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            sslkey: dir.path().join("cursed.key"),
            sslcert: dir.path().join("cursed.crt"),
            sslca: dir.path().join("ca.crt"),
            ..Settings::default()
        };
        let store = KeyStore::open(&dir.path().join("cursed.db")).unwrap();
        init_tls_ca(&settings, &store).unwrap();

        let missing = dir.path().join("nope.key");
        assert!(server_config(&settings.sslcert, &missing, &settings.sslca).is_err());
    }
}
