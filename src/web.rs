//! Request dispatcher.
//!
//! Two issuance endpoints on one mutually authenticated listener:
//! `POST /` signs SSH user certificates, `POST /auth/` signs TLS client
//! certificates. Every request is first authenticated by comparing the
//! peer certificate's SHA-256 fingerprint against the pinned broker
//! fingerprint; only then do admission checks and signing run. All state a
//! request touches lives in the key-tracking store or the immutable config.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;

use axum::extract::{ConnectInfo, Form, FromRequest, Request, State};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use openssl::x509::{X509Req, X509};
use serde::Deserialize;
use ssh_key::{HashAlg, PrivateKey as SshPrivateKey, PublicKey as SshPublicKey};
use tracing::{error, info, warn};

use crate::ca::TlsCa;
use crate::config::Config;
use crate::error::IssueError;
use crate::sshcert::{sign_user_cert, SshCertOptions};
use crate::store::KeyStore;
use crate::tls::ClientCert;
use crate::x509::{cert_fingerprint, csr_subject_cn, sign_cert, subject_cn, CertOptions};

/// State shared by every handler. Immutable after bootstrap except for the
/// key-tracking store, which serializes its own mutations.
pub struct AppState {
    pub conf: Config,
    pub store: KeyStore,
    pub tls_ca: TlsCa,
    pub ssh_signer: SshPrivateKey,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(ssh_cert_handler))
        .route("/auth/", post(tls_cert_handler))
        .with_state(state)
}

#[derive(Deserialize)]
struct SshIssueForm {
    key: Option<String>,
    #[serde(rename = "userIP")]
    user_ip: Option<String>,
}

#[derive(Deserialize)]
struct TlsIssueForm {
    csr: Option<String>,
    #[serde(rename = "userIP")]
    user_ip: Option<String>,
}

async fn ssh_cert_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<String, IssueError> {
    let conf = &state.conf;
    let remote = remote_addr(&req);
    authenticate_broker(conf, &req, &remote)?;
    let bastion_user = user_header(conf, &req);

    let Form(form) = Form::<SshIssueForm>::from_request(req, &())
        .await
        .map_err(|err| {
            let msg = format!("Param validation failure: {err}");
            warn!("{msg}: ip[{remote}] user[{bastion_user}]");
            IssueError::Validation(msg)
        })?;
    let key = form.key.unwrap_or_default();
    let user_ip = form.user_ip.unwrap_or_default();

    if let Err(reason) = validate_issue_params(conf, &bastion_user, &key, "key", &user_ip) {
        let msg = format!("Param validation failure: {reason}");
        warn!("{msg}: ip[{remote}] user[{bastion_user}]");
        return Err(IssueError::Validation(msg));
    }

    let public_key = SshPublicKey::from_openssh(&key).map_err(|err| {
        warn!("failed to parse public key: ip[{remote}] user[{bastion_user}]: {err}");
        IssueError::Validation("Failed to parse public key".to_string())
    })?;

    // Key-age policy: the first sighting of a key starts its clock, and a
    // key past its lifespan forces the user to rotate.
    let fingerprint = public_key.fingerprint(HashAlg::Sha256);
    let now = Utc::now();
    let first_seen = state
        .store
        .record_first_seen(fingerprint.as_bytes(), now)
        .map_err(|err| {
            error!("failed to record key birthday: {err}");
            IssueError::Storage(err)
        })?;
    if now - first_seen > conf.key_life_span {
        warn!(
            "key too old: ip[{remote}] user[{bastion_user}] fingerprint[{fingerprint}] first seen [{first_seen}]"
        );
        return Err(IssueError::Policy(
            "Public key is past its maximum age, please generate a new key".to_string(),
        ));
    }

    let serial = state.store.next_serial().map_err(|err| {
        error!("failed to allocate certificate serial: {err}");
        IssueError::Storage(err)
    })?;

    let cert = sign_user_cert(
        conf,
        &state.ssh_signer,
        &SshCertOptions {
            public_key: &public_key,
            user: &bastion_user,
            user_ip: &user_ip,
            serial,
        },
    )
    .map_err(|err| {
        error!("failed to generate ssh certificate: {err:#}");
        IssueError::Signing(err)
    })?;

    let text = cert.to_openssh().map_err(|err| {
        error!("failed to serialize ssh certificate: {err}");
        IssueError::Signing(err.into())
    })?;

    info!(
        "SSH request: user[{bastion_user}] from[{user_ip}] serial[{serial}] fingerprint[{fingerprint}]"
    );
    Ok(text + "\n")
}

async fn tls_cert_handler(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<String, IssueError> {
    let conf = &state.conf;
    let remote = remote_addr(&req);
    authenticate_broker(conf, &req, &remote)?;
    let bastion_user = user_header(conf, &req);

    let Form(form) = Form::<TlsIssueForm>::from_request(req, &())
        .await
        .map_err(|err| {
            let msg = format!("Param validation failure: {err}");
            warn!("{msg}: ip[{remote}] user[{bastion_user}]");
            IssueError::Validation(msg)
        })?;
    let csr_pem = form.csr.unwrap_or_default();
    let user_ip = form.user_ip.unwrap_or_default();

    if let Err(reason) = validate_issue_params(conf, &bastion_user, &csr_pem, "csr", &user_ip) {
        let msg = format!("Param validation failure: {reason}");
        warn!("{msg}: ip[{remote}] user[{bastion_user}]");
        return Err(IssueError::Validation(msg));
    }

    let csr = X509Req::from_pem(csr_pem.as_bytes()).map_err(|err| {
        warn!("failed to decode CSR: ip[{remote}] user[{bastion_user}]: {err}");
        IssueError::Validation("Failed to decode CSR".to_string())
    })?;

    // The CSR must verify against its own embedded public key.
    let csr_pubkey = csr.public_key().map_err(|err| {
        warn!("failed to read CSR public key: ip[{remote}] user[{bastion_user}]: {err}");
        IssueError::Validation("Failed to check CSR signature".to_string())
    })?;
    let signature_ok = csr.verify(&csr_pubkey).map_err(|err| {
        warn!("failed to check CSR signature: ip[{remote}] user[{bastion_user}]: {err}");
        IssueError::Validation("Failed to check CSR signature".to_string())
    })?;
    if !signature_ok {
        warn!("bad CSR signature: ip[{remote}] user[{bastion_user}]");
        return Err(IssueError::Validation(
            "Failed to check CSR signature".to_string(),
        ));
    }

    // Identity binding: the name the broker authenticated must be the name
    // being certified.
    let csr_cn = csr_subject_cn(&csr).unwrap_or_default();
    if csr_cn != bastion_user {
        warn!(
            "CSR CommonName mismatch: ip[{remote}] user[{bastion_user}] cn[{csr_cn}], denying request"
        );
        return Err(IssueError::Validation(
            "CSR CommonName field does not match logged-in user, denying request".to_string(),
        ));
    }

    let serial = state.store.next_serial().map_err(|err| {
        error!("failed to allocate certificate serial: {err}");
        IssueError::Storage(err)
    })?;

    let now = SystemTime::now();
    let opts = CertOptions {
        ca: Some(&state.tls_ca.cert),
        ca_key: &state.tls_ca.key,
        csr: Some(&csr),
        cn: None,
        is_ca: false,
        not_before: now,
        not_after: now + conf.tls_cert_duration,
        san: None,
        serial,
    };
    let (pem, der) = sign_cert(&opts).map_err(|err| {
        error!("failed to generate client cert: {err:#}");
        IssueError::Signing(err)
    })?;

    // The DER we hand out must re-parse; anything else is a signing bug.
    let cert = X509::from_der(&der).map_err(|err| {
        error!("error parsing raw certificate: {err}");
        IssueError::Signing(err.into())
    })?;
    let fp = cert_fingerprint(&cert).map_err(IssueError::Signing)?;

    info!(
        "TLS request: user[{bastion_user}] from[{user_ip}] serial[{serial}] fingerprint[{}]",
        hex::encode(fp)
    );
    String::from_utf8(pem).map_err(|err| IssueError::Signing(err.into()))
}

/// Verify the connection comes from the certificate broker. No peer
/// certificate is a malformed connection; a peer certificate with the wrong
/// fingerprint is an unauthorized caller.
fn authenticate_broker(conf: &Config, req: &Request, remote: &str) -> Result<(), IssueError> {
    let peer = req
        .extensions()
        .get::<ClientCert>()
        .and_then(|cert| cert.0.clone());
    let Some(peer) = peer else {
        warn!("invalid connection from ip[{remote}]: no client certificate");
        return Err(IssueError::InvalidConnection);
    };

    let cert = X509::from_der(&peer).map_err(|err| {
        warn!("invalid connection from ip[{remote}]: unparsable client certificate: {err}");
        IssueError::InvalidConnection
    })?;
    let fp = cert_fingerprint(&cert).map_err(IssueError::Signing)?;

    if fp != conf.broker_fp {
        let cn = subject_cn(&cert).unwrap_or_default();
        warn!(
            "not authorized to generate certificates: ip[{remote}] cert[{cn}] fingerprint[{}]",
            hex::encode(&fp)
        );
        return Err(IssueError::NotAuthorized);
    }
    Ok(())
}

fn user_header(conf: &Config, req: &Request) -> String {
    req.headers()
        .get(&conf.user_header)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn remote_addr(req: &Request) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Shape checks shared by both issuance paths. `payload_field` names the
/// form field carrying the CSR or public key, for the diagnostic.
fn validate_issue_params(
    conf: &Config,
    user: &str,
    payload: &str,
    payload_field: &str,
    user_ip: &str,
) -> Result<(), String> {
    if user.is_empty() {
        return Err(format!("{} missing from request", conf.user_header));
    }
    if !conf.user_regex.is_match(user) {
        return Err("username is invalid".to_string());
    }
    if payload.is_empty() {
        return Err(format!("{payload_field} missing from request"));
    }
    if conf.require_client_ip && user_ip.parse::<IpAddr>().is_err() {
        return Err("invalid userIP".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn conf() -> Config {
        Config::resolve(&Settings::default(), vec![0u8; 32]).unwrap()
    }

    #[test]
    fn params_require_a_username() {
        let conf = conf();
        let err = validate_issue_params(&conf, "", "csr-data", "csr", "10.0.0.5").unwrap_err();
        assert!(err.contains("REMOTE_USER missing"));
    }

    #[test]
    fn params_reject_bad_usernames() {
        let conf = conf();
        let err =
            validate_issue_params(&conf, "no spaces allowed", "csr-data", "csr", "10.0.0.5")
                .unwrap_err();
        assert_eq!(err, "username is invalid");
    }

    #[test]
    fn params_require_the_payload_field() {
        let conf = conf();
        let err = validate_issue_params(&conf, "alice", "", "key", "10.0.0.5").unwrap_err();
        assert_eq!(err, "key missing from request");
    }

    #[test]
    fn params_validate_the_client_ip() {
        let conf = conf();
        let err = validate_issue_params(&conf, "alice", "data", "csr", "").unwrap_err();
        assert_eq!(err, "invalid userIP");
        let err = validate_issue_params(&conf, "alice", "data", "csr", "999.0.0.1").unwrap_err();
        assert_eq!(err, "invalid userIP");

        assert!(validate_issue_params(&conf, "alice", "data", "csr", "10.0.0.5").is_ok());
        assert!(validate_issue_params(&conf, "alice", "data", "csr", "2001:db8::1").is_ok());
    }

    #[test]
    fn client_ip_is_optional_when_not_required() {
        let settings = Settings {
            requireclientip: false,
            ..Settings::default()
        };
        let conf = Config::resolve(&settings, vec![0u8; 32]).unwrap();
        assert!(validate_issue_params(&conf, "alice", "data", "csr", "").is_ok());
    }
}
