//! SSH user-certificate construction.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use ssh_key::certificate::{Builder, CertType, Certificate};
use ssh_key::rand_core::OsRng;
use ssh_key::{PrivateKey, PublicKey};

use crate::config::Config;

/// Options for a user certificate, materialized from a validated request.
pub struct SshCertOptions<'a> {
    pub public_key: &'a PublicKey,
    pub user: &'a str,
    pub user_ip: &'a str,
    pub serial: u64,
}

/// Build and sign an SSH user certificate.
///
/// The certificate authorizes exactly one principal (the authenticated
/// user), carries the configured extensions, and is pinned to the client's
/// source address when the service requires client IPs.
pub fn sign_user_cert(
    conf: &Config,
    signer: &PrivateKey,
    opts: &SshCertOptions<'_>,
) -> Result<Certificate> {
    let valid_after = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the epoch")?
        .as_secs();
    let valid_before = valid_after + conf.ssh_cert_duration.as_secs();

    let mut builder =
        Builder::new_with_random_nonce(&mut OsRng, opts.public_key, valid_after, valid_before)?;
    builder.serial(opts.serial)?;
    builder.key_id(format!("{}@{}", opts.user, opts.user_ip))?;
    builder.cert_type(CertType::User)?;
    builder.valid_principal(opts.user)?;
    for (name, data) in &conf.exts {
        builder.extension(name.as_str(), data.as_str())?;
    }
    if let Some(program) = &conf.force_cmd {
        builder.critical_option("force-command", program.as_str())?;
    }
    if conf.require_client_ip {
        builder.critical_option("source-address", opts.user_ip)?;
    }

    builder
        .sign(signer)
        .context("failed to sign ssh certificate")
}
