//! Certificate factory.
//!
//! Pure transformation from [`CertOptions`] to a signed certificate,
//! returned both PEM-encoded (the wire form handed back to the broker) and
//! DER-encoded (for fingerprinting). Two shapes are produced: the
//! self-signed CA itself, and client certificates that adopt the subject
//! and public key of a validated CSR.

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Name, X509Req, X509};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// Inputs for certificate construction.
pub struct CertOptions<'a> {
    /// Issuer certificate; `None` for self-signed CA construction.
    pub ca: Option<&'a X509>,
    /// Signing key.
    pub ca_key: &'a PKeyRef<Private>,
    /// Request to fulfil; `None` when building the CA itself.
    pub csr: Option<&'a X509Req>,
    /// Common name for CA construction.
    pub cn: Option<&'a str>,
    pub is_ca: bool,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    /// DNS subject alternative name for CA construction.
    pub san: Option<&'a str>,
    pub serial: u64,
}

/// Sign the certificate described by `opts`, returning `(pem, der)`.
pub fn sign_cert(opts: &CertOptions<'_>) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;

    let serial_bn = BigNum::from_slice(&opts.serial.to_be_bytes())?;
    let serial = serial_bn.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    let not_before = asn1_time(opts.not_before)?;
    let not_after = asn1_time(opts.not_after)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    if opts.is_ca {
        let cn = opts
            .cn
            .ok_or_else(|| anyhow!("CA construction requires a common name"))?;
        let mut name = X509Name::builder()?;
        name.append_entry_by_nid(Nid::COMMONNAME, cn)?;
        let name = name.build();
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(opts.ca_key)?;

        let mut bc = BasicConstraints::new();
        bc.critical();
        bc.ca();
        builder.append_extension(bc.build()?)?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.key_cert_sign();
        ku.crl_sign();
        ku.digital_signature();
        builder.append_extension(ku.build()?)?;

        if let Some(san) = opts.san {
            let san = SubjectAlternativeName::new()
                .dns(san)
                .build(&builder.x509v3_context(None, None))?;
            builder.append_extension(san)?;
        }
    } else {
        let csr = opts
            .csr
            .ok_or_else(|| anyhow!("client construction requires a CSR"))?;
        let ca = opts
            .ca
            .ok_or_else(|| anyhow!("client construction requires an issuer"))?;

        // Subject and public key come from the request; everything else is
        // dictated here.
        builder.set_subject_name(csr.subject_name())?;
        builder.set_issuer_name(ca.subject_name())?;
        let csr_pubkey = csr.public_key()?;
        builder.set_pubkey(&csr_pubkey)?;

        let mut eku = ExtendedKeyUsage::new();
        eku.client_auth();
        builder.append_extension(eku.build()?)?;
    }

    builder.sign(opts.ca_key, MessageDigest::sha256())?;
    let cert = builder.build();

    let pem = cert.to_pem().context("failed to PEM-encode certificate")?;
    let der = cert.to_der().context("failed to DER-encode certificate")?;
    Ok((pem, der))
}

/// SHA-256 fingerprint of a certificate's DER encoding.
pub fn cert_fingerprint(cert: &X509) -> Result<Vec<u8>> {
    Ok(cert.digest(MessageDigest::sha256())?.to_vec())
}

/// Common name of a certificate subject, when present.
pub fn subject_cn(cert: &X509) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|data| data.to_string())
}

/// Common name of a CSR subject, when present.
pub fn csr_subject_cn(csr: &X509Req) -> Option<String> {
    csr.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|data| data.to_string())
}

fn asn1_time(t: SystemTime) -> Result<Asn1Time> {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .context("certificate validity predates the epoch")?
        .as_secs();
    Ok(Asn1Time::from_unix(secs as i64)?)
}
