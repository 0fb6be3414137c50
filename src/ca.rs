//! CA material management.
//!
//! Owns the TLS signing CA (certificate plus EC private key) and the SSH CA
//! signer for the process lifetime. On first start, when no key material
//! exists on disk, a fresh CA is generated and written; on later starts the
//! existing material is loaded and never rotated.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use ssh_key::PrivateKey as SshPrivateKey;
use tracing::{info, warn};

use crate::config::Settings;
use crate::store::KeyStore;
use crate::x509::{sign_cert, CertOptions};

/// Subject common name stamped into a self-generated CA certificate.
const CA_COMMON_NAME: &str = "curse";

/// Parsed TLS CA material, held in memory for the process lifetime.
pub struct TlsCa {
    pub cert: X509,
    pub key: PKey<Private>,
    /// Trust anchor file for verifying broker client certificates. Falls
    /// back to the server certificate when no discrete CA file exists.
    pub client_ca: PathBuf,
}

/// Reconcile on-disk CA material and load it.
///
/// Neither key nor cert present: generate both and seed the serial counter.
/// Exactly one present: refuse to start. A missing discrete `sslca` file
/// falls back to the server certificate with a warning.
pub fn init_tls_ca(settings: &Settings, store: &KeyStore) -> Result<TlsCa> {
    let key_exists = settings.sslkey.exists();
    let cert_exists = settings.sslcert.exists();

    if !key_exists && !cert_exists {
        generate_ca(settings, store)?;
    } else if key_exists != cert_exists {
        bail!(
            "error initializing ca certificate: {} and {} must either both exist or both be absent",
            settings.sslkey.display(),
            settings.sslcert.display()
        );
    }

    let client_ca = if settings.sslca.exists() {
        settings.sslca.clone()
    } else {
        warn!(
            "discrete ca cert {} not found, using sslcert file as ca cert: {}",
            settings.sslca.display(),
            settings.sslcert.display()
        );
        settings.sslcert.clone()
    };

    let (cert, key) = load_tls_ca(&settings.sslkey, &settings.sslcert)?;
    Ok(TlsCa {
        cert,
        key,
        client_ca,
    })
}

fn generate_ca(settings: &Settings, store: &KeyStore) -> Result<()> {
    let group = EcGroup::from_curve_name(curve_nid(&settings.sslkeycurve)?)?;
    let ec_key = EcKey::generate(&group).context("failed to generate ca private key")?;
    let key_pem = ec_key.private_key_to_pem()?;
    let key = PKey::from_ec_key(ec_key)?;

    let not_before = SystemTime::now();
    let not_after =
        not_before + Duration::from_secs(u64::from(settings.sslcaduration) * 24 * 60 * 60);

    let opts = CertOptions {
        ca: None,
        ca_key: &key,
        csr: None,
        cn: Some(CA_COMMON_NAME),
        is_ca: true,
        not_before,
        not_after,
        san: Some(&settings.sslcerthostname),
        serial: 1,
    };
    let (cert_pem, _) = sign_cert(&opts).context("failed to generate ca cert")?;

    write_file(&settings.sslkey, &key_pem, 0o600)
        .context("failed to write ca private key file")?;
    write_file(&settings.sslcert, &cert_pem, 0o644).context("failed to write cert file")?;
    write_file(&settings.sslca, &cert_pem, 0o644).context("failed to write ca cert file")?;
    info!(
        "generated new ca certificate at {}",
        settings.sslcert.display()
    );

    // The CA itself consumed serial 1.
    store
        .set_serial(1)
        .context("failed to seed the serial counter")?;
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(())
}

fn curve_nid(name: &str) -> Result<Nid> {
    match name {
        "p256" => Ok(Nid::X9_62_PRIME256V1),
        "p384" => Ok(Nid::SECP384R1),
        "p521" => Ok(Nid::SECP521R1),
        other => bail!("unsupported sslkeycurve: {other}"),
    }
}

fn load_tls_ca(key_path: &Path, cert_path: &Path) -> Result<(X509, PKey<Private>)> {
    let key_pem = fs::read(key_path)
        .with_context(|| format!("failed to read tls key file {}", key_path.display()))?;
    let ec_key = EcKey::private_key_from_pem(&key_pem)
        .with_context(|| format!("failed to parse tls key file {}", key_path.display()))?;
    let key = PKey::from_ec_key(ec_key)?;

    let cert_pem = fs::read(cert_path)
        .with_context(|| format!("failed to read tls cert file {}", cert_path.display()))?;
    let cert = X509::from_pem(&cert_pem)
        .with_context(|| format!("failed to parse tls cert file {}", cert_path.display()))?;

    Ok((cert, key))
}

/// SHA-256 fingerprint over the DER form of the certificate at `path`.
/// This is the identity the broker must present on every request.
pub fn broker_fingerprint(path: &Path) -> Result<Vec<u8>> {
    let pem = fs::read(path)
        .with_context(|| format!("failed to read broker certificate {}", path.display()))?;
    let cert = X509::from_pem(&pem)
        .with_context(|| format!("failed to parse broker certificate {}", path.display()))?;
    let digest = cert.digest(MessageDigest::sha256())?;
    Ok(digest.to_vec())
}

/// Load the SSH CA signing key (OpenSSH private key format). The key must
/// be provisioned ahead of time; there is no SSH CA bootstrap.
pub fn load_ssh_ca(path: &Path) -> Result<SshPrivateKey> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read ssh ca key {}", path.display()))?;
    SshPrivateKey::from_openssh(&raw)
        .with_context(|| format!("failed to parse ssh ca key {}", path.display()))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn temp_settings(dir: &TempDir) -> Settings {
        Settings {
            sslkey: dir.path().join("cursed.key"),
            sslcert: dir.path().join("cursed.crt"),
            sslca: dir.path().join("ca.crt"),
            ..Settings::default()
        }
    }

    fn temp_store(dir: &TempDir) -> KeyStore {
        KeyStore::open(&dir.path().join("cursed.db")).unwrap()
    }

    fn file_mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn first_start_generates_material() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir);
        let store = temp_store(&dir);

        let ca = init_tls_ca(&settings, &store).unwrap();

        assert_eq!(file_mode(&settings.sslkey), 0o600);
        assert_eq!(file_mode(&settings.sslcert), 0o644);
        assert_eq!(file_mode(&settings.sslca), 0o644);
        assert_eq!(ca.client_ca, settings.sslca);
        assert_eq!(crate::x509::subject_cn(&ca.cert).as_deref(), Some("curse"));

        // Serial 1 went to the CA; the next certificate gets 2.
        assert_eq!(store.next_serial().unwrap(), 2);
    }

    #[test]
    fn second_start_reloads_without_regenerating() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir);
        let store = temp_store(&dir);

        init_tls_ca(&settings, &store).unwrap();
        let first = fs::read(&settings.sslcert).unwrap();

        let ca = init_tls_ca(&settings, &store).unwrap();
        let second = fs::read(&settings.sslcert).unwrap();
        assert_eq!(first, second);
        assert_eq!(ca.cert.to_pem().unwrap(), first);
    }

    #[test]
    fn asymmetric_material_refuses_to_start() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir);
        let store = temp_store(&dir);

        init_tls_ca(&settings, &store).unwrap();
        fs::remove_file(&settings.sslkey).unwrap();

        assert!(init_tls_ca(&settings, &store).is_err());
    }

    #[test]
    fn missing_discrete_ca_falls_back_to_server_cert() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir);
        let store = temp_store(&dir);

        init_tls_ca(&settings, &store).unwrap();
        fs::remove_file(&settings.sslca).unwrap();

        let ca = init_tls_ca(&settings, &store).unwrap();
        assert_eq!(ca.client_ca, settings.sslcert);
    }

    #[test]
    fn unknown_curve_is_rejected() {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            sslkeycurve: "p192".to_string(),
            ..temp_settings(&dir)
        };
        let store = temp_store(&dir);
        assert!(init_tls_ca(&settings, &store).is_err());
    }

    #[test]
    fn broker_fingerprint_matches_der_digest() {
        let dir = TempDir::new().unwrap();
        let settings = temp_settings(&dir);
        let store = temp_store(&dir);
        init_tls_ca(&settings, &store).unwrap();

        let fp = broker_fingerprint(&settings.sslcert).unwrap();
        assert_eq!(fp.len(), 32);

        let cert = X509::from_pem(&fs::read(&settings.sslcert).unwrap()).unwrap();
        use openssl::sha::sha256;
        assert_eq!(fp, sha256(&cert.to_der().unwrap()).to_vec());
    }
}
