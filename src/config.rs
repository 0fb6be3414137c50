//! Service configuration.
//!
//! Two layers: [`Settings`] is the on-disk TOML form with a default for
//! every key, and [`Config`] is the resolved runtime view handed to request
//! handlers. `Config` is immutable after bootstrap; handlers share it by
//! reference and never synchronize on it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};

/// SSH certificate extensions the service is willing to grant.
const VALID_EXTENSIONS: [&str; 5] = [
    "permit-X11-forwarding",
    "permit-agent-forwarding",
    "permit-port-forwarding",
    "permit-pty",
    "permit-user-rc",
];

/// Stand-in for "unlimited" when a duration option is negative.
const HUNDRED_YEARS: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

const HUNDRED_YEARS_DAYS: i64 = 100 * 365;

/// On-disk settings, one field per config key.
///
/// Durations are plain integers like the shipped config documents them:
/// `duration` and `sslduration` in seconds, `maxkeyage` and `sslcaduration`
/// in days. Negative values mean unlimited where the field allows it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub addr: String,
    pub port: u16,
    pub cakeyfile: PathBuf,
    pub dbfile: String,
    pub duration: i64,
    pub extensions: Vec<String>,
    pub forcecmd: bool,
    pub forcecmdprog: String,
    pub maxkeyage: i64,
    pub requireclientip: bool,
    pub sslbrokercert: PathBuf,
    pub sslbrokerhostname: String,
    pub sslbrokerkey: PathBuf,
    pub sslca: PathBuf,
    pub sslcaduration: u32,
    pub sslcert: PathBuf,
    pub sslcerthostname: String,
    pub sslkey: PathBuf,
    pub sslkeycurve: String,
    pub sslduration: i64,
    pub userheader: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: 81,
            cakeyfile: PathBuf::from("/opt/curse/etc/user_ca"),
            dbfile: "/opt/curse/etc/cursed.db".to_string(),
            duration: 2 * 60,
            extensions: vec!["permit-pty".to_string()],
            forcecmd: false,
            forcecmdprog: String::new(),
            maxkeyage: 90,
            requireclientip: true,
            sslbrokercert: PathBuf::from("/opt/curse/etc/broker.crt"),
            sslbrokerhostname: "localhost".to_string(),
            sslbrokerkey: PathBuf::from("/opt/curse/etc/broker.key"),
            sslca: PathBuf::from("/opt/curse/etc/cursed.crt"),
            sslcaduration: 730,
            sslcert: PathBuf::from("/opt/curse/etc/cursed.crt"),
            sslcerthostname: "localhost".to_string(),
            sslkey: PathBuf::from("/opt/curse/etc/cursed.key"),
            sslkeycurve: "p384".to_string(),
            sslduration: 43200,
            userheader: "REMOTE_USER".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from an explicit TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let settings = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(settings)
    }

    /// Search the usual locations; fall back to built-in defaults when no
    /// config file exists.
    pub fn load() -> Result<Self> {
        for dir in ["/opt/curse/etc", "/etc/curse", "."] {
            let path = Path::new(dir).join("cursed.toml");
            if path.is_file() {
                info!("using config file: {}", path.display());
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    /// TLS mutual authentication is not optional; refuse to start without
    /// the material to enforce it.
    pub fn validate(&self) -> Result<()> {
        if self.sslca.as_os_str().is_empty()
            || self.sslkey.as_os_str().is_empty()
            || self.sslcert.as_os_str().is_empty()
        {
            bail!("sslca, sslkey, and sslcert are required fields");
        }
        Ok(())
    }

    /// Database path with `$HOME` expanded to the service user's home.
    pub fn db_path(&self) -> String {
        expand_home(&self.dbfile)
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SHA-256 fingerprint of the only client certificate allowed to
    /// request signatures.
    pub broker_fp: Vec<u8>,
    /// Header carrying the authenticated username.
    pub user_header: String,
    pub user_regex: Regex,
    pub ssh_cert_duration: Duration,
    pub tls_cert_duration: Duration,
    /// Maximum age of a reusable SSH public key.
    pub key_life_span: chrono::Duration,
    /// Granted SSH extensions, lexically ordered as certificates carry them.
    pub exts: BTreeMap<String, String>,
    /// Program for the `force-command` critical option, when enabled.
    pub force_cmd: Option<String>,
    pub require_client_ip: bool,
}

impl Config {
    /// Resolve settings into the runtime view. The broker fingerprint is
    /// computed separately because it needs the broker certificate on disk.
    pub fn resolve(settings: &Settings, broker_fp: Vec<u8>) -> Result<Self> {
        let ssh_cert_duration = seconds_or_unlimited(settings.duration);
        let tls_cert_duration = seconds_or_unlimited(settings.sslduration);

        let key_life_span = if settings.maxkeyage < 0 {
            chrono::Duration::days(HUNDRED_YEARS_DAYS)
        } else {
            chrono::Duration::days(settings.maxkeyage)
        };

        let force_cmd = if settings.forcecmd {
            if settings.forcecmdprog.is_empty() {
                bail!("forcecmd is enabled but forcecmdprog is not set");
            }
            Some(settings.forcecmdprog.clone())
        } else {
            None
        };

        // Usernames are limited to 32 characters, must start with a-z or _,
        // and contain only a-z, 0-9, - and _. With TLS mutual auth the
        // certificate fingerprint is accepted in place of a username.
        let user_regex = Regex::new(r"(?i)^([a-z_][a-z0-9_-]{0,31}|[a-f0-9]+)$")
            .context("failed to compile username regex")?;

        Ok(Self {
            broker_fp,
            user_header: settings.userheader.clone(),
            user_regex,
            ssh_cert_duration,
            tls_cert_duration,
            key_life_span,
            exts: validate_extensions(&settings.extensions),
            force_cmd,
            require_client_ip: settings.requireclientip,
        })
    }
}

/// Negative durations mean unlimited.
fn seconds_or_unlimited(seconds: i64) -> Duration {
    if seconds < 0 {
        HUNDRED_YEARS
    } else {
        Duration::from_secs(seconds as u64)
    }
}

/// Filter configured SSH extensions against the known-good list. Unknown
/// names are logged and dropped; startup continues without them.
pub fn validate_extensions(configured: &[String]) -> BTreeMap<String, String> {
    let mut exts = BTreeMap::new();
    for name in configured {
        if VALID_EXTENSIONS.contains(&name.as_str()) {
            exts.insert(name.clone(), String::new());
        } else {
            warn!("invalid extension in config: {name}");
        }
    }
    exts
}

fn expand_home(path: &str) -> String {
    match std::env::var("HOME") {
        Ok(home) => path.replace("$HOME", &home),
        Err(_) => path.to_string(),
    }
}
