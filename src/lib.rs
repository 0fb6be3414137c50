//! cursed - short-lived credential issuance service.
//!
//! Signs SSH user certificates and TLS client certificates on behalf of a
//! trusted reverse proxy (the "broker"). The broker authenticates end users
//! and forwards the authenticated identity plus a CSR or SSH public key
//! over a mutually authenticated TLS channel; this crate pins the broker's
//! certificate fingerprint, validates the request (identity binding, CSR
//! self-signature, key-age policy), allocates a monotonic serial from an
//! embedded key-tracking store, signs with the long-lived CA key, and
//! returns the certificate.
//!
//! # Components
//!
//! - [`config`]: TOML settings with defaults and the immutable runtime view
//! - [`store`]: key-tracking store (first-seen timestamps, serial counter)
//! - [`ca`]: CA material bootstrap, loading, and reconciliation
//! - [`x509`]: certificate factory for the CA and TLS client certificates
//! - [`sshcert`]: SSH user-certificate construction
//! - [`tls`]: mutually authenticated listener plumbing
//! - [`web`]: the two issuance endpoints
//!
//! The CA material is generated once on first start if absent and never
//! rotated at runtime. Per-request state does not survive the response.

pub mod ca;
pub mod config;
pub mod error;
pub mod sshcert;
pub mod store;
pub mod tls;
pub mod web;
pub mod x509;

pub use config::{Config, Settings};
pub use error::IssueError;
pub use store::KeyStore;
pub use web::{router, AppState};
