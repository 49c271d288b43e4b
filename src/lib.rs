//! CA Manager - Personal Certificate Authority Engine
//!
//! A small-office Public Key Infrastructure engine that keeps a private X.509 CA in a plain
//! directory: the root key lives in a passphrase-protected PKCS#12 keystore, and issued
//! certificates, revocations, pending requests and CRLs are stored next to it.
//!
//! # Overview
//!
//! ```text
//! CertificateAuthorityManager
//!   └── CertificateAuthority (one directory, LOCKED until unlocked with the passphrase)
//!       ├── Requests/   pending PKCS#10 requests
//!       ├── Issued/     signed certificates (PKCS#12 bundles)
//!       ├── Revoked/    revoked certificates
//!       ├── X509CRL/    published CRLs
//!       └── Templates/  reusable request parameters
//! ```
//!
//! # Features
//!
//! - **Lock/Unlock**: key material only exists in memory while unlocked, zeroized on lock
//! - **Issuance**: key pairs generated per request or foreign PKCS#10 requests signed as-is
//! - **Revocation & CRLs**: v2 CRLs with CRL numbers and per-entry reason codes
//! - **Codecs**: PEM/DER for certificates, PKCS#7 chains, PKCS#8 keys and PKCS#12 stores
//! - **Change Events**: every mutation is announced to subscribed listeners
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use ca_manager::authority::CertificateAuthority;
//! use ca_manager::certificate_factory::{generate_self_signed_certificate, IssuedCertificate};
//! use ca_manager::certificate_request::CertificateRequest;
//! use ca_manager::key_pair_factory::{generate_key_pair, KeyType};
//! use time::{Duration, OffsetDateTime};
//!
//! fn main() -> ca_manager::Result<()> {
//!     let key = generate_key_pair(KeyType::EcP384)?;
//!     let now = OffsetDateTime::now_utc();
//!     let root = generate_self_signed_certificate(
//!         "CN=Home Root CA,O=Home",
//!         now,
//!         now + Duration::days(3650),
//!         &key,
//!         None,
//!         true,
//!         None,
//!     )?;
//!
//!     let bundle = IssuedCertificate::new(root.clone(), Some(key), vec![root]);
//!     let mut ca = CertificateAuthority::create(Path::new("/srv/pki/home-ca"), bundle, "secret", "Home CA")?;
//!     ca.unlock("secret")?;
//!
//!     let request = CertificateRequest::new()
//!         .subject("CN=nas.home")
//!         .key_type(KeyType::EcP256);
//!     ca.sign_and_store_certificate_request(
//!         &request,
//!         Some(now),
//!         Some(now + Duration::days(365)),
//!         "bundle secret",
//!     )?;
//!     ca.lock()?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`authority`]: the CA engine (lock state, issuance, revocation, CRLs, exports)
//! - [`manager`]: registry of open CAs with aggregated change events
//! - [`settings`]: persisted per-CA configuration and serial counters
//! - [`storage`]: on-disk layout and atomic file writes
//! - [`certificate_factory`] / [`certificate_request`] / [`key_pair_factory`]: X.509 building
//! - [`certificate_codec`], [`pkcs7_codec`], [`pkcs8_codec`], [`pkcs12_codec`], [`crl`]: codecs
//! - [`events`]: change notifications
//! - [`configs`]: console application configuration
//!
//! # Security Considerations
//!
//! The keystore passphrase is never stored. While a CA is unlocked its private key is kept
//! as zeroizing DER inside a `secrecy::Secret`; `lock()` drops it.

pub mod authority;
pub mod certificate_codec;
pub mod certificate_factory;
pub mod certificate_request;
pub mod configs;
pub mod crl;
pub mod encoding;
pub mod error;
pub mod events;
pub mod key_pair_factory;
pub mod key_store;
pub mod manager;
pub mod pkcs12_codec;
pub mod pkcs7_codec;
pub mod pkcs8_codec;
pub mod properties;
pub mod settings;
pub mod signature_algorithm;
pub mod storage;
pub mod template;

pub use authority::CertificateAuthority;
pub use error::{CaError, Result};
pub use manager::CertificateAuthorityManager;
