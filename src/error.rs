//! Error type shared by every part of the CA engine.
//!
//! The variants are deliberately few so that callers can branch on the
//! failure class without matching on message text:
//!
//! ```text
//! CaError
//! ├── LockedDatastore  - key material requested while the CA is locked
//! ├── NotFound         - unknown request / certificate / template / CRL
//! ├── InvalidArgument  - bad request fields, double revoke, expiry <= 0
//! ├── IoFailure        - bad path, malformed file, format mismatch
//! ├── InvalidPassword  - passphrase did not decrypt PKCS#8 / PKCS#12 data
//! ├── Crypto           - openssl failed while building or signing
//! └── Listener         - a change listener returned an error
//! ```

use std::io;

use thiserror::Error;

/// Error returned by a change listener.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum CaError {
    /// The operation needs the CA private key but the CA is locked.
    #[error("certificate authority is locked")]
    LockedDatastore,

    /// The referenced entry is not known to this CA.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Path, storage or format problem.
    #[error("I/O failure: {message}")]
    IoFailure {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The passphrase did not decrypt the protected content.
    #[error("invalid password")]
    InvalidPassword,

    /// openssl reported an error while generating or signing.
    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// A change listener failed after the mutation was committed.
    #[error("change listener failed: {0}")]
    Listener(ListenerError),
}

impl CaError {
    pub fn io(message: impl Into<String>) -> Self {
        Self::IoFailure {
            message: message.into(),
            source: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Returns `true` for the I/O-classified failures.
    pub fn is_io_failure(&self) -> bool {
        matches!(self, Self::IoFailure { .. })
    }
}

impl From<io::Error> for CaError {
    fn from(e: io::Error) -> Self {
        Self::IoFailure {
            message: e.to_string(),
            source: Some(e),
        }
    }
}

impl From<der::Error> for CaError {
    fn from(e: der::Error) -> Self {
        Self::io(format!("malformed ASN.1 content: {e}"))
    }
}

impl From<toml::de::Error> for CaError {
    fn from(e: toml::de::Error) -> Self {
        Self::io(format!("malformed document: {e}"))
    }
}

impl From<toml::ser::Error> for CaError {
    fn from(e: toml::ser::Error) -> Self {
        Self::io(format!("failed to serialize document: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CaError>;
