//! Secure in-memory container for the unlocked CA key material.
//!
//! The private key is held as zeroizing DER inside a `secrecy::Secret` and
//! only turned back into an openssl key for the duration of one operation.
//! Dropping the store (locking the CA) wipes the key bytes.

use std::fmt;

use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, Secret, Zeroize};

use crate::certificate_factory::IssuedCertificate;
use crate::error::{CaError, Result};

/// A securely stored private key that implements Zeroize
#[derive(Clone)]
struct SecurePrivateKey {
    der_bytes: Vec<u8>,
}

impl Zeroize for SecurePrivateKey {
    fn zeroize(&mut self) {
        self.der_bytes.zeroize();
    }
}

impl fmt::Debug for SecurePrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePrivateKey")
            .field("der_bytes", &"<redacted>")
            .finish()
    }
}

/// Key material of an unlocked CA: private key, certificate and chain.
///
/// Uses the `secrecy` crate so the private key:
/// - never shows up in debug output
/// - is zeroized when the store is dropped
/// - is only reachable through [`CaKeyStore::private_key`]
pub struct CaKeyStore {
    private_key: Secret<SecurePrivateKey>,
    certificate: X509,
    chain: Vec<X509>,
}

impl CaKeyStore {
    /// Takes the key material out of an opened keystore. Fails when the
    /// bundle carries no private key.
    pub fn new(issued: IssuedCertificate) -> Result<Self> {
        let IssuedCertificate {
            certificate,
            private_key,
            chain,
        } = issued;
        let key = private_key.ok_or_else(|| CaError::io("keystore holds no private key"))?;
        let der_bytes = key.private_key_to_der()?;
        let chain = if chain.is_empty() {
            vec![certificate.clone()]
        } else {
            chain
        };
        Ok(Self {
            private_key: Secret::new(SecurePrivateKey { der_bytes }),
            certificate,
            chain,
        })
    }

    /// Reconstructs the private key; the caller owns the copy.
    pub fn private_key(&self) -> Result<PKey<Private>> {
        let der_bytes = &self.private_key.expose_secret().der_bytes;
        Ok(PKey::private_key_from_der(der_bytes)?)
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    /// Chain up to the root, CA certificate first.
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// The CA as an issuer for the certificate factory.
    pub fn to_issued(&self) -> Result<IssuedCertificate> {
        Ok(IssuedCertificate::new(
            self.certificate.clone(),
            Some(self.private_key()?),
            self.chain.clone(),
        ))
    }
}

impl fmt::Debug for CaKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeyStore")
            .field("private_key", &"<securely stored>")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_factory::generate_self_signed_certificate;
    use crate::key_pair_factory::{generate_key_pair, KeyType};
    use crate::pkcs8_codec::private_keys_equal;
    use time::{Duration, OffsetDateTime};

    fn issued() -> IssuedCertificate {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let now = OffsetDateTime::now_utc();
        let cert = generate_self_signed_certificate(
            "CN=Store Test CA",
            now,
            now + Duration::days(1),
            &key,
            None,
            true,
            None,
        )
        .unwrap();
        IssuedCertificate::new(cert, Some(key), Vec::new())
    }

    #[test]
    fn test_debug_no_leak() {
        let store = CaKeyStore::new(issued()).unwrap();
        let debug_str = format!("{:?}", store);
        assert!(!debug_str.contains("der_bytes"));
        assert!(debug_str.contains("securely stored"));
    }

    #[test]
    fn test_key_survives_the_store() {
        let issued = issued();
        let original = issued.private_key.clone().unwrap();
        let store = CaKeyStore::new(issued).unwrap();
        assert!(private_keys_equal(&original, &store.private_key().unwrap()).unwrap());
        assert_eq!(store.chain().len(), 1);
        assert!(store.to_issued().unwrap().private_key.is_some());
    }

    #[test]
    fn test_bundle_without_key_is_rejected() {
        let mut issued = issued();
        issued.private_key = None;
        assert!(CaKeyStore::new(issued).unwrap_err().is_io_failure());
    }
}
