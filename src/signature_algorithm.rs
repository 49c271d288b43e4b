//! Signature algorithms the CA can sign certificates and CRLs with.

use std::fmt;
use std::str::FromStr;

use der::asn1::{AnyRef, ObjectIdentifier};
use der::Any;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKeyRef};
use serde::{Deserialize, Serialize};
use pkcs8::spki::AlgorithmIdentifierOwned;

use crate::error::{CaError, Result};
use crate::key_pair_factory::KeyFamily;

const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const SHA384_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const SHA512_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");
const DSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.3.2");
const ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const ECDSA_WITH_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.4");
const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const ED448: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.113");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    #[serde(rename = "SHA256withRSA")]
    Sha256WithRsa,
    #[serde(rename = "SHA384withRSA")]
    Sha384WithRsa,
    #[serde(rename = "SHA512withRSA")]
    Sha512WithRsa,
    #[serde(rename = "SHA256withDSA")]
    Sha256WithDsa,
    #[serde(rename = "SHA256withECDSA")]
    Sha256WithEcdsa,
    #[serde(rename = "SHA384withECDSA")]
    Sha384WithEcdsa,
    #[serde(rename = "SHA512withECDSA")]
    Sha512WithEcdsa,
    #[serde(rename = "Ed25519")]
    Ed25519,
    #[serde(rename = "Ed448")]
    Ed448,
}

impl SignatureAlgorithm {
    pub const ALL: [SignatureAlgorithm; 9] = [
        Self::Sha256WithRsa,
        Self::Sha384WithRsa,
        Self::Sha512WithRsa,
        Self::Sha256WithDsa,
        Self::Sha256WithEcdsa,
        Self::Sha384WithEcdsa,
        Self::Sha512WithEcdsa,
        Self::Ed25519,
        Self::Ed448,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256WithRsa => "SHA256withRSA",
            Self::Sha384WithRsa => "SHA384withRSA",
            Self::Sha512WithRsa => "SHA512withRSA",
            Self::Sha256WithDsa => "SHA256withDSA",
            Self::Sha256WithEcdsa => "SHA256withECDSA",
            Self::Sha384WithEcdsa => "SHA384withECDSA",
            Self::Sha512WithEcdsa => "SHA512withECDSA",
            Self::Ed25519 => "Ed25519",
            Self::Ed448 => "Ed448",
        }
    }

    pub fn family(&self) -> KeyFamily {
        match self {
            Self::Sha256WithRsa | Self::Sha384WithRsa | Self::Sha512WithRsa => KeyFamily::Rsa,
            Self::Sha256WithDsa => KeyFamily::Dsa,
            Self::Sha256WithEcdsa | Self::Sha384WithEcdsa | Self::Sha512WithEcdsa => {
                KeyFamily::Ec
            }
            Self::Ed25519 | Self::Ed448 => KeyFamily::EdDsa,
        }
    }

    /// Digest handed to openssl. EdDSA signs without a separate digest.
    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha256WithRsa | Self::Sha256WithDsa | Self::Sha256WithEcdsa => {
                MessageDigest::sha256()
            }
            Self::Sha384WithRsa | Self::Sha384WithEcdsa => MessageDigest::sha384(),
            Self::Sha512WithRsa | Self::Sha512WithEcdsa => MessageDigest::sha512(),
            Self::Ed25519 | Self::Ed448 => MessageDigest::null(),
        }
    }

    pub fn uses_digest(&self) -> bool {
        self.family() != KeyFamily::EdDsa
    }

    /// AlgorithmIdentifier placed in CRLs signed with this algorithm.
    pub fn algorithm_identifier(&self) -> AlgorithmIdentifierOwned {
        let (oid, null_params) = match self {
            Self::Sha256WithRsa => (SHA256_WITH_RSA, true),
            Self::Sha384WithRsa => (SHA384_WITH_RSA, true),
            Self::Sha512WithRsa => (SHA512_WITH_RSA, true),
            Self::Sha256WithDsa => (DSA_WITH_SHA256, false),
            Self::Sha256WithEcdsa => (ECDSA_WITH_SHA256, false),
            Self::Sha384WithEcdsa => (ECDSA_WITH_SHA384, false),
            Self::Sha512WithEcdsa => (ECDSA_WITH_SHA512, false),
            Self::Ed25519 => (ED25519, false),
            Self::Ed448 => (ED448, false),
        };
        AlgorithmIdentifierOwned {
            oid,
            parameters: null_params.then(|| Any::from(AnyRef::NULL)),
        }
    }

    /// Default algorithm for a signing key: SHA-256 for RSA and DSA, a digest
    /// sized to the curve for EC, the matching EdDSA variant otherwise.
    pub fn default_for<T: HasPublic>(key: &PKeyRef<T>) -> Result<Self> {
        match KeyFamily::of(key)? {
            KeyFamily::Rsa => Ok(Self::Sha256WithRsa),
            KeyFamily::Dsa => Ok(Self::Sha256WithDsa),
            KeyFamily::Ec => {
                let curve = key.ec_key()?.group().curve_name();
                if curve == Some(Nid::SECP521R1) {
                    Ok(Self::Sha512WithEcdsa)
                } else if curve == Some(Nid::SECP384R1) {
                    Ok(Self::Sha384WithEcdsa)
                } else {
                    Ok(Self::Sha256WithEcdsa)
                }
            }
            KeyFamily::EdDsa => Ok(if key.id() == openssl::pkey::Id::ED448 {
                Self::Ed448
            } else {
                Self::Ed25519
            }),
        }
    }

    /// Fails unless the algorithm can be used with `key`.
    pub fn check_compatible<T: HasPublic>(&self, key: &PKeyRef<T>) -> Result<()> {
        let family = KeyFamily::of(key)?;
        if family != self.family() {
            return Err(CaError::invalid(format!(
                "signature algorithm {} cannot be used with a {:?} key",
                self, family
            )));
        }
        if family == KeyFamily::EdDsa && Self::default_for(key)? != *self {
            return Err(CaError::invalid(format!(
                "signature algorithm {self} does not match the EdDSA curve"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CaError::invalid(format!("unknown signature algorithm '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair_factory::{generate_key_pair, KeyType};

    #[test]
    fn test_default_follows_curve_size() {
        let p256 = generate_key_pair(KeyType::EcP256).unwrap();
        let p521 = generate_key_pair(KeyType::EcP521).unwrap();
        assert_eq!(
            SignatureAlgorithm::default_for(&p256).unwrap(),
            SignatureAlgorithm::Sha256WithEcdsa
        );
        assert_eq!(
            SignatureAlgorithm::default_for(&p521).unwrap(),
            SignatureAlgorithm::Sha512WithEcdsa
        );
    }

    #[test]
    fn test_rejects_family_mismatch() {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let err = SignatureAlgorithm::Sha256WithRsa
            .check_compatible(&key)
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidArgument(_)));
        assert!(SignatureAlgorithm::Sha384WithEcdsa.check_compatible(&key).is_ok());
    }

    #[test]
    fn test_rsa_identifier_has_null_parameters() {
        let id = SignatureAlgorithm::Sha256WithRsa.algorithm_identifier();
        assert!(id.parameters.is_some());
        assert!(SignatureAlgorithm::Ed25519
            .algorithm_identifier()
            .parameters
            .is_none());
    }
}
