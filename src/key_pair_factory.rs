//! Key pair generation for the fixed catalogue of supported algorithms.
//!
//! # Catalogue
//! - **RSA**: 1024, 2048, 3072, 4096 and 8192 bit moduli
//! - **DSA**: 1024 and 2048 bit parameters
//! - **EC**: NIST P-256, P-384, P-521 and secp256k1
//! - **EdDSA**: Ed25519 and Ed448
//!
//! # Example
//! ```rust,no_run
//! use ca_manager::key_pair_factory::{generate_key_pair, KeyType};
//! # fn example() -> ca_manager::Result<()> {
//! let key = generate_key_pair(KeyType::EcP384)?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::str::FromStr;

use openssl::dsa::Dsa;
use openssl::ec::{EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, Id, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CaError, Result};

/// Algorithm family of a key, used to pick signature defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyFamily {
    Rsa,
    Dsa,
    Ec,
    EdDsa,
}

impl KeyFamily {
    /// Family of an existing openssl key.
    pub fn of<T>(key: &PKeyRef<T>) -> Result<Self> {
        let id = key.id();
        if id == Id::RSA {
            Ok(Self::Rsa)
        } else if id == Id::DSA {
            Ok(Self::Dsa)
        } else if id == Id::EC {
            Ok(Self::Ec)
        } else if id == Id::ED25519 || id == Id::ED448 {
            Ok(Self::EdDsa)
        } else {
            Err(CaError::invalid(format!(
                "unsupported key algorithm (id {})",
                id.as_raw()
            )))
        }
    }
}

/// Key types a request may ask the CA to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "RSA-1024")]
    Rsa1024,
    #[serde(rename = "RSA-2048")]
    Rsa2048,
    #[serde(rename = "RSA-3072")]
    Rsa3072,
    #[serde(rename = "RSA-4096")]
    Rsa4096,
    #[serde(rename = "RSA-8192")]
    Rsa8192,
    #[serde(rename = "DSA-1024")]
    Dsa1024,
    #[serde(rename = "DSA-2048")]
    Dsa2048,
    #[serde(rename = "EC-P256")]
    EcP256,
    #[serde(rename = "EC-P384")]
    EcP384,
    #[serde(rename = "EC-P521")]
    EcP521,
    #[serde(rename = "EC-secp256k1")]
    EcSecp256k1,
    #[serde(rename = "Ed25519")]
    Ed25519,
    #[serde(rename = "Ed448")]
    Ed448,
}

impl KeyType {
    pub const ALL: [KeyType; 13] = [
        Self::Rsa1024,
        Self::Rsa2048,
        Self::Rsa3072,
        Self::Rsa4096,
        Self::Rsa8192,
        Self::Dsa1024,
        Self::Dsa2048,
        Self::EcP256,
        Self::EcP384,
        Self::EcP521,
        Self::EcSecp256k1,
        Self::Ed25519,
        Self::Ed448,
    ];

    pub fn family(&self) -> KeyFamily {
        match self {
            Self::Rsa1024 | Self::Rsa2048 | Self::Rsa3072 | Self::Rsa4096 | Self::Rsa8192 => {
                KeyFamily::Rsa
            }
            Self::Dsa1024 | Self::Dsa2048 => KeyFamily::Dsa,
            Self::EcP256 | Self::EcP384 | Self::EcP521 | Self::EcSecp256k1 => KeyFamily::Ec,
            Self::Ed25519 | Self::Ed448 => KeyFamily::EdDsa,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Rsa1024 => "RSA-1024",
            Self::Rsa2048 => "RSA-2048",
            Self::Rsa3072 => "RSA-3072",
            Self::Rsa4096 => "RSA-4096",
            Self::Rsa8192 => "RSA-8192",
            Self::Dsa1024 => "DSA-1024",
            Self::Dsa2048 => "DSA-2048",
            Self::EcP256 => "EC-P256",
            Self::EcP384 => "EC-P384",
            Self::EcP521 => "EC-P521",
            Self::EcSecp256k1 => "EC-secp256k1",
            Self::Ed25519 => "Ed25519",
            Self::Ed448 => "Ed448",
        }
    }

    fn curve(&self) -> Option<Nid> {
        match self {
            Self::EcP256 => Some(Nid::X9_62_PRIME256V1),
            Self::EcP384 => Some(Nid::SECP384R1),
            Self::EcP521 => Some(Nid::SECP521R1),
            Self::EcSecp256k1 => Some(Nid::SECP256K1),
            _ => None,
        }
    }

    fn bits(&self) -> u32 {
        match self {
            Self::Rsa1024 | Self::Dsa1024 => 1024,
            Self::Rsa2048 | Self::Dsa2048 => 2048,
            Self::Rsa3072 => 3072,
            Self::Rsa4096 => 4096,
            Self::Rsa8192 => 8192,
            Self::EcP256 | Self::EcSecp256k1 | Self::Ed25519 => 256,
            Self::EcP384 => 384,
            Self::EcP521 => 521,
            Self::Ed448 => 448,
        }
    }

    /// Describes an existing key, e.g. for a foreign PKCS#10 public key.
    pub fn describe<T: HasPublic>(key: &PKeyRef<T>) -> String {
        match KeyFamily::of(key) {
            Ok(KeyFamily::Rsa) => format!("RSA-{}", key.bits()),
            Ok(KeyFamily::Dsa) => format!("DSA-{}", key.bits()),
            Ok(KeyFamily::Ec) => key
                .ec_key()
                .ok()
                .and_then(|ec| ec.group().curve_name())
                .and_then(|nid| nid.short_name().ok())
                .map(|name| format!("EC-{name}"))
                .unwrap_or_else(|| "EC".to_string()),
            Ok(KeyFamily::EdDsa) if key.id() == Id::ED448 => "Ed448".to_string(),
            Ok(KeyFamily::EdDsa) => "Ed25519".to_string(),
            Err(_) => format!("unknown ({})", key.id().as_raw()),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyType {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CaError::invalid(format!("unknown key type '{s}'")))
    }
}

/// Generates a new private key of the requested type.
pub fn generate_key_pair(key_type: KeyType) -> Result<PKey<Private>> {
    debug!(key_type = %key_type, "generating key pair");
    let key = match key_type.family() {
        KeyFamily::Rsa => PKey::from_rsa(Rsa::generate(key_type.bits())?)?,
        KeyFamily::Dsa => PKey::from_dsa(Dsa::generate(key_type.bits())?)?,
        KeyFamily::Ec => {
            let nid = key_type
                .curve()
                .ok_or_else(|| CaError::invalid(format!("no curve for {key_type}")))?;
            let group = EcGroup::from_curve_name(nid)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
        KeyFamily::EdDsa => match key_type {
            KeyType::Ed448 => PKey::generate_ed448()?,
            _ => PKey::generate_ed25519()?,
        },
    };
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ec_keys() {
        for key_type in [KeyType::EcP256, KeyType::EcP384, KeyType::EcP521] {
            let key = generate_key_pair(key_type).unwrap();
            assert_eq!(KeyFamily::of(&key).unwrap(), KeyFamily::Ec);
            assert_eq!(key.bits(), key_type.bits());
        }
    }

    #[test]
    fn test_generate_ed25519() {
        let key = generate_key_pair(KeyType::Ed25519).unwrap();
        assert_eq!(KeyFamily::of(&key).unwrap(), KeyFamily::EdDsa);
        assert_eq!(KeyType::describe(&key), "Ed25519");
    }

    #[test]
    fn test_key_type_names_round_trip() {
        for key_type in KeyType::ALL {
            assert_eq!(key_type.name().parse::<KeyType>().unwrap(), key_type);
        }
        assert!("RSA-512".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_describe_curve() {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        assert_eq!(KeyType::describe(&key), "EC-prime256v1");
    }
}
