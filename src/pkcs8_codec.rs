//! PKCS#8 private keys, plain or passphrase-encrypted (PBES2).

use std::fmt;
use std::str::FromStr;

use der::asn1::AnyRef;
use der::{Decode, Reader, SliceReader, Tag, Tagged};
use openssl::pkey::{Id, PKey, PKeyRef, Private};
use openssl::symm::Cipher;
use serde::{Deserialize, Serialize};

use crate::encoding::{from_der, to_der, Encoding};
use crate::error::{CaError, Result};

const PRIVATE_KEY_LABELS: &[&str] = &["PRIVATE KEY", "ENCRYPTED PRIVATE KEY"];

/// Cipher used to wrap an exported private key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Pkcs8Cipher {
    #[default]
    None,
    Des3,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
}

impl Pkcs8Cipher {
    pub const ALL: [Pkcs8Cipher; 5] = [
        Self::None,
        Self::Des3,
        Self::Aes128Cbc,
        Self::Aes192Cbc,
        Self::Aes256Cbc,
    ];

    fn cipher(&self) -> Option<Cipher> {
        match self {
            Self::None => None,
            Self::Des3 => Some(Cipher::des_ede3_cbc()),
            Self::Aes128Cbc => Some(Cipher::aes_128_cbc()),
            Self::Aes192Cbc => Some(Cipher::aes_192_cbc()),
            Self::Aes256Cbc => Some(Cipher::aes_256_cbc()),
        }
    }
}

impl fmt::Display for Pkcs8Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Des3 => "des3",
            Self::Aes128Cbc => "aes128",
            Self::Aes192Cbc => "aes192",
            Self::Aes256Cbc => "aes256",
        };
        f.write_str(name)
    }
}

impl FromStr for Pkcs8Cipher {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| CaError::invalid(format!("unknown cipher '{s}'")))
    }
}

/// Encodes `key` as PKCS#8. Any cipher other than [`Pkcs8Cipher::None`]
/// needs a non-empty passphrase.
pub fn encode_private_key(
    key: &PKeyRef<Private>,
    encoding: Encoding,
    cipher: Pkcs8Cipher,
    passphrase: Option<&str>,
) -> Result<Vec<u8>> {
    match cipher.cipher() {
        None => Ok(from_der(key.private_key_to_pkcs8()?, "PRIVATE KEY", encoding)),
        Some(symm) => {
            let passphrase = passphrase
                .filter(|p| !p.is_empty())
                .ok_or_else(|| CaError::invalid(format!("cipher {cipher} needs a passphrase")))?;
            let der = key.private_key_to_pkcs8_passphrase(symm, passphrase.as_bytes())?;
            Ok(from_der(der, "ENCRYPTED PRIVATE KEY", encoding))
        }
    }
}

/// Decodes a PKCS#8 key in PEM or DER.
///
/// Encrypted input with a missing or wrong passphrase fails with
/// [`CaError::InvalidPassword`]; anything unparsable is an I/O failure.
pub fn decode_private_key(data: &[u8], passphrase: Option<&str>) -> Result<PKey<Private>> {
    let (der, label) = to_der(data, PRIVATE_KEY_LABELS)?;
    if label.as_deref() == Some("ENCRYPTED PRIVATE KEY") || is_encrypted_info(&der) {
        let passphrase = passphrase.ok_or(CaError::InvalidPassword)?;
        return PKey::private_key_from_pkcs8_passphrase(&der, passphrase.as_bytes())
            .map_err(|_| CaError::InvalidPassword);
    }
    PKey::private_key_from_der(&der).map_err(|e| CaError::io(format!("malformed private key: {e}")))
}

/// EncryptedPrivateKeyInfo opens with an AlgorithmIdentifier, a plain
/// PrivateKeyInfo with its version INTEGER.
fn is_encrypted_info(der: &[u8]) -> bool {
    let Ok(outer) = AnyRef::from_der(der) else {
        return false;
    };
    if outer.tag() != Tag::Sequence {
        return false;
    }
    SliceReader::new(outer.value())
        .and_then(|reader| reader.peek_tag())
        .map_or(false, |tag| tag == Tag::Sequence)
}

/// Compares two private keys. EC keys are compared on the private scalar
/// only, other keys on their full DER encoding.
pub fn private_keys_equal(a: &PKeyRef<Private>, b: &PKeyRef<Private>) -> Result<bool> {
    if a.id() != b.id() {
        return Ok(false);
    }
    if a.id() == Id::EC {
        let left = a.ec_key()?.private_key().to_vec();
        let right = b.ec_key()?.private_key().to_vec();
        return Ok(left == right);
    }
    Ok(a.private_key_to_der()? == b.private_key_to_der()?)
}
