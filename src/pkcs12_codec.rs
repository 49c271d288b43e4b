//! PKCS#12 key stores: certificate, private key and chain in one
//! passphrase-protected bundle.

use std::fmt;
use std::str::FromStr;

use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::stack::Stack;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::certificate_factory::IssuedCertificate;
use crate::encoding::is_pem;
use crate::error::{CaError, Result};
use crate::pkcs7_codec::order_chain;

/// Bag encryption of an exported PKCS#12 store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Pkcs12Cipher {
    None,
    /// PBE-SHA1-3DES, readable by legacy tools.
    Des3,
    Aes128Cbc,
    Aes192Cbc,
    #[default]
    Aes256Cbc,
}

impl Pkcs12Cipher {
    pub const ALL: [Pkcs12Cipher; 5] = [
        Self::None,
        Self::Des3,
        Self::Aes128Cbc,
        Self::Aes192Cbc,
        Self::Aes256Cbc,
    ];

    fn nid(&self) -> Nid {
        match self {
            // -1 tells PKCS12_create to leave the bags unencrypted
            Self::None => Nid::from_raw(-1),
            Self::Des3 => Nid::PBE_WITHSHA1AND3_KEY_TRIPLEDES_CBC,
            Self::Aes128Cbc => Nid::AES_128_CBC,
            Self::Aes192Cbc => Nid::AES_192_CBC,
            Self::Aes256Cbc => Nid::AES_256_CBC,
        }
    }
}

impl fmt::Display for Pkcs12Cipher {
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

impl FromStr for Pkcs12Cipher {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| CaError::invalid(format!("unknown cipher '{s}'")))
    }
}

/// Builds a DER PKCS#12 store holding the certificate, its private key (if
/// any) and the rest of the chain.
pub fn encode_pkcs12(
    issued: &IssuedCertificate,
    alias: Option<&str>,
    cipher: Pkcs12Cipher,
    passphrase: &str,
) -> Result<Vec<u8>> {
    let mut builder = Pkcs12::builder();
    if let Some(alias) = alias {
        builder.name(alias);
    }
    if let Some(key) = issued.private_key.as_ref() {
        builder.pkey(key);
    }
    builder.cert(&issued.certificate);

    let leaf = issued.certificate.to_der()?;
    let mut ca = Stack::new()?;
    for cert in &issued.chain {
        if cert.to_der()? != leaf {
            ca.push(cert.clone())?;
        }
    }
    if !ca.is_empty() {
        builder.ca(ca);
    }
    builder.key_algorithm(cipher.nid());
    builder.cert_algorithm(cipher.nid());

    let store = builder.build2(passphrase)?;
    debug!(cipher = %cipher, alias, "encoded PKCS#12 store");
    Ok(store.to_der()?)
}

/// Opens a DER PKCS#12 store.
///
/// PEM input or any other structure (a PKCS#7 bundle, say) is an I/O
/// failure; a store that parses but does not open with `passphrase` is
/// [`CaError::InvalidPassword`].
pub fn decode_pkcs12(data: &[u8], passphrase: &str) -> Result<IssuedCertificate> {
    if data.is_empty() {
        return Err(CaError::io("empty PKCS#12 input"));
    }
    if is_pem(data) {
        return Err(CaError::io("PKCS#12 stores are binary, got PEM input"));
    }
    let store =
        Pkcs12::from_der(data).map_err(|e| CaError::io(format!("not a PKCS#12 store: {e}")))?;
    let parsed = store.parse2(passphrase).map_err(|_| CaError::InvalidPassword)?;

    let mut certs: Vec<X509> = parsed.cert.into_iter().collect();
    if let Some(ca) = parsed.ca {
        certs.extend(ca);
    }
    // Without a matching key openssl files the leaf under the CA bags
    let chain = order_chain(certs);
    let certificate = chain
        .first()
        .cloned()
        .ok_or_else(|| CaError::io("PKCS#12 store holds no certificate"))?;
    Ok(IssuedCertificate::new(certificate, parsed.pkey, chain))
}
