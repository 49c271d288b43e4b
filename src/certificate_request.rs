//! Certificate requests: what a caller asks the CA to sign.
//!
//! A [`CertificateRequest`] either describes a key pair the CA should
//! generate (subject, key type and extensions) or wraps a foreign PKCS#10
//! request whose key never leaves its owner.

use std::collections::BTreeSet;
use std::fmt;

use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509NameRef, X509Req};
use serde::{Deserialize, Serialize};

use crate::error::{CaError, Result};
use crate::key_pair_factory::KeyType;
use crate::signature_algorithm::SignatureAlgorithm;

/// Bits of the X.509 key usage extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsageFlag {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

/// Extended key usage purposes, each mapped to its PKIX OID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedKeyUsagePurpose {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

impl ExtendedKeyUsagePurpose {
    pub fn oid(&self) -> &'static str {
        match self {
            Self::ServerAuth => "1.3.6.1.5.5.7.3.1",
            Self::ClientAuth => "1.3.6.1.5.5.7.3.2",
            Self::CodeSigning => "1.3.6.1.5.5.7.3.3",
            Self::EmailProtection => "1.3.6.1.5.5.7.3.4",
            Self::TimeStamping => "1.3.6.1.5.5.7.3.8",
            Self::OcspSigning => "1.3.6.1.5.5.7.3.9",
        }
    }
}

/// Subject alternative name entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GeneralNameEntry {
    Dns(String),
    Ip(String),
    Email(String),
    Uri(String),
}

impl fmt::Display for GeneralNameEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dns(v) => write!(f, "DNS:{v}"),
            Self::Ip(v) => write!(f, "IP:{v}"),
            Self::Email(v) => write!(f, "email:{v}"),
            Self::Uri(v) => write!(f, "URI:{v}"),
        }
    }
}

/// Parameters for a certificate the CA is asked to issue.
///
/// Built with the chained setters, mirroring the certificate builders:
///
/// ```rust,no_run
/// use ca_manager::certificate_request::{CertificateRequest, KeyUsageFlag};
/// use ca_manager::key_pair_factory::KeyType;
///
/// let request = CertificateRequest::new()
///     .subject("CN=alice,O=Example")
///     .key_type(KeyType::EcP256)
///     .key_usage(KeyUsageFlag::DigitalSignature);
/// ```
#[derive(Default)]
pub struct CertificateRequest {
    pub subject: Option<String>,
    pub key_type: Option<KeyType>,
    pub key_usage: BTreeSet<KeyUsageFlag>,
    pub extended_key_usage: BTreeSet<ExtendedKeyUsagePurpose>,
    pub subject_alternative_names: Vec<GeneralNameEntry>,
    pub is_ca: bool,
    pub crl_issuer: Option<String>,
    pub crl_location: Option<String>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
    /// Key to certify instead of generating one.
    pub key_pair: Option<PKey<Private>>,
    /// Foreign PKCS#10 request; its public key is certified and no private
    /// key is available to the CA.
    pub pkcs10: Option<X509Req>,
}

impl CertificateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a parsed PKCS#10 request. The subject is taken from the request.
    pub fn from_pkcs10(request: X509Req) -> Result<Self> {
        let subject = format_name(request.subject_name());
        Ok(Self {
            subject: (!subject.is_empty()).then_some(subject),
            pkcs10: Some(request),
            ..Self::default()
        })
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    pub fn key_usage(mut self, flag: KeyUsageFlag) -> Self {
        self.key_usage.insert(flag);
        self
    }

    pub fn extended_key_usage(mut self, purpose: ExtendedKeyUsagePurpose) -> Self {
        self.extended_key_usage.insert(purpose);
        self
    }

    pub fn subject_alternative_name(mut self, name: GeneralNameEntry) -> Self {
        self.subject_alternative_names.push(name);
        self
    }

    pub fn ca(mut self, is_ca: bool) -> Self {
        self.is_ca = is_ca;
        self
    }

    pub fn crl_distribution_point(
        mut self,
        location: impl Into<String>,
        issuer: Option<String>,
    ) -> Self {
        self.crl_location = Some(location.into());
        self.crl_issuer = issuer;
        self
    }

    pub fn signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signature_algorithm = Some(algorithm);
        self
    }

    pub fn with_key_pair(mut self, key: PKey<Private>) -> Self {
        self.key_pair = Some(key);
        self
    }

    pub fn is_foreign(&self) -> bool {
        self.pkcs10.is_some()
    }
}

impl fmt::Debug for CertificateRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRequest")
            .field("subject", &self.subject)
            .field("key_type", &self.key_type)
            .field("key_usage", &self.key_usage)
            .field("extended_key_usage", &self.extended_key_usage)
            .field("subject_alternative_names", &self.subject_alternative_names)
            .field("is_ca", &self.is_ca)
            .field("crl_location", &self.crl_location)
            .field("signature_algorithm", &self.signature_algorithm)
            .field("key_pair", &self.key_pair.as_ref().map(|_| "<redacted>"))
            .field("pkcs10", &self.pkcs10.is_some())
            .finish()
    }
}

/// Splits `CN=a,O=b\,c` into attribute/value pairs, honouring `\` escapes.
fn split_attributes(dn: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in dn.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' => escaped = true,
            ',' | ';' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Parses a distinguished name such as `CN=server,O=Example,C=DE`.
pub fn parse_name(dn: &str) -> Result<X509Name> {
    let mut builder = X509Name::builder()?;
    let mut entries = 0;
    for part in split_attributes(dn) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (field, value) = part
            .split_once('=')
            .ok_or_else(|| CaError::invalid(format!("malformed name component '{part}'")))?;
        builder
            .append_entry_by_text(field.trim(), value.trim())
            .map_err(|_| CaError::invalid(format!("unknown name attribute '{}'", field.trim())))?;
        entries += 1;
    }
    if entries == 0 {
        return Err(CaError::invalid("distinguished name is empty"));
    }
    Ok(builder.build())
}

/// Formats a name as `CN=..,O=..` in encoding order.
pub fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let field = entry.object().nid().short_name().unwrap_or("UNKNOWN");
            let value = entry.data().to_string().unwrap_or_default();
            format!("{}={}", field, escape_value(&value))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// First common name of `name`, if any.
pub fn common_name(name: &X509NameRef) -> Option<String> {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

/// Escapes the characters [`split_attributes`] treats specially.
fn escape_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ',' | ';') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
