//! Property bags describing the artifacts of a CA without loading them.
//!
//! Each bag is written next to its artifact as a flat TOML table and carries
//! the entry id the owning CA resolves it by. Listings sort by subject, then
//! by start date, with missing values first.

use std::cmp::Ordering;

use num_bigint::BigUint;
use openssl::x509::{X509Ref, X509ReqRef};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::certificate_codec::fingerprint;
use crate::certificate_factory::{certificate_serial, from_asn1_time};
use crate::certificate_request::format_name;
use crate::crl::{RevocationReason, X509Crl};
use crate::error::Result;
use crate::key_pair_factory::KeyType;

/// File stem for a serial: 16 hex digits, zero padded.
pub fn serial_stem(serial: &BigUint) -> String {
    format!("{serial:016x}")
}

/// File name of an issued certificate store.
pub fn generate_filename(serial: &BigUint) -> String {
    format!("{}.p12", serial_stem(serial))
}

fn listing_order<T: Ord>(
    a: (&Option<String>, &Option<OffsetDateTime>, &T),
    b: (&Option<String>, &Option<OffsetDateTime>, &T),
) -> Ordering {
    a.0.cmp(b.0).then(a.1.cmp(b.1)).then(a.2.cmp(b.2))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificateProperties {
    pub id: String,
    pub subject: Option<String>,
    pub issuer: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub not_before: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub not_after: Option<OffsetDateTime>,
    pub key_type: Option<String>,
    pub signature_algorithm: Option<String>,
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub has_private_key: bool,
    /// Pending request this certificate was issued for.
    pub request_id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub revocation_date: Option<OffsetDateTime>,
    pub revocation_reason: Option<RevocationReason>,
}

impl IssuedCertificateProperties {
    pub fn from_certificate(cert: &X509Ref, has_private_key: bool) -> Result<Self> {
        let serial = certificate_serial(cert)?;
        let public_key = cert.public_key()?;
        Ok(Self {
            id: serial_stem(&serial),
            subject: Some(format_name(cert.subject_name())),
            issuer: Some(format_name(cert.issuer_name())),
            not_before: Some(from_asn1_time(cert.not_before())?),
            not_after: Some(from_asn1_time(cert.not_after())?),
            key_type: Some(KeyType::describe(&public_key)),
            signature_algorithm: cert
                .signature_algorithm()
                .object()
                .nid()
                .long_name()
                .ok()
                .map(str::to_string),
            fingerprint: Some(fingerprint(cert)?),
            has_private_key,
            request_id: None,
            revocation_date: None,
            revocation_reason: None,
        })
    }

    /// Serial number encoded in the id.
    pub fn serial(&self) -> Option<BigUint> {
        BigUint::parse_bytes(self.id.as_bytes(), 16)
    }

    pub fn is_revoked(&self) -> bool {
        self.revocation_date.is_some()
    }
}

impl PartialOrd for IssuedCertificateProperties {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IssuedCertificateProperties {
    fn cmp(&self, other: &Self) -> Ordering {
        listing_order(
            (&self.subject, &self.not_before, &self.id),
            (&other.subject, &other.not_before, &other.id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequestProperties {
    pub id: String,
    pub subject: Option<String>,
    pub key_type: Option<String>,
    pub signature_algorithm: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
}

impl CertificateRequestProperties {
    pub fn from_request(id: impl Into<String>, request: &X509ReqRef) -> Result<Self> {
        let subject = format_name(request.subject_name());
        let public_key = request.public_key()?;
        Ok(Self {
            id: id.into(),
            subject: (!subject.is_empty()).then_some(subject),
            key_type: Some(KeyType::describe(&public_key)),
            signature_algorithm: None,
            created: Some(OffsetDateTime::now_utc()),
        })
    }
}

impl PartialOrd for CertificateRequestProperties {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CertificateRequestProperties {
    fn cmp(&self, other: &Self) -> Ordering {
        listing_order(
            (&self.subject, &self.created, &self.id),
            (&other.subject, &other.created, &other.id),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrlProperties {
    pub id: String,
    /// Issuer distinguished name; the "subject" of the listing.
    pub issuer: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub this_update: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_update: Option<OffsetDateTime>,
    #[serde(default)]
    pub revoked_count: usize,
}

impl CrlProperties {
    pub fn from_crl(crl: &X509Crl) -> Result<Self> {
        let number = crl.number()?.unwrap_or_default();
        Ok(Self {
            id: serial_stem(&number),
            issuer: Some(crl.issuer()),
            this_update: Some(crl.this_update()?),
            next_update: crl.next_update()?,
            revoked_count: crl.revoked()?.len(),
        })
    }
}

impl PartialOrd for CrlProperties {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CrlProperties {
    fn cmp(&self, other: &Self) -> Ordering {
        listing_order(
            (&self.issuer, &self.this_update, &self.id),
            (&other.issuer, &other.this_update, &other.id),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issued(id: &str, subject: Option<&str>, not_before: Option<i64>) -> IssuedCertificateProperties {
        IssuedCertificateProperties {
            id: id.to_string(),
            subject: subject.map(str::to_string),
            issuer: None,
            not_before: not_before.map(|t| OffsetDateTime::from_unix_timestamp(t).unwrap()),
            not_after: None,
            key_type: None,
            signature_algorithm: None,
            fingerprint: None,
            has_private_key: false,
            request_id: None,
            revocation_date: None,
            revocation_reason: None,
        }
    }

    #[test]
    fn test_generate_filename() {
        assert_eq!(
            generate_filename(&BigUint::from(0x1000u32)),
            "0000000000001000.p12"
        );
        assert_eq!(
            generate_filename(&BigUint::from(0xdeadbeefu32)),
            "00000000deadbeef.p12"
        );
    }

    #[test]
    fn test_listing_order() {
        let mut list = vec![
            issued("3", Some("CN=b"), Some(10)),
            issued("2", Some("CN=a"), Some(20)),
            issued("1", Some("CN=a"), None),
            issued("4", None, Some(5)),
        ];
        list.sort();
        let ids: Vec<_> = list.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["4", "1", "2", "3"]);
    }

    #[test]
    fn test_properties_toml_round_trip() {
        let mut props = issued("0000000000001000", Some("CN=x"), Some(1_700_000_000));
        props.revocation_reason = Some(RevocationReason::KeyCompromise);
        let text = toml::to_string(&props).unwrap();
        let back: IssuedCertificateProperties = toml::from_str(&text).unwrap();
        assert_eq!(back, props);
        assert_eq!(back.serial(), Some(BigUint::from(0x1000u32)));
    }
}
