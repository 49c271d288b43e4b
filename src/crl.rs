//! Certificate revocation lists.
//!
//! openssl can verify CRLs but exposes no safe builder for them, so the
//! `TBSCertList` is assembled with `x509-cert` and only the signature is
//! produced by openssl.
//!
//! # Structure written
//! ```text
//! CertificateList (v2)
//! ├── issuer          - subject of the CA certificate
//! ├── thisUpdate      - creation time
//! ├── nextUpdate      - caller supplied
//! ├── revoked[]       - serial, revocation date, reasonCode entry extension
//! └── cRLNumber       - CRL serial of the CA
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use der::asn1::{BitString, GeneralizedTime, OctetString, Uint, UtcTime};
use der::{Decode, Encode};
use num_bigint::BigUint;
use openssl::pkey::{HasPublic, PKeyRef, Private};
use openssl::sign::Signer;
use openssl::x509::X509Ref;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::ext::Extension;
use x509_cert::serial_number::SerialNumber;
use x509_cert::time::Time;
use x509_cert::Version;

use crate::encoding::{from_der, to_der, Encoding};
use crate::error::{CaError, Result};
use crate::signature_algorithm::SignatureAlgorithm;

const CRL_LABELS: &[&str] = &["X509 CRL"];
const OID_CRL_NUMBER: der::oid::ObjectIdentifier =
    der::oid::ObjectIdentifier::new_unwrap("2.5.29.20");
const OID_CRL_REASON: der::oid::ObjectIdentifier =
    der::oid::ObjectIdentifier::new_unwrap("2.5.29.21");
const ASN1_ENUMERATED: u8 = 0x0a;
/// UTCTime covers 1950..2049, later dates are GeneralizedTime.
const UTC_TIME_LIMIT: i64 = 2_524_608_000;

/// CRL reason codes (RFC 5280 section 5.3.1). Code 7 is unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RevocationReason {
    #[default]
    Unspecified,
    KeyCompromise,
    CaCompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCrl,
    PrivilegeWithdrawn,
    AaCompromise,
}

impl RevocationReason {
    pub const ALL: [RevocationReason; 10] = [
        Self::Unspecified,
        Self::KeyCompromise,
        Self::CaCompromise,
        Self::AffiliationChanged,
        Self::Superseded,
        Self::CessationOfOperation,
        Self::CertificateHold,
        Self::RemoveFromCrl,
        Self::PrivilegeWithdrawn,
        Self::AaCompromise,
    ];

    pub fn code(&self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::KeyCompromise => 1,
            Self::CaCompromise => 2,
            Self::AffiliationChanged => 3,
            Self::Superseded => 4,
            Self::CessationOfOperation => 5,
            Self::CertificateHold => 6,
            Self::RemoveFromCrl => 8,
            Self::PrivilegeWithdrawn => 9,
            Self::AaCompromise => 10,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|r| r.code() == code)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::KeyCompromise => "keyCompromise",
            Self::CaCompromise => "cACompromise",
            Self::AffiliationChanged => "affiliationChanged",
            Self::Superseded => "superseded",
            Self::CessationOfOperation => "cessationOfOperation",
            Self::CertificateHold => "certificateHold",
            Self::RemoveFromCrl => "removeFromCRL",
            Self::PrivilegeWithdrawn => "privilegeWithdrawn",
            Self::AaCompromise => "aACompromise",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RevocationReason {
    type Err = CaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| CaError::invalid(format!("unknown revocation reason '{s}'")))
    }
}

/// One revoked certificate as listed in a CRL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokedEntry {
    pub serial: BigUint,
    pub revocation_date: OffsetDateTime,
    pub reason: RevocationReason,
}

/// A DER-backed CRL. Two CRLs are equal when their encodings are.
#[derive(Debug, Clone)]
pub struct X509Crl {
    der: Vec<u8>,
    list: CertificateList,
}

impl PartialEq for X509Crl {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for X509Crl {}

impl X509Crl {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let list = CertificateList::from_der(der)
            .map_err(|e| CaError::io(format!("malformed CRL: {e}")))?;
        Ok(Self {
            der: der.to_vec(),
            list,
        })
    }

    /// Decodes PEM (`X509 CRL`) or DER input.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (der, _) = to_der(data, CRL_LABELS)?;
        Self::from_der(&der)
    }

    pub fn encode(&self, encoding: Encoding) -> Vec<u8> {
        from_der(self.der.clone(), "X509 CRL", encoding)
    }

    pub fn to_der(&self) -> &[u8] {
        &self.der
    }

    pub fn issuer(&self) -> String {
        self.list.tbs_cert_list.issuer.to_string()
    }

    pub fn this_update(&self) -> Result<OffsetDateTime> {
        time_to_offset(&self.list.tbs_cert_list.this_update)
    }

    pub fn next_update(&self) -> Result<Option<OffsetDateTime>> {
        self.list
            .tbs_cert_list
            .next_update
            .as_ref()
            .map(time_to_offset)
            .transpose()
    }

    /// Value of the cRLNumber extension.
    pub fn number(&self) -> Result<Option<BigUint>> {
        let Some(ext) = find_extension(self.list.tbs_cert_list.crl_extensions.as_deref(), OID_CRL_NUMBER)
        else {
            return Ok(None);
        };
        let number = Uint::from_der(ext.extn_value.as_bytes())?;
        Ok(Some(BigUint::from_bytes_be(number.as_bytes())))
    }

    pub fn revoked(&self) -> Result<Vec<RevokedEntry>> {
        let Some(revoked) = self.list.tbs_cert_list.revoked_certificates.as_ref() else {
            return Ok(Vec::new());
        };
        revoked
            .iter()
            .map(|entry| {
                let reason = find_extension(entry.crl_entry_extensions.as_deref(), OID_CRL_REASON)
                    .and_then(|ext| match ext.extn_value.as_bytes() {
                        [ASN1_ENUMERATED, 1, code] => RevocationReason::from_code(*code),
                        _ => None,
                    })
                    .unwrap_or_default();
                Ok(RevokedEntry {
                    serial: BigUint::from_bytes_be(entry.serial_number.as_bytes()),
                    revocation_date: time_to_offset(&entry.revocation_date)?,
                    reason,
                })
            })
            .collect()
    }

    /// Checks the CRL signature against the issuer's public key.
    pub fn verify<T: HasPublic>(&self, key: &PKeyRef<T>) -> Result<bool> {
        let crl = openssl::x509::X509Crl::from_der(&self.der)?;
        Ok(crl.verify(key)?)
    }
}

fn find_extension(extensions: Option<&[Extension]>, oid: der::oid::ObjectIdentifier) -> Option<&Extension> {
    extensions?.iter().find(|ext| ext.extn_id == oid)
}

fn offset_to_time(t: OffsetDateTime) -> Result<Time> {
    let secs = u64::try_from(t.unix_timestamp())
        .map_err(|_| CaError::invalid(format!("{t} predates the unix epoch")))?;
    let duration = Duration::from_secs(secs);
    if t.unix_timestamp() < UTC_TIME_LIMIT {
        Ok(Time::UtcTime(UtcTime::from_unix_duration(duration)?))
    } else {
        Ok(Time::GeneralTime(GeneralizedTime::from_unix_duration(duration)?))
    }
}

fn time_to_offset(t: &Time) -> Result<OffsetDateTime> {
    let secs = i64::try_from(t.to_unix_duration().as_secs())
        .map_err(|_| CaError::io("CRL time out of range"))?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| CaError::io(format!("CRL time: {e}")))
}

/// Unsigned big-endian serial as a positive DER INTEGER body.
fn serial_number(serial: &BigUint) -> Result<SerialNumber> {
    let mut bytes = serial.to_bytes_be();
    if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0);
    }
    Ok(SerialNumber::new(&bytes)?)
}

/// Builds and signs a v2 CRL listing `entries`.
pub fn build_crl(
    ca_cert: &X509Ref,
    ca_key: &PKeyRef<Private>,
    algorithm: SignatureAlgorithm,
    number: &BigUint,
    this_update: OffsetDateTime,
    next_update: OffsetDateTime,
    entries: &[RevokedEntry],
) -> Result<X509Crl> {
    algorithm.check_compatible(ca_key)?;
    let issuer = x509_cert::Certificate::from_der(&ca_cert.to_der()?)?
        .tbs_certificate
        .subject;

    let mut revoked = Vec::with_capacity(entries.len());
    for entry in entries {
        revoked.push(RevokedCert {
            serial_number: serial_number(&entry.serial)?,
            revocation_date: offset_to_time(entry.revocation_date)?,
            crl_entry_extensions: Some(vec![Extension {
                extn_id: OID_CRL_REASON,
                critical: false,
                extn_value: OctetString::new(vec![ASN1_ENUMERATED, 1, entry.reason.code()])?,
            }]),
        });
    }

    let crl_number = Uint::new(&number.to_bytes_be())?.to_der()?;
    let tbs = TbsCertList {
        version: Version::V2,
        signature: algorithm.algorithm_identifier(),
        issuer,
        this_update: offset_to_time(this_update)?,
        next_update: Some(offset_to_time(next_update)?),
        revoked_certificates: (!revoked.is_empty()).then_some(revoked),
        crl_extensions: Some(vec![Extension {
            extn_id: OID_CRL_NUMBER,
            critical: false,
            extn_value: OctetString::new(crl_number)?,
        }]),
    };

    let tbs_der = tbs.to_der()?;
    let mut signer = if algorithm.uses_digest() {
        Signer::new(algorithm.message_digest(), ca_key)?
    } else {
        Signer::new_without_digest(ca_key)?
    };
    let signature = signer.sign_oneshot_to_vec(&tbs_der)?;

    let list = CertificateList {
        tbs_cert_list: tbs,
        signature_algorithm: algorithm.algorithm_identifier(),
        signature: BitString::from_bytes(&signature)?,
    };
    let der = list.to_der()?;
    Ok(X509Crl { der, list })
}
