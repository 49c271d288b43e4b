//! X.509 certificate construction.
//!
//! Two entry points:
//! - [`generate_self_signed_certificate`] for the CA's own root certificate
//! - [`sign_certificate_request`] for certificates issued by a CA
//!
//! # Extensions written
//! - **Basic Constraints**: always present, critical, CA flag from the request
//! - **Key Usage**: requested bits; CA certificates always get keyCertSign and cRLSign
//! - **Extended Key Usage**: requested purposes
//! - **Subject Alternative Name**: DNS / IP / email / URI entries
//! - **CRL Distribution Point**: URI plus optional CRL issuer
//! - **Subject / Authority Key Identifier**

use std::collections::BTreeSet;
use std::fmt;

use der::asn1::Ia5String;
use der::{Decode, Encode};
use openssl::asn1::{Asn1Object, Asn1OctetString, Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Extension, X509Ref, X509VerifyResult, X509};
use num_bigint::BigUint;
use time::OffsetDateTime;
use tracing::debug;
use x509_cert::ext::pkix::crl::dp::DistributionPoint;
use x509_cert::ext::pkix::name::{DistributionPointName, GeneralName};
use x509_cert::ext::pkix::{BasicConstraints as BasicConstraintsExt, CrlDistributionPoints};
use x509_cert::name::Name;

use crate::certificate_request::{
    parse_name, CertificateRequest, ExtendedKeyUsagePurpose, GeneralNameEntry, KeyUsageFlag,
};
use crate::error::{CaError, Result};
use crate::key_pair_factory::generate_key_pair;
use crate::signature_algorithm::SignatureAlgorithm;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_BITS: i32 = 128;
const OID_BASIC_CONSTRAINTS: &str = "2.5.29.19";
const OID_CRL_DISTRIBUTION_POINTS: &str = "2.5.29.31";

/// A certificate together with its private key (when the CA generated or
/// holds it) and the chain up to the root, leaf first.
#[derive(Clone)]
pub struct IssuedCertificate {
    pub certificate: X509,
    pub private_key: Option<PKey<Private>>,
    pub chain: Vec<X509>,
}

impl IssuedCertificate {
    pub fn new(certificate: X509, private_key: Option<PKey<Private>>, chain: Vec<X509>) -> Self {
        Self {
            certificate,
            private_key,
            chain,
        }
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("subject", &crate::certificate_request::format_name(self.certificate.subject_name()))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Converts a wall-clock time into an ASN.1 time.
pub fn to_asn1_time(t: OffsetDateTime) -> Result<Asn1Time> {
    Ok(Asn1Time::from_unix(t.unix_timestamp())?)
}

/// Converts an ASN.1 time back into a wall-clock time.
pub fn from_asn1_time(t: &Asn1TimeRef) -> Result<OffsetDateTime> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(t)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| CaError::invalid(format!("certificate time out of range: {e}")))
}

/// Serial number bytes as openssl expects them.
pub fn serial_to_bignum(serial: &BigUint) -> Result<BigNum> {
    Ok(BigNum::from_slice(&serial.to_bytes_be())?)
}

/// Reads the serial of a certificate as an unsigned integer.
pub fn certificate_serial(cert: &X509Ref) -> Result<BigUint> {
    let bn = cert.serial_number().to_bn()?;
    Ok(BigUint::from_bytes_be(&bn.to_vec()))
}

/// `true` when `cert` names itself as issuer and its signature verifies
/// with its own public key.
pub fn is_self_signed(cert: &X509Ref) -> Result<bool> {
    if cert.issued(cert) != X509VerifyResult::OK {
        return Ok(false);
    }
    let public_key = cert.public_key()?;
    Ok(cert.verify(&public_key)?)
}

/// `true` when the basic constraints extension marks `cert` as a CA.
pub fn is_ca_certificate(cert: &X509Ref) -> Result<bool> {
    let parsed = x509_cert::Certificate::from_der(&cert.to_der()?)?;
    let oid = der::oid::ObjectIdentifier::new_unwrap(OID_BASIC_CONSTRAINTS);
    let Some(extensions) = parsed.tbs_certificate.extensions.as_ref() else {
        return Ok(false);
    };
    match extensions.iter().find(|ext| ext.extn_id == oid) {
        Some(ext) => Ok(BasicConstraintsExt::from_der(ext.extn_value.as_bytes())?.ca),
        None => Ok(false),
    }
}

/// `true` when `cert` carries the public half of `key`.
pub fn key_matches_certificate<T: HasPublic>(cert: &X509Ref, key: &PKeyRef<T>) -> Result<bool> {
    Ok(cert.public_key()?.public_eq(key))
}

/// Generates a self-signed certificate for `key`.
pub fn generate_self_signed_certificate(
    subject: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    key: &PKeyRef<Private>,
    signature_algorithm: Option<SignatureAlgorithm>,
    is_ca: bool,
    crl_distribution_point: Option<&str>,
) -> Result<X509> {
    if not_before >= not_after {
        return Err(CaError::invalid("start date must be before expiry date"));
    }
    let algorithm = match signature_algorithm {
        Some(algorithm) => {
            algorithm.check_compatible(key)?;
            algorithm
        }
        None => SignatureAlgorithm::default_for(key)?,
    };
    let name = parse_name(subject)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;

    // Random 128-bit serial, as the root is never counted by the CA
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;

    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    let not_before = to_asn1_time(not_before)?;
    let not_after = to_asn1_time(not_after)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(key)?;

    let mut bc = BasicConstraints::new();
    bc.critical();
    if is_ca {
        bc.ca();
    }
    builder.append_extension(bc.build()?)?;

    if is_ca {
        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?;
        builder.append_extension(ku)?;
    }

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(ski)?;

    if let Some(location) = crl_distribution_point {
        builder.append_extension(crl_distribution_point_extension(location, None)?)?;
    }

    builder.sign(key, algorithm.message_digest())?;
    let certificate = builder.build();
    debug!(subject, algorithm = %algorithm, "generated self-signed certificate");
    Ok(certificate)
}

/// Signs `request` with the CA in `issuer`.
///
/// Validation runs in a fixed order and stops at the first failure, each
/// reported as [`CaError::InvalidArgument`]: request, subject, key type
/// (not needed for PKCS#10 requests or a supplied key), start date, expiry
/// date, start before expiry, subject differs from issuer, validity inside
/// the issuer's validity.
pub fn sign_certificate_request(
    issuer: &IssuedCertificate,
    request: Option<&CertificateRequest>,
    not_before: Option<OffsetDateTime>,
    not_after: Option<OffsetDateTime>,
    serial: &BigUint,
    signature_algorithm: SignatureAlgorithm,
) -> Result<IssuedCertificate> {
    let request = request.ok_or_else(|| CaError::invalid("no certificate request given"))?;
    let subject = request
        .subject
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| CaError::invalid("certificate request has no subject"))?;
    if !request.is_foreign() && request.key_pair.is_none() && request.key_type.is_none() {
        return Err(CaError::invalid("certificate request has no key type"));
    }
    let not_before = not_before.ok_or_else(|| CaError::invalid("no start date given"))?;
    let not_after = not_after.ok_or_else(|| CaError::invalid("no expiry date given"))?;
    if not_before >= not_after {
        return Err(CaError::invalid("start date must be before expiry date"));
    }

    let ca_cert = &issuer.certificate;
    let subject_name = parse_name(subject)?;
    if subject_name.to_der()? == ca_cert.subject_name().to_der()? {
        return Err(CaError::invalid(
            "certificate subject must differ from the issuer subject",
        ));
    }
    let issuer_not_before = from_asn1_time(ca_cert.not_before())?;
    let issuer_not_after = from_asn1_time(ca_cert.not_after())?;
    if not_before < issuer_not_before {
        return Err(CaError::invalid(format!(
            "start date {not_before} precedes the issuer start date {issuer_not_before}"
        )));
    }
    if not_after > issuer_not_after {
        return Err(CaError::invalid(format!(
            "expiry date {not_after} exceeds the issuer expiry date {issuer_not_after}"
        )));
    }

    let ca_key = issuer
        .private_key
        .as_ref()
        .ok_or(CaError::LockedDatastore)?;
    signature_algorithm.check_compatible(ca_key)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    let asn1_serial = serial_to_bignum(serial)?.to_asn1_integer()?;
    builder.set_serial_number(&asn1_serial)?;
    builder.set_subject_name(&subject_name)?;
    builder.set_issuer_name(ca_cert.subject_name())?;
    let asn1_not_before = to_asn1_time(not_before)?;
    let asn1_not_after = to_asn1_time(not_after)?;
    builder.set_not_before(&asn1_not_before)?;
    builder.set_not_after(&asn1_not_after)?;

    let private_key = if let Some(pkcs10) = request.pkcs10.as_ref() {
        let public_key = pkcs10.public_key()?;
        if !pkcs10.verify(&public_key)? {
            return Err(CaError::invalid("PKCS#10 request signature does not verify"));
        }
        builder.set_pubkey(&public_key)?;
        None
    } else {
        let key = match (&request.key_pair, request.key_type) {
            (Some(key), _) => key.clone(),
            (None, Some(key_type)) => generate_key_pair(key_type)?,
            (None, None) => return Err(CaError::invalid("certificate request has no key type")),
        };
        builder.set_pubkey(&key)?;
        Some(key)
    };

    append_request_extensions(&mut builder, ca_cert, request)?;
    builder.sign(ca_key, signature_algorithm.message_digest())?;
    let certificate = builder.build();

    let mut chain = Vec::with_capacity(issuer.chain.len() + 1);
    chain.push(certificate.clone());
    if issuer.chain.is_empty() {
        chain.push(ca_cert.clone());
    } else {
        chain.extend(issuer.chain.iter().cloned());
    }

    debug!(subject, serial = %serial, algorithm = %signature_algorithm, "signed certificate");
    Ok(IssuedCertificate::new(certificate, private_key, chain))
}

fn append_request_extensions(
    builder: &mut X509Builder,
    ca_cert: &X509Ref,
    request: &CertificateRequest,
) -> Result<()> {
    let mut bc = BasicConstraints::new();
    bc.critical();
    if request.is_ca {
        bc.ca();
    }
    builder.append_extension(bc.build()?)?;

    let mut usage: BTreeSet<KeyUsageFlag> = request.key_usage.clone();
    if request.is_ca {
        usage.insert(KeyUsageFlag::KeyCertSign);
        usage.insert(KeyUsageFlag::CrlSign);
    }
    if !usage.is_empty() {
        builder.append_extension(key_usage_extension(&usage)?)?;
    }

    if !request.extended_key_usage.is_empty() {
        let mut eku = ExtendedKeyUsage::new();
        for purpose in &request.extended_key_usage {
            match purpose {
                ExtendedKeyUsagePurpose::ServerAuth => eku.server_auth(),
                ExtendedKeyUsagePurpose::ClientAuth => eku.client_auth(),
                ExtendedKeyUsagePurpose::CodeSigning => eku.code_signing(),
                ExtendedKeyUsagePurpose::EmailProtection => eku.email_protection(),
                ExtendedKeyUsagePurpose::TimeStamping => eku.time_stamping(),
                ExtendedKeyUsagePurpose::OcspSigning => eku.other(purpose.oid()),
            };
        }
        builder.append_extension(eku.build()?)?;
    }

    if !request.subject_alternative_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for entry in &request.subject_alternative_names {
            match entry {
                GeneralNameEntry::Dns(v) => san.dns(v),
                GeneralNameEntry::Ip(v) => san.ip(v),
                GeneralNameEntry::Email(v) => san.email(v),
                GeneralNameEntry::Uri(v) => san.uri(v),
            };
        }
        let ext = san.build(&builder.x509v3_context(Some(ca_cert), None))?;
        builder.append_extension(ext)?;
    }

    if let Some(location) = request.crl_location.as_deref() {
        builder.append_extension(crl_distribution_point_extension(
            location,
            request.crl_issuer.as_deref(),
        )?)?;
    }

    let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(ski)?;
    let aki = AuthorityKeyIdentifier::new()
        .keyid(false)
        .issuer(false)
        .build(&builder.x509v3_context(Some(ca_cert), None))?;
    builder.append_extension(aki)?;
    Ok(())
}

fn key_usage_extension(usage: &BTreeSet<KeyUsageFlag>) -> Result<X509Extension> {
    let mut ku = KeyUsage::new();
    ku.critical();
    for flag in usage {
        match flag {
            KeyUsageFlag::DigitalSignature => ku.digital_signature(),
            KeyUsageFlag::NonRepudiation => ku.non_repudiation(),
            KeyUsageFlag::KeyEncipherment => ku.key_encipherment(),
            KeyUsageFlag::DataEncipherment => ku.data_encipherment(),
            KeyUsageFlag::KeyAgreement => ku.key_agreement(),
            KeyUsageFlag::KeyCertSign => ku.key_cert_sign(),
            KeyUsageFlag::CrlSign => ku.crl_sign(),
            KeyUsageFlag::EncipherOnly => ku.encipher_only(),
            KeyUsageFlag::DecipherOnly => ku.decipher_only(),
        };
    }
    Ok(ku.build()?)
}

/// CRL distribution point extension with a single URI and an optional
/// CRL issuer given as a distinguished name.
fn crl_distribution_point_extension(location: &str, crl_issuer: Option<&str>) -> Result<X509Extension> {
    let uri = Ia5String::new(location)
        .map_err(|_| CaError::invalid(format!("CRL location '{location}' is not ASCII")))?;
    let crl_issuer = match crl_issuer {
        Some(dn) => {
            let name: Name = dn
                .parse()
                .map_err(|_| CaError::invalid(format!("malformed CRL issuer '{dn}'")))?;
            Some(vec![GeneralName::DirectoryName(name)])
        }
        None => None,
    };
    let points = CrlDistributionPoints(vec![DistributionPoint {
        distribution_point: Some(DistributionPointName::FullName(vec![
            GeneralName::UniformResourceIdentifier(uri),
        ])),
        reasons: None,
        crl_issuer,
    }]);
    let der = points.to_der()?;
    let oid = Asn1Object::from_str(OID_CRL_DISTRIBUTION_POINTS)?;
    let contents = Asn1OctetString::new_from_bytes(&der)?;
    Ok(X509Extension::new_from_der(&oid, false, &contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_pair_factory::KeyType;
    use openssl::x509::X509ReqBuilder;
    use time::Duration;

    fn test_ca() -> IssuedCertificate {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let now = OffsetDateTime::now_utc();
        let cert = generate_self_signed_certificate(
            "CN=Test Root,O=Example",
            now - Duration::days(1),
            now + Duration::days(30),
            &key,
            None,
            true,
            None,
        )
        .unwrap();
        IssuedCertificate::new(cert.clone(), Some(key), vec![cert])
    }

    fn err_message(result: Result<IssuedCertificate>) -> String {
        match result {
            Err(CaError::InvalidArgument(message)) => message,
            other => panic!("expected InvalidArgument, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_self_signed_ca_certificate() {
        let ca = test_ca();
        assert!(is_self_signed(&ca.certificate).unwrap());
        assert!(is_ca_certificate(&ca.certificate).unwrap());
        assert!(key_matches_certificate(&ca.certificate, ca.private_key.as_ref().unwrap()).unwrap());
    }

    #[test]
    fn test_sign_request_sets_serial_and_extensions() {
        let ca = test_ca();
        let now = OffsetDateTime::now_utc();
        let request = CertificateRequest::new()
            .subject("CN=server,O=Example")
            .key_type(KeyType::EcP256)
            .key_usage(KeyUsageFlag::DigitalSignature)
            .extended_key_usage(ExtendedKeyUsagePurpose::ServerAuth)
            .extended_key_usage(ExtendedKeyUsagePurpose::OcspSigning)
            .subject_alternative_name(GeneralNameEntry::Dns("server.example".into()))
            .crl_distribution_point("http://crl.example/ca.crl", Some("CN=Test Root".into()));
        let issued = sign_certificate_request(
            &ca,
            Some(&request),
            Some(now),
            Some(now + Duration::days(7)),
            &BigUint::from(0x1000u32),
            SignatureAlgorithm::Sha256WithEcdsa,
        )
        .unwrap();

        assert_eq!(
            certificate_serial(&issued.certificate).unwrap(),
            BigUint::from(0x1000u32)
        );
        assert!(issued.private_key.is_some());
        assert_eq!(issued.chain.len(), 2);
        assert!(!is_ca_certificate(&issued.certificate).unwrap());
        let ca_key = ca.private_key.as_ref().unwrap();
        assert!(issued.certificate.verify(ca_key).unwrap());
        let sans = issued.certificate.subject_alt_names().unwrap();
        assert_eq!(sans.iter().next().unwrap().dnsname(), Some("server.example"));
    }

    #[test]
    fn test_validation_order() {
        let ca = test_ca();
        let now = OffsetDateTime::now_utc();
        let serial = BigUint::from(1u32);
        let alg = SignatureAlgorithm::Sha256WithEcdsa;

        assert!(err_message(sign_certificate_request(&ca, None, None, None, &serial, alg))
            .contains("no certificate request"));

        let no_subject = CertificateRequest::new();
        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&no_subject),
            None,
            None,
            &serial,
            alg
        ))
        .contains("subject"));

        let no_key = CertificateRequest::new().subject("CN=x");
        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&no_key),
            None,
            None,
            &serial,
            alg
        ))
        .contains("key type"));

        let ok = CertificateRequest::new()
            .subject("CN=x")
            .key_type(KeyType::EcP256);
        assert!(err_message(sign_certificate_request(&ca, Some(&ok), None, None, &serial, alg))
            .contains("start date"));
        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&ok),
            Some(now),
            None,
            &serial,
            alg
        ))
        .contains("expiry date"));
        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&ok),
            Some(now),
            Some(now - Duration::hours(1)),
            &serial,
            alg
        ))
        .contains("before expiry"));

        let same_subject = CertificateRequest::new()
            .subject("CN=Test Root,O=Example")
            .key_type(KeyType::EcP256);
        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&same_subject),
            Some(now),
            Some(now + Duration::days(1)),
            &serial,
            alg
        ))
        .contains("differ"));

        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&ok),
            Some(now - Duration::days(2)),
            Some(now + Duration::days(1)),
            &serial,
            alg
        ))
        .contains("precedes"));
        assert!(err_message(sign_certificate_request(
            &ca,
            Some(&ok),
            Some(now),
            Some(now + Duration::days(60)),
            &serial,
            alg
        ))
        .contains("exceeds"));
    }

    #[test]
    fn test_sign_foreign_pkcs10() {
        let ca = test_ca();
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let mut req = X509ReqBuilder::new().unwrap();
        req.set_subject_name(&parse_name("CN=foreign").unwrap()).unwrap();
        req.set_pubkey(&key).unwrap();
        req.sign(&key, openssl::hash::MessageDigest::sha256()).unwrap();
        let request = CertificateRequest::from_pkcs10(req.build()).unwrap();

        let now = OffsetDateTime::now_utc();
        let issued = sign_certificate_request(
            &ca,
            Some(&request),
            Some(now),
            Some(now + Duration::days(1)),
            &BigUint::from(7u32),
            SignatureAlgorithm::Sha256WithEcdsa,
        )
        .unwrap();
        assert!(issued.private_key.is_none());
        assert!(key_matches_certificate(&issued.certificate, &key).unwrap());
    }

    #[test]
    fn test_asn1_time_conversion() {
        let t = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let asn1 = to_asn1_time(t).unwrap();
        assert_eq!(from_asn1_time(&asn1).unwrap(), t);
    }
}
