//! Single certificates, PKCS#10 requests and public keys in PEM or DER.

use openssl::pkey::{HasPublic, PKey, PKeyRef, Public};
use openssl::x509::{X509Ref, X509Req, X509ReqRef, X509};

use crate::encoding::{from_der, to_der, Encoding};
use crate::error::{CaError, Result};

const CERTIFICATE_LABELS: &[&str] = &["CERTIFICATE", "X509 CERTIFICATE", "TRUSTED CERTIFICATE"];
const REQUEST_LABELS: &[&str] = &["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];
const PUBLIC_KEY_LABELS: &[&str] = &["PUBLIC KEY"];

pub fn encode_certificate(cert: &X509Ref, encoding: Encoding) -> Result<Vec<u8>> {
    Ok(from_der(cert.to_der()?, "CERTIFICATE", encoding))
}

pub fn decode_certificate(data: &[u8]) -> Result<X509> {
    let (der, _) = to_der(data, CERTIFICATE_LABELS)?;
    X509::from_der(&der).map_err(|e| CaError::io(format!("malformed certificate: {e}")))
}

pub fn encode_certificate_request(request: &X509ReqRef, encoding: Encoding) -> Result<Vec<u8>> {
    Ok(from_der(request.to_der()?, "CERTIFICATE REQUEST", encoding))
}

/// Decodes a PKCS#10 request and checks its self-signature.
pub fn decode_certificate_request(data: &[u8]) -> Result<X509Req> {
    let (der, _) = to_der(data, REQUEST_LABELS)?;
    let request = X509Req::from_der(&der)
        .map_err(|e| CaError::io(format!("malformed certificate request: {e}")))?;
    let public_key = request.public_key()?;
    if !request.verify(&public_key)? {
        return Err(CaError::invalid(
            "certificate request signature does not verify",
        ));
    }
    Ok(request)
}

/// SubjectPublicKeyInfo of `key`.
pub fn encode_public_key<T: HasPublic>(key: &PKeyRef<T>, encoding: Encoding) -> Result<Vec<u8>> {
    Ok(from_der(key.public_key_to_der()?, "PUBLIC KEY", encoding))
}

pub fn decode_public_key(data: &[u8]) -> Result<PKey<Public>> {
    let (der, _) = to_der(data, PUBLIC_KEY_LABELS)?;
    PKey::public_key_from_der(&der).map_err(|e| CaError::io(format!("malformed public key: {e}")))
}

/// Hex SHA-256 fingerprint, colon separated.
pub fn fingerprint(cert: &X509Ref) -> Result<String> {
    let digest = cert.digest(openssl::hash::MessageDigest::sha256())?;
    Ok(digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_factory::generate_self_signed_certificate;
    use crate::certificate_request::parse_name;
    use crate::key_pair_factory::{generate_key_pair, KeyType};
    use openssl::hash::MessageDigest;
    use openssl::x509::X509ReqBuilder;
    use time::{Duration, OffsetDateTime};

    #[test]
    fn test_certificate_pem_and_der() {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let now = OffsetDateTime::now_utc();
        let cert = generate_self_signed_certificate(
            "CN=codec",
            now,
            now + Duration::days(1),
            &key,
            None,
            false,
            None,
        )
        .unwrap();
        for encoding in [Encoding::Pem, Encoding::Der] {
            let data = encode_certificate(&cert, encoding).unwrap();
            let decoded = decode_certificate(&data).unwrap();
            assert_eq!(decoded.to_der().unwrap(), cert.to_der().unwrap());
        }
        assert_eq!(fingerprint(&cert).unwrap().len(), 32 * 3 - 1);
    }

    #[test]
    fn test_request_with_bad_signature_is_rejected() {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let other = generate_key_pair(KeyType::EcP256).unwrap();
        let mut req = X509ReqBuilder::new().unwrap();
        req.set_subject_name(&parse_name("CN=req").unwrap()).unwrap();
        req.set_pubkey(&key).unwrap();
        req.sign(&other, MessageDigest::sha256()).unwrap();
        let pem = req.build().to_pem().unwrap();
        assert!(matches!(
            decode_certificate_request(&pem),
            Err(CaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_certificate_label_mismatch() {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let pem = encode_public_key(&key, Encoding::Pem).unwrap();
        assert!(decode_certificate(&pem).unwrap_err().is_io_failure());
        assert!(decode_public_key(&pem).is_ok());
    }
}
