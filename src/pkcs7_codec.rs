//! Certificate chains as degenerate PKCS#7 SignedData (certificates only,
//! no signers).

use cms::cert::CertificateChoices;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo, SignedData, SignerInfos,
};
use der::asn1::{ObjectIdentifier, SetOfVec};
use der::{Any, Decode, Encode};
use openssl::x509::{X509VerifyResult, X509};

use crate::encoding::{from_der, to_der, Encoding};
use crate::error::{CaError, Result};

const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
const PKCS7_LABELS: &[&str] = &["PKCS7", "CERTIFICATE CHAIN", "CMS"];

pub fn encode_certificate_chain(chain: &[X509], encoding: Encoding) -> Result<Vec<u8>> {
    if chain.is_empty() {
        return Err(CaError::invalid("certificate chain is empty"));
    }
    let mut choices = Vec::with_capacity(chain.len());
    for cert in chain {
        let parsed = x509_cert::Certificate::from_der(&cert.to_der()?)?;
        choices.push(CertificateChoices::Certificate(parsed));
    }

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: DigestAlgorithmIdentifiers::default(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(choices)?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };
    let content_info = ContentInfo {
        content_type: ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)?,
    };
    Ok(from_der(content_info.to_der()?, "PKCS7", encoding))
}

/// Decodes a PKCS#7 certificate bundle, returning the chain leaf first.
pub fn decode_certificate_chain(data: &[u8]) -> Result<Vec<X509>> {
    let (der, _) = to_der(data, PKCS7_LABELS)?;
    let content_info = ContentInfo::from_der(&der)
        .map_err(|e| CaError::io(format!("not a PKCS#7 structure: {e}")))?;
    if content_info.content_type != ID_SIGNED_DATA {
        return Err(CaError::io(format!(
            "unexpected PKCS#7 content type {}",
            content_info.content_type
        )));
    }
    let signed_data = SignedData::from_der(&content_info.content.to_der()?)?;

    let mut certs = Vec::new();
    if let Some(set) = signed_data.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                certs.push(X509::from_der(&cert.to_der()?)?);
            }
        }
    }
    if certs.is_empty() {
        return Err(CaError::io("PKCS#7 structure holds no certificates"));
    }
    Ok(order_chain(certs))
}

/// Orders certificates leaf first, following issuer links. Certificates
/// that do not link into the chain are appended in their original order.
pub fn order_chain(mut certs: Vec<X509>) -> Vec<X509> {
    let issues_another = |candidate: &X509, all: &[X509]| {
        all.iter().any(|other| {
            !std::ptr::eq(candidate, other) && candidate.issued(other) == X509VerifyResult::OK
        })
    };
    let Some(leaf_index) = certs.iter().position(|c| !issues_another(c, &certs)) else {
        return certs;
    };

    let mut ordered = vec![certs.remove(leaf_index)];
    loop {
        let Some(current) = ordered.last() else { break };
        let next = certs
            .iter()
            .position(|candidate| candidate.issued(current) == X509VerifyResult::OK);
        match next {
            Some(index) => ordered.push(certs.remove(index)),
            None => break,
        }
    }
    ordered.extend(certs);
    ordered
}
