//! Reusable bundles of request parameters.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::certificate_request::{
    CertificateRequest, ExtendedKeyUsagePurpose, GeneralNameEntry, KeyUsageFlag,
};
use crate::error::Result;
use crate::key_pair_factory::KeyType;
use crate::signature_algorithm::SignatureAlgorithm;

/// A stored template. Templates are never edited in place: replace one by
/// removing it and adding a new one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateKeyPairTemplate {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub key_type: KeyType,
    #[serde(default)]
    pub key_usage: BTreeSet<KeyUsageFlag>,
    #[serde(default)]
    pub extended_key_usage: BTreeSet<ExtendedKeyUsagePurpose>,
    #[serde(default)]
    pub is_ca: bool,
    pub crl_issuer: Option<String>,
    pub crl_location: Option<String>,
    pub signature_algorithm: Option<SignatureAlgorithm>,
    #[serde(default)]
    pub subject_alternative_names: Vec<GeneralNameEntry>,
}

impl CertificateKeyPairTemplate {
    pub fn new(name: impl Into<String>, subject: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            subject: subject.into(),
            key_type,
            key_usage: BTreeSet::new(),
            extended_key_usage: BTreeSet::new(),
            is_ca: false,
            crl_issuer: None,
            crl_location: None,
            signature_algorithm: None,
            subject_alternative_names: Vec::new(),
        }
    }

    /// Request asking the CA to generate a key pair with these parameters.
    pub fn to_request(&self) -> CertificateRequest {
        CertificateRequest {
            subject: Some(self.subject.clone()),
            key_type: Some(self.key_type),
            key_usage: self.key_usage.clone(),
            extended_key_usage: self.extended_key_usage.clone(),
            subject_alternative_names: self.subject_alternative_names.clone(),
            is_ca: self.is_ca,
            crl_issuer: self.crl_issuer.clone(),
            crl_location: self.crl_location.clone(),
            signature_algorithm: self.signature_algorithm,
            key_pair: None,
            pkcs10: None,
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> CertificateKeyPairTemplate {
        let mut template =
            CertificateKeyPairTemplate::new("web server", "CN=www.example.org", KeyType::EcP384);
        template.key_usage.insert(KeyUsageFlag::DigitalSignature);
        template
            .extended_key_usage
            .insert(ExtendedKeyUsagePurpose::ServerAuth);
        template
            .subject_alternative_names
            .push(GeneralNameEntry::Dns("www.example.org".into()));
        template.crl_location = Some("http://crl.example.org/ca.crl".into());
        template
    }

    #[test]
    fn test_toml_round_trip_keeps_every_field() {
        let template = template();
        let back = CertificateKeyPairTemplate::from_toml(&template.to_toml().unwrap()).unwrap();
        assert_eq!(back, template);
    }

    #[test]
    fn test_equality_is_field_wise() {
        let a = template();
        let mut b = a.clone();
        assert_eq!(a, b);
        b.is_ca = true;
        assert_ne!(a, b);
    }

    #[test]
    fn test_to_request() {
        let request = template().to_request();
        assert_eq!(request.subject.as_deref(), Some("CN=www.example.org"));
        assert_eq!(request.key_type, Some(KeyType::EcP384));
        assert!(!request.is_foreign());
        assert_eq!(request.subject_alternative_names.len(), 1);
    }
}
