//! The certificate authority engine.
//!
//! A [`CertificateAuthority`] owns one CA directory (see [`crate::storage`]
//! for the layout). It starts LOCKED after [`CertificateAuthority::create`]
//! and [`CertificateAuthority::open`]; [`CertificateAuthority::unlock`]
//! decrypts the PKCS#12 keystore into a [`CaKeyStore`] and
//! [`CertificateAuthority::lock`] drops it again.
//!
//! # Lifecycle
//!
//! ```text
//! create/open ──> LOCKED ──unlock(passphrase)──> UNLOCKED
//!                   ^                               │
//!                   └────────────lock()─────────────┘
//! ```
//!
//! Operations needing the CA key fail with [`CaError::LockedDatastore`]
//! while locked and leave disk and memory untouched. Every mutation is
//! written to disk first, then reflected in the in-memory collections, then
//! announced through the CA's [`EventBus`].

use std::fmt;
use std::path::Path;

use num_bigint::{BigInt, BigUint};
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Req, X509};
use serde::de::DeserializeOwned;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::certificate_codec::{
    decode_certificate_request, encode_certificate, encode_certificate_request, encode_public_key,
};
use crate::certificate_factory::{
    is_ca_certificate, is_self_signed, key_matches_certificate, sign_certificate_request,
    IssuedCertificate,
};
use crate::certificate_request::{common_name, CertificateRequest};
use crate::crl::{build_crl, RevocationReason, RevokedEntry, X509Crl};
use crate::encoding::Encoding;
use crate::error::{CaError, Result};
use crate::events::{CaEvent, EventBus, Listener, SubscriptionHandle};
use crate::key_store::CaKeyStore;
use crate::pkcs12_codec::{decode_pkcs12, encode_pkcs12, Pkcs12Cipher};
use crate::pkcs7_codec::encode_certificate_chain;
use crate::pkcs8_codec::{encode_private_key, Pkcs8Cipher};
use crate::properties::{CertificateRequestProperties, CrlProperties, IssuedCertificateProperties};
use crate::settings::CertificateAuthoritySettings;
use crate::signature_algorithm::SignatureAlgorithm;
use crate::storage::{validate_base_path, CaStorage, Collection};
use crate::template::CertificateKeyPairTemplate;

/// Friendly name of the CA entry inside its keystore.
pub const KEYSTORE_ALIAS: &str = "ca";

fn insert_sorted<T: Ord>(list: &mut Vec<T>, item: T) {
    let at = list.partition_point(|existing| existing <= &item);
    list.insert(at, item);
}

fn sort_templates(templates: &mut [CertificateKeyPairTemplate]) {
    templates.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}

fn load_property_files<T: DeserializeOwned>(
    storage: &CaStorage,
    collection: Collection,
) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    for stem in storage.list_stems(collection)? {
        let parsed = storage
            .read_properties(collection, &stem)
            .and_then(|text| Ok(toml::from_str::<T>(&text)?));
        match parsed {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(
                collection = collection.directory(),
                stem = %stem,
                error = %e,
                "skipping entry with unreadable properties"
            ),
        }
    }
    Ok(entries)
}

fn load_templates(storage: &CaStorage) -> Result<Vec<CertificateKeyPairTemplate>> {
    let mut templates = Vec::new();
    for stem in storage.list_stems(Collection::Templates)? {
        let parsed = storage
            .read_artifact(Collection::Templates, &stem)
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| CaError::io(format!("template {stem} is not UTF-8")))
            })
            .and_then(|text| CertificateKeyPairTemplate::from_toml(&text));
        match parsed {
            Ok(template) => templates.push(template),
            Err(e) => warn!(stem = %stem, error = %e, "skipping unreadable template"),
        }
    }
    sort_templates(&mut templates);
    Ok(templates)
}

fn max_serial<'a>(ids: impl Iterator<Item = &'a str>) -> Option<BigUint> {
    ids.filter_map(|id| BigUint::parse_bytes(id.as_bytes(), 16))
        .max()
}

pub struct CertificateAuthority {
    storage: CaStorage,
    settings: CertificateAuthoritySettings,
    key_store: Option<CaKeyStore>,
    requests: Vec<CertificateRequestProperties>,
    issued: Vec<IssuedCertificateProperties>,
    revoked: Vec<IssuedCertificateProperties>,
    crls: Vec<CrlProperties>,
    templates: Vec<CertificateKeyPairTemplate>,
    events: EventBus,
}

impl CertificateAuthority {
    /// Creates a new CA in the existing, empty directory `path` from the
    /// root bundle `issued`, protecting the keystore with `passphrase`.
    ///
    /// The bundle must hold a self-signed CA certificate, its matching
    /// private key and a non-empty chain; anything else is an I/O failure.
    pub fn create(
        path: &Path,
        issued: IssuedCertificate,
        passphrase: &str,
        description: &str,
    ) -> Result<Self> {
        let base = validate_base_path(path)?;
        let storage = CaStorage::new(&base);
        storage.check_writable()?;
        if storage.settings_path().exists() {
            return Err(CaError::io(format!(
                "{} already holds a certificate authority",
                base.display()
            )));
        }

        let certificate = &issued.certificate;
        if !is_self_signed(certificate)? {
            return Err(CaError::io("CA certificate is not self-signed"));
        }
        if !is_ca_certificate(certificate)? {
            return Err(CaError::io("certificate is not marked as a CA"));
        }
        let key = issued
            .private_key
            .as_ref()
            .ok_or_else(|| CaError::io("no CA private key given"))?;
        if !key_matches_certificate(certificate, key)? {
            return Err(CaError::io("private key does not match the CA certificate"));
        }
        if issued.chain.is_empty() {
            return Err(CaError::io("CA certificate chain is empty"));
        }

        let settings = CertificateAuthoritySettings::new(
            Uuid::new_v4(),
            description,
            SignatureAlgorithm::default_for(key)?,
        );
        storage.create_layout()?;
        let keystore = encode_pkcs12(&issued, Some(KEYSTORE_ALIAS), Pkcs12Cipher::Aes256Cbc, passphrase)?;
        storage.write_file(&storage.keystore_path(settings.keystore_filename()), &keystore)?;
        settings.write(&storage.settings_path())?;

        info!(id = %settings.id(), path = %base.display(), "created certificate authority");
        let ca = Self {
            storage,
            settings,
            key_store: None,
            requests: Vec::new(),
            issued: Vec::new(),
            revoked: Vec::new(),
            crls: Vec::new(),
            templates: Vec::new(),
            events: EventBus::new(),
        };
        ca.log_activity("created certificate authority");
        Ok(ca)
    }

    /// Opens the CA stored in `path`, scanning its collections and raising
    /// stale serial counters above the serials found on disk.
    pub fn open(path: &Path) -> Result<Self> {
        let base = validate_base_path(path)?;
        let storage = CaStorage::new(&base);
        let settings_path = storage.settings_path();
        if !settings_path.is_file() {
            return Err(CaError::io(format!(
                "{} holds no certificate authority",
                base.display()
            )));
        }
        let mut settings = CertificateAuthoritySettings::read(&settings_path)?;

        let mut requests: Vec<CertificateRequestProperties> =
            load_property_files(&storage, Collection::Requests)?;
        let mut issued: Vec<IssuedCertificateProperties> =
            load_property_files(&storage, Collection::Issued)?;
        let mut revoked: Vec<IssuedCertificateProperties> =
            load_property_files(&storage, Collection::Revoked)?;
        let mut crls: Vec<CrlProperties> = load_property_files(&storage, Collection::Crls)?;
        requests.sort();
        issued.sort();
        revoked.sort();
        crls.sort();
        let templates = load_templates(&storage)?;

        let mut fixed = false;
        let highest = max_serial(issued.iter().chain(&revoked).map(|p| p.id.as_str()));
        if let Some(highest) = highest.filter(|max| settings.serial_counter() <= max) {
            warn!(found = %highest, stored = %settings.serial_counter(), "raising stale serial counter");
            fixed |= settings.set_serial(Some(BigInt::from(highest + 1u32)));
        }
        let highest = max_serial(crls.iter().map(|p| p.id.as_str()));
        if let Some(highest) = highest.filter(|max| settings.crl_serial_counter() <= max) {
            warn!(found = %highest, stored = %settings.crl_serial_counter(), "raising stale CRL serial counter");
            fixed |= settings.set_crl_serial(Some(BigInt::from(highest + 1u32)));
        }
        if fixed {
            settings.write(&settings_path)?;
        }

        info!(
            id = %settings.id(),
            path = %base.display(),
            issued = issued.len(),
            revoked = revoked.len(),
            requests = requests.len(),
            "opened certificate authority"
        );
        Ok(Self {
            storage,
            settings,
            key_store: None,
            requests,
            issued,
            revoked,
            crls,
            templates,
            events: EventBus::new(),
        })
    }

    // ---- lock state -------------------------------------------------------

    pub fn is_locked(&self) -> bool {
        self.key_store.is_none()
    }

    /// Decrypts the keystore. A wrong passphrase is
    /// [`CaError::InvalidPassword`]; unlocking an unlocked CA does nothing.
    pub fn unlock(&mut self, passphrase: &str) -> Result<()> {
        if !self.is_locked() {
            return Ok(());
        }
        let path = self.storage.keystore_path(self.settings.keystore_filename());
        let data = std::fs::read(&path).map_err(|e| CaError::IoFailure {
            message: format!("failed to read keystore {}", path.display()),
            source: Some(e),
        })?;
        self.key_store = Some(CaKeyStore::new(decode_pkcs12(&data, passphrase)?)?);
        info!(id = %self.id(), "unlocked certificate authority");
        self.emit(&[CaEvent::LockChanged {
            old: true,
            new: false,
        }])
    }

    /// Drops the key material. Locking a locked CA does nothing.
    pub fn lock(&mut self) -> Result<()> {
        if self.key_store.take().is_none() {
            return Ok(());
        }
        info!(id = %self.id(), "locked certificate authority");
        self.emit(&[CaEvent::LockChanged {
            old: false,
            new: true,
        }])
    }

    fn unlocked(&self) -> Result<&CaKeyStore> {
        self.key_store.as_ref().ok_or(CaError::LockedDatastore)
    }

    // ---- key material -----------------------------------------------------

    pub fn certificate(&self) -> Result<X509> {
        Ok(self.unlocked()?.certificate().clone())
    }

    pub fn certificate_chain(&self) -> Result<Vec<X509>> {
        Ok(self.unlocked()?.chain().to_vec())
    }

    /// Owned copy of the CA private key.
    pub fn key_pair(&self) -> Result<PKey<Private>> {
        self.unlocked()?.private_key()
    }

    pub fn export_certificate(&self, encoding: Encoding) -> Result<Vec<u8>> {
        encode_certificate(self.unlocked()?.certificate(), encoding)
    }

    /// The CA chain as PKCS#7.
    pub fn export_certificate_chain(&self, encoding: Encoding) -> Result<Vec<u8>> {
        encode_certificate_chain(self.unlocked()?.chain(), encoding)
    }

    pub fn export_private_key(
        &self,
        encoding: Encoding,
        cipher: Pkcs8Cipher,
        passphrase: Option<&str>,
    ) -> Result<Vec<u8>> {
        let key = self.unlocked()?.private_key()?;
        encode_private_key(&key, encoding, cipher, passphrase)
    }

    pub fn export_public_key(&self, encoding: Encoding) -> Result<Vec<u8>> {
        let key = self.unlocked()?.certificate().public_key()?;
        encode_public_key(&key, encoding)
    }

    pub fn export_pkcs12(
        &self,
        cipher: Pkcs12Cipher,
        passphrase: &str,
        alias: Option<&str>,
    ) -> Result<Vec<u8>> {
        encode_pkcs12(&self.unlocked()?.to_issued()?, alias, cipher, passphrase)
    }

    /// Re-wraps the stored bundle of an issued or revoked certificate under
    /// `new_passphrase`. Works on a locked CA, the bundle has its own
    /// passphrase.
    pub fn export_issued_pkcs12(
        &self,
        id: &str,
        passphrase: &str,
        cipher: Pkcs12Cipher,
        new_passphrase: &str,
        alias: Option<&str>,
    ) -> Result<Vec<u8>> {
        let issued = self.load_issued_certificate(id, passphrase)?;
        encode_pkcs12(&issued, alias, cipher, new_passphrase)
    }

    // ---- issuing ----------------------------------------------------------

    /// Signs `request`, stores the result under `Issued/` protected by
    /// `passphrase` and returns it.
    pub fn sign_and_store_certificate_request(
        &mut self,
        request: &CertificateRequest,
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
        passphrase: &str,
    ) -> Result<IssuedCertificate> {
        let (issued, props) = self.issue(request, not_before, not_after, passphrase, None)?;
        self.log_activity(&format!(
            "issued {} to {}",
            props.id,
            props.subject.as_deref().unwrap_or_default()
        ));
        self.emit(&[CaEvent::IssuedChanged(self.issued.clone())])?;
        Ok(issued)
    }

    /// Signs the pending PKCS#10 request `request_id` and moves it to the
    /// issued collection.
    pub fn sign_pending_request(
        &mut self,
        request_id: &str,
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
        passphrase: &str,
    ) -> Result<IssuedCertificate> {
        self.unlocked()?;
        let pkcs10 = self.load_certificate_request(request_id)?;
        let request = CertificateRequest::from_pkcs10(pkcs10)?;
        let (issued, props) =
            self.issue(&request, not_before, not_after, passphrase, Some(request_id))?;

        self.storage.remove_artifact(Collection::Requests, request_id)?;
        self.requests.retain(|r| r.id != request_id);
        self.log_activity(&format!("issued {} for request {request_id}", props.id));
        self.emit(&[
            CaEvent::RequestsChanged(self.requests.clone()),
            CaEvent::IssuedChanged(self.issued.clone()),
        ])?;
        Ok(issued)
    }

    fn issue(
        &mut self,
        request: &CertificateRequest,
        not_before: Option<OffsetDateTime>,
        not_after: Option<OffsetDateTime>,
        passphrase: &str,
        request_id: Option<&str>,
    ) -> Result<(IssuedCertificate, IssuedCertificateProperties)> {
        let issuer = self.unlocked()?.to_issued()?;
        let algorithm = request
            .signature_algorithm
            .unwrap_or_else(|| self.settings.signature_algorithm());

        // Work on a copy so a rejected request leaves the counter alone
        let mut settings = self.settings.clone();
        let serial = settings.get_and_increment_serial();
        let issued = sign_certificate_request(
            &issuer,
            Some(request),
            not_before,
            not_after,
            &serial,
            algorithm,
        )?;
        settings.write(&self.storage.settings_path())?;
        self.settings = settings;

        let alias = common_name(issued.certificate.subject_name());
        let bundle = encode_pkcs12(&issued, alias.as_deref(), Pkcs12Cipher::Aes256Cbc, passphrase)?;
        let mut props =
            IssuedCertificateProperties::from_certificate(&issued.certificate, issued.private_key.is_some())?;
        props.request_id = request_id.map(str::to_string);
        self.storage
            .store_artifact(Collection::Issued, &props.id, &bundle, &toml::to_string(&props)?)?;

        info!(
            id = %self.id(),
            serial = %props.id,
            subject = props.subject.as_deref().unwrap_or_default(),
            "issued certificate"
        );
        insert_sorted(&mut self.issued, props.clone());
        Ok((issued, props))
    }

    /// Moves issued certificate `id` to the revoked collection. `None`
    /// defaults to now and [`RevocationReason::Unspecified`].
    pub fn revoke_certificate(
        &mut self,
        id: &str,
        revocation_date: Option<OffsetDateTime>,
        reason: Option<RevocationReason>,
    ) -> Result<()> {
        if self.revoked.iter().any(|p| p.id == id) {
            return Err(CaError::invalid(format!("certificate {id} is already revoked")));
        }
        let position = self
            .issued
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| CaError::not_found(format!("issued certificate {id}")))?;

        let mut props = self.issued[position].clone();
        props.revocation_date = Some(revocation_date.unwrap_or_else(OffsetDateTime::now_utc));
        props.revocation_reason = Some(reason.unwrap_or_default());
        self.storage.move_artifact(
            Collection::Issued,
            Collection::Revoked,
            id,
            &toml::to_string(&props)?,
        )?;

        self.issued.remove(position);
        let reason = props.revocation_reason.unwrap_or_default();
        insert_sorted(&mut self.revoked, props);
        info!(id = %self.id(), serial = id, reason = %reason, "revoked certificate");
        self.log_activity(&format!("revoked {id} ({reason})"));
        self.emit(&[
            CaEvent::IssuedChanged(self.issued.clone()),
            CaEvent::RevokedChanged(self.revoked.clone()),
        ])
    }

    /// Issues a CRL over every revoked certificate. `None` sets the next
    /// update to now.
    pub fn create_crl(&mut self, next_update: Option<OffsetDateTime>) -> Result<X509Crl> {
        let store = self.unlocked()?;
        let key = store.private_key()?;
        let now = OffsetDateTime::now_utc();

        let mut entries = Vec::with_capacity(self.revoked.len());
        for props in &self.revoked {
            let serial = props
                .serial()
                .ok_or_else(|| CaError::io(format!("revoked entry {} has no serial id", props.id)))?;
            entries.push(RevokedEntry {
                serial,
                revocation_date: props.revocation_date.unwrap_or(now),
                reason: props.revocation_reason.unwrap_or_default(),
            });
        }

        let mut settings = self.settings.clone();
        let number = settings.get_and_increment_crl_serial();
        let crl = build_crl(
            store.certificate(),
            &key,
            settings.signature_algorithm(),
            &number,
            now,
            next_update.unwrap_or(now),
            &entries,
        )?;
        settings.write(&self.storage.settings_path())?;
        self.settings = settings;

        let props = CrlProperties::from_crl(&crl)?;
        self.storage
            .store_artifact(Collection::Crls, &props.id, crl.to_der(), &toml::to_string(&props)?)?;
        info!(id = %self.id(), number = %number, entries = entries.len(), "created CRL");
        self.log_activity(&format!("created CRL {}", props.id));
        insert_sorted(&mut self.crls, props);
        self.emit(&[CaEvent::CrlsChanged(self.crls.clone())])?;
        Ok(crl)
    }

    // ---- requests ---------------------------------------------------------

    /// Imports a PKCS#10 request from a PEM or DER file.
    pub fn add_certificate_signing_request(
        &mut self,
        path: &Path,
    ) -> Result<CertificateRequestProperties> {
        let data = std::fs::read(path).map_err(|e| CaError::IoFailure {
            message: format!("failed to read request {}", path.display()),
            source: Some(e),
        })?;
        self.add_certificate_signing_request_bytes(&data)
    }

    pub fn add_certificate_signing_request_bytes(
        &mut self,
        data: &[u8],
    ) -> Result<CertificateRequestProperties> {
        let request = decode_certificate_request(data)?;
        let props = CertificateRequestProperties::from_request(Uuid::new_v4().to_string(), &request)?;
        self.storage.store_artifact(
            Collection::Requests,
            &props.id,
            &encode_certificate_request(&request, Encoding::Pem)?,
            &toml::to_string(&props)?,
        )?;
        debug!(request = %props.id, subject = props.subject.as_deref().unwrap_or_default(), "stored request");
        self.log_activity(&format!("imported request {}", props.id));
        insert_sorted(&mut self.requests, props.clone());
        self.emit(&[CaEvent::RequestsChanged(self.requests.clone())])?;
        Ok(props)
    }

    pub fn remove_certificate_signing_request(&mut self, id: &str) -> Result<()> {
        let position = self
            .requests
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| CaError::not_found(format!("certificate request {id}")))?;
        self.storage.remove_artifact(Collection::Requests, id)?;
        self.requests.remove(position);
        self.log_activity(&format!("removed request {id}"));
        self.emit(&[CaEvent::RequestsChanged(self.requests.clone())])
    }

    /// Links pending request `request_id` to issued certificate
    /// `issued_id` and drops the request from the pending list.
    pub fn move_certificate_signing_request(&mut self, request_id: &str, issued_id: &str) -> Result<()> {
        let request_position = self
            .requests
            .iter()
            .position(|r| r.id == request_id)
            .ok_or_else(|| CaError::not_found(format!("certificate request {request_id}")))?;
        let issued_position = self
            .issued
            .iter()
            .position(|p| p.id == issued_id)
            .ok_or_else(|| CaError::not_found(format!("issued certificate {issued_id}")))?;

        let mut props = self.issued[issued_position].clone();
        props.request_id = Some(request_id.to_string());
        self.storage
            .write_properties(Collection::Issued, issued_id, &toml::to_string(&props)?)?;
        self.storage.remove_artifact(Collection::Requests, request_id)?;

        self.issued[issued_position] = props;
        self.requests.remove(request_position);
        self.log_activity(&format!("linked request {request_id} to {issued_id}"));
        self.emit(&[
            CaEvent::RequestsChanged(self.requests.clone()),
            CaEvent::IssuedChanged(self.issued.clone()),
        ])
    }

    // ---- templates --------------------------------------------------------

    pub fn add_template(&mut self, template: CertificateKeyPairTemplate) -> Result<()> {
        if self.templates.iter().any(|t| t.id == template.id) {
            return Err(CaError::invalid(format!(
                "template {} already exists",
                template.id
            )));
        }
        self.storage.store_document(
            Collection::Templates,
            &template.id.to_string(),
            &template.to_toml()?,
        )?;
        self.log_activity(&format!("added template {}", template.name));
        self.templates.push(template);
        sort_templates(&mut self.templates);
        self.emit(&[CaEvent::TemplatesChanged(self.templates.clone())])
    }

    pub fn remove_certificate_template(&mut self, id: Uuid) -> Result<()> {
        let position = self
            .templates
            .iter()
            .position(|t| t.id == id)
            .ok_or_else(|| CaError::not_found(format!("template {id}")))?;
        self.storage
            .remove_artifact(Collection::Templates, &id.to_string())?;
        let removed = self.templates.remove(position);
        self.log_activity(&format!("removed template {}", removed.name));
        self.emit(&[CaEvent::TemplatesChanged(self.templates.clone())])
    }

    // ---- loaders ----------------------------------------------------------

    /// Opens the stored bundle of an issued or revoked certificate.
    pub fn load_issued_certificate(&self, id: &str, passphrase: &str) -> Result<IssuedCertificate> {
        let collection = if self.issued.iter().any(|p| p.id == id) {
            Collection::Issued
        } else if self.revoked.iter().any(|p| p.id == id) {
            Collection::Revoked
        } else {
            return Err(CaError::not_found(format!("certificate {id}")));
        };
        decode_pkcs12(&self.storage.read_artifact(collection, id)?, passphrase)
    }

    pub fn load_certificate_request(&self, id: &str) -> Result<X509Req> {
        if !self.requests.iter().any(|r| r.id == id) {
            return Err(CaError::not_found(format!("certificate request {id}")));
        }
        decode_certificate_request(&self.storage.read_artifact(Collection::Requests, id)?)
    }

    pub fn load_crl(&self, id: &str) -> Result<X509Crl> {
        if !self.crls.iter().any(|c| c.id == id) {
            return Err(CaError::not_found(format!("CRL {id}")));
        }
        X509Crl::decode(&self.storage.read_artifact(Collection::Crls, id)?)
    }

    // ---- settings ---------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.settings.id()
    }

    pub fn base_path(&self) -> &Path {
        self.storage.base()
    }

    pub fn settings(&self) -> &CertificateAuthoritySettings {
        &self.settings
    }

    /// Description, or the id when the description is empty.
    pub fn display_name(&self) -> String {
        match self.settings.description() {
            "" => self.id().to_string(),
            description => description.to_string(),
        }
    }

    pub fn description(&self) -> &str {
        self.settings.description()
    }

    pub fn set_description(&mut self, description: &str) -> Result<()> {
        let old = self.settings.description().to_string();
        if old == description {
            return Ok(());
        }
        self.update_settings(|s| {
            s.set_description(description);
            Ok(())
        })?;
        self.log_activity(&format!("description set to '{description}'"));
        self.emit(&[CaEvent::DescriptionChanged {
            old,
            new: description.to_string(),
        }])
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.settings.signature_algorithm()
    }

    pub fn set_signature_algorithm(&mut self, algorithm: SignatureAlgorithm) -> Result<()> {
        let old = self.settings.signature_algorithm();
        if old == algorithm {
            return Ok(());
        }
        if let Some(store) = self.key_store.as_ref() {
            let public_key = store.certificate().public_key()?;
            algorithm.check_compatible(&public_key)?;
        }
        self.update_settings(|s| {
            s.set_signature_algorithm(algorithm);
            Ok(())
        })?;
        self.log_activity(&format!("signature algorithm set to {algorithm}"));
        self.emit(&[CaEvent::SignatureAlgorithmChanged {
            old,
            new: algorithm,
        }])
    }

    pub fn expiry_days(&self) -> i64 {
        self.settings.expiry_days()
    }

    pub fn set_expiry_days(&mut self, days: i64) -> Result<()> {
        let old = self.settings.expiry_days();
        if old == days {
            return Ok(());
        }
        self.update_settings(|s| s.set_expiry_days(days))?;
        self.log_activity(&format!("expiry set to {days} days"));
        self.emit(&[CaEvent::ExpiryDaysChanged { old, new: days }])
    }

    pub fn incremental_serial(&self) -> bool {
        self.settings.incremental_serial()
    }

    pub fn set_incremental_serial(&mut self, incremental: bool) -> Result<()> {
        let old = self.settings.incremental_serial();
        if old == incremental {
            return Ok(());
        }
        self.update_settings(|s| {
            s.set_incremental_serial(incremental);
            Ok(())
        })?;
        self.log_activity(&format!("incremental serials set to {incremental}"));
        self.emit(&[CaEvent::IncrementalSerialChanged {
            old,
            new: incremental,
        }])
    }

    pub fn enable_log(&self) -> bool {
        self.settings.enable_log()
    }

    pub fn set_enable_log(&mut self, enable: bool) -> Result<()> {
        let old = self.settings.enable_log();
        if old == enable {
            return Ok(());
        }
        self.update_settings(|s| {
            s.set_enable_log(enable);
            Ok(())
        })?;
        self.log_activity("activity log enabled");
        self.emit(&[CaEvent::EnableLogChanged { old, new: enable }])
    }

    /// Serial the next signed certificate would get.
    pub fn next_serial_number(&self) -> BigUint {
        self.settings.serial()
    }

    pub fn next_crl_serial_number(&self) -> BigUint {
        self.settings.crl_serial()
    }

    fn update_settings(
        &mut self,
        change: impl FnOnce(&mut CertificateAuthoritySettings) -> Result<()>,
    ) -> Result<()> {
        let mut settings = self.settings.clone();
        change(&mut settings)?;
        settings.write(&self.storage.settings_path())?;
        self.settings = settings;
        Ok(())
    }

    // ---- collections ------------------------------------------------------

    pub fn requests(&self) -> &[CertificateRequestProperties] {
        &self.requests
    }

    pub fn issued(&self) -> &[IssuedCertificateProperties] {
        &self.issued
    }

    pub fn revoked(&self) -> &[IssuedCertificateProperties] {
        &self.revoked
    }

    pub fn crls(&self) -> &[CrlProperties] {
        &self.crls
    }

    pub fn templates(&self) -> &[CertificateKeyPairTemplate] {
        &self.templates
    }

    // ---- notifications ----------------------------------------------------

    pub fn subscribe(&self, listener: Listener) -> SubscriptionHandle {
        self.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.events.unsubscribe(handle)
    }

    fn emit(&self, events: &[CaEvent]) -> Result<()> {
        self.events.emit(events)
    }

    fn log_activity(&self, message: &str) {
        if !self.settings.enable_log() {
            return;
        }
        let timestamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        if let Err(e) = self.storage.append_activity(&format!("{timestamp} {message}")) {
            warn!(id = %self.id(), error = %e, "failed to append to activity log");
        }
    }
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("id", &self.id())
            .field("base", &self.storage.base())
            .field("locked", &self.is_locked())
            .field("issued", &self.issued.len())
            .field("revoked", &self.revoked.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use openssl::hash::MessageDigest;
    use openssl::x509::X509ReqBuilder;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use time::Duration;

    use crate::certificate_factory::{certificate_serial, generate_self_signed_certificate};
    use crate::certificate_request::parse_name;
    use crate::events::CaProperty;
    use crate::key_pair_factory::{generate_key_pair, KeyType};
    use crate::pkcs7_codec::decode_certificate_chain;
    use crate::pkcs8_codec::{decode_private_key, private_keys_equal};
    use crate::properties::serial_stem;

    const PASSPHRASE: &str = "ca secret";

    fn root_bundle(key_type: KeyType) -> IssuedCertificate {
        let key = generate_key_pair(key_type).unwrap();
        let now = OffsetDateTime::now_utc();
        let cert = generate_self_signed_certificate(
            "CN=Test Root CA,O=Example",
            now - Duration::minutes(1),
            now + Duration::days(1),
            &key,
            None,
            true,
            None,
        )
        .unwrap();
        IssuedCertificate::new(cert.clone(), Some(key), vec![cert])
    }

    fn create_ca(dir: &TempDir, key_type: KeyType) -> CertificateAuthority {
        CertificateAuthority::create(dir.path(), root_bundle(key_type), PASSPHRASE, "Test CA").unwrap()
    }

    fn unlocked_ca(dir: &TempDir) -> CertificateAuthority {
        let mut ca = create_ca(dir, KeyType::EcP256);
        ca.unlock(PASSPHRASE).unwrap();
        ca
    }

    fn validity() -> (Option<OffsetDateTime>, Option<OffsetDateTime>) {
        let now = OffsetDateTime::now_utc();
        (Some(now + Duration::seconds(10)), Some(now + Duration::seconds(360)))
    }

    fn leaf_request(cn: &str) -> CertificateRequest {
        CertificateRequest::new()
            .subject(format!("CN={cn}"))
            .key_type(KeyType::EcP256)
    }

    fn sign_leaf(ca: &mut CertificateAuthority, cn: &str) -> IssuedCertificate {
        let (nb, na) = validity();
        ca.sign_and_store_certificate_request(&leaf_request(cn), nb, na, "leaf secret")
            .unwrap()
    }

    fn foreign_csr(cn: &str) -> Vec<u8> {
        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let mut builder = X509ReqBuilder::new().unwrap();
        builder
            .set_subject_name(&parse_name(&format!("CN={cn}")).unwrap())
            .unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        builder.build().to_pem().unwrap()
    }

    #[test]
    fn test_p521_issue_revoke_and_publish() {
        let dir = TempDir::new().unwrap();
        let mut ca = create_ca(&dir, KeyType::EcP521);
        ca.unlock(PASSPHRASE).unwrap();

        let now = OffsetDateTime::now_utc();
        let request = CertificateRequest::new()
            .subject("CN=MySubjectCert")
            .key_type(KeyType::EcP521);
        let expected_serial = ca.next_serial_number();
        let issued = ca
            .sign_and_store_certificate_request(
                &request,
                Some(now + Duration::seconds(10)),
                Some(now + Duration::seconds(360)),
                "leaf secret",
            )
            .unwrap();
        assert!(issued.private_key.is_some());
        assert_eq!(issued.chain.len(), 2);
        assert_eq!(certificate_serial(&issued.certificate).unwrap(), expected_serial);
        assert_eq!(ca.next_serial_number(), expected_serial + 1u32);
        assert_eq!(ca.issued().len(), 1);

        let id = ca.issued()[0].id.clone();
        ca.revoke_certificate(&id, None, Some(RevocationReason::CaCompromise))
            .unwrap();
        assert!(ca.issued().is_empty());
        assert_eq!(ca.revoked().len(), 1);

        let crl = ca.create_crl(Some(now + Duration::seconds(3600))).unwrap();
        assert!(crl.verify(&ca.key_pair().unwrap()).unwrap());
        let entries = crl.revoked().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, RevocationReason::CaCompromise);
        assert_eq!(entries[0].serial, certificate_serial(&issued.certificate).unwrap());

        let from_pem = X509Crl::decode(&crl.encode(Encoding::Pem)).unwrap();
        let from_der = X509Crl::decode(&crl.encode(Encoding::Der)).unwrap();
        assert_eq!(from_pem, crl);
        assert_eq!(from_der, crl);
        assert_eq!(ca.load_crl(&ca.crls()[0].id).unwrap(), crl);
    }

    #[test]
    fn test_locked_ca_rejects_key_operations_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let mut ca = create_ca(&dir, KeyType::EcP256);
        assert!(ca.is_locked());

        let (nb, na) = validity();
        assert!(matches!(
            ca.sign_and_store_certificate_request(&leaf_request("leaf"), nb, na, "x"),
            Err(CaError::LockedDatastore)
        ));
        assert!(matches!(ca.create_crl(None), Err(CaError::LockedDatastore)));
        assert!(matches!(ca.certificate(), Err(CaError::LockedDatastore)));
        assert!(matches!(ca.key_pair(), Err(CaError::LockedDatastore)));
        assert!(matches!(ca.certificate_chain(), Err(CaError::LockedDatastore)));
        assert!(matches!(
            ca.export_private_key(Encoding::Pem, Pkcs8Cipher::None, None),
            Err(CaError::LockedDatastore)
        ));
        assert!(matches!(
            ca.export_public_key(Encoding::Der),
            Err(CaError::LockedDatastore)
        ));
        assert!(matches!(
            ca.export_certificate(Encoding::Pem),
            Err(CaError::LockedDatastore)
        ));
        assert!(matches!(
            ca.export_pkcs12(Pkcs12Cipher::Aes256Cbc, "x", None),
            Err(CaError::LockedDatastore)
        ));

        assert!(ca.issued().is_empty());
        assert!(ca.crls().is_empty());
        assert_eq!(ca.next_serial_number(), BigUint::from(1u32));
        assert_eq!(ca.next_crl_serial_number(), BigUint::from(1u32));
        assert!(ca.storage.list_stems(Collection::Issued).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_passphrase_keeps_ca_locked() {
        let dir = TempDir::new().unwrap();
        let mut ca = create_ca(&dir, KeyType::EcP256);
        assert!(matches!(ca.unlock("nope"), Err(CaError::InvalidPassword)));
        assert!(ca.is_locked());
        ca.unlock(PASSPHRASE).unwrap();
        assert!(!ca.is_locked());
        ca.lock().unwrap();
        assert!(ca.is_locked());
    }

    #[test]
    fn test_serials_strictly_increase() {
        let dir = TempDir::new().unwrap();
        let mut ca = unlocked_ca(&dir);
        let serials: Vec<BigUint> = (1..=3)
            .map(|n| certificate_serial(&sign_leaf(&mut ca, &format!("leaf {n}")).certificate).unwrap())
            .collect();
        assert_eq!(
            serials,
            vec![BigUint::from(1u32), BigUint::from(2u32), BigUint::from(3u32)]
        );
        let mut ids: Vec<String> = ca.issued().iter().map(|p| p.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, serials.iter().map(serial_stem).collect::<Vec<_>>());

        ca.set_incremental_serial(false).unwrap();
        let timestamped = certificate_serial(&sign_leaf(&mut ca, "leaf 4").certificate).unwrap();
        assert!(timestamped > serials[2]);
    }

    #[test]
    fn test_rejected_request_does_not_consume_a_serial() {
        let dir = TempDir::new().unwrap();
        let mut ca = unlocked_ca(&dir);
        let (nb, na) = validity();
        let err = ca
            .sign_and_store_certificate_request(&CertificateRequest::new(), nb, na, "x")
            .unwrap_err();
        assert!(matches!(err, CaError::InvalidArgument(_)));
        assert_eq!(ca.next_serial_number(), BigUint::from(1u32));
    }

    #[test]
    fn test_double_revoke_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut ca = unlocked_ca(&dir);
        sign_leaf(&mut ca, "first");
        sign_leaf(&mut ca, "second");
        let ids: Vec<String> = ca.issued().iter().map(|p| p.id.clone()).collect();

        ca.revoke_certificate(&ids[0], None, None).unwrap();
        assert_eq!(ca.revoked().len(), 1);
        assert_eq!(
            ca.revoked()[0].revocation_reason,
            Some(RevocationReason::Unspecified)
        );
        assert!(matches!(
            ca.revoke_certificate(&ids[0], None, None),
            Err(CaError::InvalidArgument(_))
        ));
        assert!(matches!(
            ca.revoke_certificate("ffffffffffffffff", None, None),
            Err(CaError::NotFound(_))
        ));

        ca.revoke_certificate(&ids[1], None, Some(RevocationReason::KeyCompromise))
            .unwrap();
        assert_eq!(ca.revoked().len(), 2);
        assert!(ca.issued().is_empty());
    }

    #[test]
    fn test_create_and_open_round_trip() {
        let dir = TempDir::new().unwrap();
        let (id, template_id) = {
            let mut ca = unlocked_ca(&dir);
            sign_leaf(&mut ca, "leaf");
            let template = CertificateKeyPairTemplate::new("server", "CN=server", KeyType::EcP256);
            let template_id = template.id;
            ca.add_template(template).unwrap();
            ca.add_certificate_signing_request_bytes(&foreign_csr("pending"))
                .unwrap();
            (ca.id(), template_id)
        };

        let ca = CertificateAuthority::open(dir.path()).unwrap();
        assert!(ca.is_locked());
        assert_eq!(ca.id(), id);
        assert_eq!(ca.description(), "Test CA");
        assert_eq!(ca.next_serial_number(), BigUint::from(2u32));
        assert_eq!(ca.issued().len(), 1);
        assert_eq!(ca.requests().len(), 1);
        assert_eq!(ca.templates()[0].id, template_id);

        assert!(
            CertificateAuthority::create(dir.path(), root_bundle(KeyType::EcP256), "x", "again")
                .unwrap_err()
                .is_io_failure()
        );
    }

    #[test]
    fn test_create_validates_the_root_bundle() {
        let dir = TempDir::new().unwrap();
        let mut wrong_key = root_bundle(KeyType::EcP256);
        wrong_key.private_key = Some(generate_key_pair(KeyType::EcP256).unwrap());
        assert!(CertificateAuthority::create(dir.path(), wrong_key, "x", "")
            .unwrap_err()
            .is_io_failure());

        let mut no_chain = root_bundle(KeyType::EcP256);
        no_chain.chain.clear();
        assert!(CertificateAuthority::create(dir.path(), no_chain, "x", "")
            .unwrap_err()
            .is_io_failure());

        let key = generate_key_pair(KeyType::EcP256).unwrap();
        let now = OffsetDateTime::now_utc();
        let leaf = generate_self_signed_certificate(
            "CN=not a ca",
            now,
            now + Duration::days(1),
            &key,
            None,
            false,
            None,
        )
        .unwrap();
        let not_ca = IssuedCertificate::new(leaf.clone(), Some(key), vec![leaf]);
        assert!(CertificateAuthority::create(dir.path(), not_ca, "x", "")
            .unwrap_err()
            .is_io_failure());
        assert!(!dir.path().join("ca-settings.toml").exists());
    }

    #[test]
    fn test_open_raises_stale_serial_counters() {
        let dir = TempDir::new().unwrap();
        {
            let mut ca = unlocked_ca(&dir);
            sign_leaf(&mut ca, "one");
            sign_leaf(&mut ca, "two");
            ca.create_crl(None).unwrap();
        }
        let settings_path = dir.path().join("ca-settings.toml");
        let text = std::fs::read_to_string(&settings_path).unwrap();
        let stale = text
            .replace("\nserial = \"3\"", "\nserial = \"1\"")
            .replace("crl_serial = \"2\"", "crl_serial = \"1\"");
        assert_ne!(stale, text);
        std::fs::write(&settings_path, stale).unwrap();

        let ca = CertificateAuthority::open(dir.path()).unwrap();
        assert_eq!(ca.next_serial_number(), BigUint::from(3u32));
        assert_eq!(ca.next_crl_serial_number(), BigUint::from(2u32));
        let persisted = CertificateAuthoritySettings::read(&settings_path).unwrap();
        assert_eq!(persisted.serial_counter(), &BigUint::from(3u32));
    }

    #[test]
    fn test_pending_request_flow() {
        let dir = TempDir::new().unwrap();
        let mut ca = unlocked_ca(&dir);
        let props = ca
            .add_certificate_signing_request_bytes(&foreign_csr("device"))
            .unwrap();
        assert_eq!(props.subject.as_deref(), Some("CN=device"));

        let (nb, na) = validity();
        let issued = ca.sign_pending_request(&props.id, nb, na, "bundle").unwrap();
        assert!(issued.private_key.is_none());
        assert!(ca.requests().is_empty());
        let entry = &ca.issued()[0];
        assert_eq!(entry.request_id.as_deref(), Some(props.id.as_str()));
        assert!(!entry.has_private_key);

        let loaded = ca.load_issued_certificate(&entry.id, "bundle").unwrap();
        assert!(loaded.private_key.is_none());
        assert_eq!(
            loaded.certificate.to_der().unwrap(),
            issued.certificate.to_der().unwrap()
        );
        let exported = ca
            .export_issued_pkcs12(&entry.id, "bundle", Pkcs12Cipher::Aes128Cbc, "new", None)
            .unwrap();
        let reopened = decode_pkcs12(&exported, "new").unwrap();
        assert_eq!(reopened.chain.len(), 2);
        assert!(matches!(
            ca.load_issued_certificate(&entry.id, "wrong"),
            Err(CaError::InvalidPassword)
        ));
        assert!(matches!(
            ca.remove_certificate_signing_request(&props.id),
            Err(CaError::NotFound(_))
        ));
    }

    #[test]
    fn test_move_request_links_issued_entry() {
        let dir = TempDir::new().unwrap();
        let mut ca = unlocked_ca(&dir);
        let request = ca
            .add_certificate_signing_request_bytes(&foreign_csr("linked"))
            .unwrap();
        sign_leaf(&mut ca, "linked");
        let issued_id = ca.issued()[0].id.clone();

        assert!(matches!(
            ca.move_certificate_signing_request("unknown", &issued_id),
            Err(CaError::NotFound(_))
        ));
        ca.move_certificate_signing_request(&request.id, &issued_id)
            .unwrap();
        assert!(ca.requests().is_empty());
        assert_eq!(ca.issued()[0].request_id.as_deref(), Some(request.id.as_str()));

        let reopened = CertificateAuthority::open(dir.path()).unwrap();
        assert_eq!(
            reopened.issued()[0].request_id.as_deref(),
            Some(request.id.as_str())
        );
    }

    #[test]
    fn test_exports() {
        let dir = TempDir::new().unwrap();
        let ca = unlocked_ca(&dir);

        let chain = decode_certificate_chain(&ca.export_certificate_chain(Encoding::Pem).unwrap()).unwrap();
        assert_eq!(chain.len(), 1);

        let key = ca.key_pair().unwrap();
        let pem = ca
            .export_private_key(Encoding::Pem, Pkcs8Cipher::Aes256Cbc, Some("pw"))
            .unwrap();
        assert!(private_keys_equal(&key, &decode_private_key(&pem, Some("pw")).unwrap()).unwrap());

        let p12 = ca
            .export_pkcs12(Pkcs12Cipher::Des3, "pw", Some(KEYSTORE_ALIAS))
            .unwrap();
        let back = decode_pkcs12(&p12, "pw").unwrap();
        assert!(private_keys_equal(&key, back.private_key.as_ref().unwrap()).unwrap());
        assert_eq!(
            back.certificate.to_der().unwrap(),
            ca.certificate().unwrap().to_der().unwrap()
        );
    }

    #[test]
    fn test_templates_add_and_remove() {
        let dir = TempDir::new().unwrap();
        let mut ca = create_ca(&dir, KeyType::EcP256);
        let template = CertificateKeyPairTemplate::new("client", "CN=client", KeyType::EcP384);
        let id = template.id;
        ca.add_template(template.clone()).unwrap();
        assert!(matches!(
            ca.add_template(template),
            Err(CaError::InvalidArgument(_))
        ));
        ca.remove_certificate_template(id).unwrap();
        assert!(ca.templates().is_empty());
        assert!(matches!(
            ca.remove_certificate_template(id),
            Err(CaError::NotFound(_))
        ));
    }

    #[test]
    fn test_events_and_listener_errors() {
        let dir = TempDir::new().unwrap();
        let mut ca = create_ca(&dir, KeyType::EcP256);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        ca.subscribe(Arc::new(move |event: &CaEvent| {
            sink.lock().push(event.clone());
            Ok(())
        }));

        ca.unlock(PASSPHRASE).unwrap();
        ca.unlock(PASSPHRASE).unwrap();
        ca.set_expiry_days(90).unwrap();
        ca.set_expiry_days(90).unwrap();
        assert!(matches!(
            ca.set_expiry_days(0),
            Err(CaError::InvalidArgument(_))
        ));
        {
            let seen = seen.lock();
            assert_eq!(seen.len(), 2);
            assert_eq!(seen[0], CaEvent::LockChanged { old: true, new: false });
            assert_eq!(seen[1], CaEvent::ExpiryDaysChanged { old: 365, new: 90 });
        }

        let handle = ca.subscribe(Arc::new(|_: &CaEvent| Err("listener down".into())));
        assert!(matches!(
            ca.set_description("Renamed"),
            Err(CaError::Listener(_))
        ));
        assert_eq!(ca.description(), "Renamed");
        assert!(ca.unsubscribe(handle));
        assert_eq!(
            seen.lock().last().map(CaEvent::property),
            Some(CaProperty::Description)
        );

        let reopened = CertificateAuthority::open(dir.path()).unwrap();
        assert_eq!(reopened.display_name(), "Renamed");
        assert_eq!(reopened.expiry_days(), 90);
    }

    #[test]
    fn test_activity_log_follows_flag() {
        let dir = TempDir::new().unwrap();
        let mut ca = unlocked_ca(&dir);
        sign_leaf(&mut ca, "quiet");
        assert!(!dir.path().join("activity.log").exists());

        ca.set_enable_log(true).unwrap();
        sign_leaf(&mut ca, "logged");
        let log = std::fs::read_to_string(dir.path().join("activity.log")).unwrap();
        assert!(log.contains("CN=logged"));
    }
}
