//! Persisted configuration of one certificate authority.
//!
//! Stored as a flat TOML document (`ca-settings.toml`); serial counters are
//! lower-case hex strings so they survive any size.

use std::hash::{Hash, Hasher};
use std::path::Path;

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::One;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CaError, Result};
use crate::signature_algorithm::SignatureAlgorithm;
use crate::storage::{write_atomic, KEYSTORE_FILE};

pub const DEFAULT_EXPIRY_DAYS: i64 = 365;

mod hex_serial {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{value:x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        let digits = s.trim_start_matches("0x");
        BigUint::parse_bytes(digits.as_bytes(), 16)
            .ok_or_else(|| de::Error::custom(format!("invalid hex serial '{s}'")))
    }
}

fn one() -> BigUint {
    BigUint::one()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthoritySettings {
    id: Uuid,
    #[serde(default)]
    description: String,
    #[serde(default = "default_keystore_filename")]
    keystore_filename: String,
    signature_algorithm: SignatureAlgorithm,
    #[serde(default = "default_expiry_days")]
    expiry_days: i64,
    #[serde(default = "default_true")]
    incremental_serial: bool,
    #[serde(default)]
    enable_log: bool,
    #[serde(with = "hex_serial", default = "one")]
    serial: BigUint,
    #[serde(with = "hex_serial", default = "one")]
    crl_serial: BigUint,
}

fn default_keystore_filename() -> String {
    KEYSTORE_FILE.to_string()
}

fn default_expiry_days() -> i64 {
    DEFAULT_EXPIRY_DAYS
}

fn default_true() -> bool {
    true
}

/// Next counter value and the counter to store afterwards.
fn next_value(counter: &BigUint, incremental: bool, now_millis: u128) -> BigUint {
    if incremental {
        counter.clone()
    } else {
        counter.clone().max(BigUint::from(now_millis))
    }
}

fn now_millis() -> u128 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u128::try_from(nanos / 1_000_000).unwrap_or(0)
}

/// Applies a requested counter value: negatives clamp to 1 and the counter
/// only ever moves forward. Returns `true` when the counter changed.
fn raise_counter(counter: &mut BigUint, requested: Option<BigInt>) -> bool {
    let Some(requested) = requested else {
        return false;
    };
    let value = match requested.sign() {
        Sign::Minus | Sign::NoSign => BigUint::one(),
        Sign::Plus => requested.magnitude().clone(),
    };
    if value > *counter {
        *counter = value;
        true
    } else {
        false
    }
}

impl CertificateAuthoritySettings {
    pub fn new(id: Uuid, description: impl Into<String>, signature_algorithm: SignatureAlgorithm) -> Self {
        Self {
            id,
            description: description.into(),
            keystore_filename: default_keystore_filename(),
            signature_algorithm,
            expiry_days: DEFAULT_EXPIRY_DAYS,
            incremental_serial: true,
            enable_log: false,
            serial: BigUint::one(),
            crl_serial: BigUint::one(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| CaError::IoFailure {
            message: format!("failed to read settings {}", path.display()),
            source: Some(e),
        })?;
        let settings: Self = toml::from_str(&text)?;
        if settings.expiry_days <= 0 {
            return Err(CaError::io(format!(
                "settings {} hold a non-positive expiry",
                path.display()
            )));
        }
        Ok(settings)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = toml::to_string(self)?;
        write_atomic(path, text.as_bytes())?;
        debug!(id = %self.id, path = %path.display(), "wrote settings");
        Ok(())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn keystore_filename(&self) -> &str {
        &self.keystore_filename
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    pub fn set_signature_algorithm(&mut self, algorithm: SignatureAlgorithm) {
        self.signature_algorithm = algorithm;
    }

    pub fn expiry_days(&self) -> i64 {
        self.expiry_days
    }

    pub fn set_expiry_days(&mut self, days: i64) -> Result<()> {
        if days <= 0 {
            return Err(CaError::invalid(format!(
                "expiry must be a positive number of days, got {days}"
            )));
        }
        self.expiry_days = days;
        Ok(())
    }

    pub fn incremental_serial(&self) -> bool {
        self.incremental_serial
    }

    pub fn set_incremental_serial(&mut self, incremental: bool) {
        self.incremental_serial = incremental;
    }

    pub fn enable_log(&self) -> bool {
        self.enable_log
    }

    pub fn set_enable_log(&mut self, enable: bool) {
        self.enable_log = enable;
    }

    /// Counter value the next certificate would get, without consuming it.
    pub fn serial(&self) -> BigUint {
        next_value(&self.serial, self.incremental_serial, now_millis())
    }

    pub fn crl_serial(&self) -> BigUint {
        next_value(&self.crl_serial, self.incremental_serial, now_millis())
    }

    /// Stored counter, the lower bound of the next serial.
    pub fn serial_counter(&self) -> &BigUint {
        &self.serial
    }

    pub fn crl_serial_counter(&self) -> &BigUint {
        &self.crl_serial
    }

    /// Hands out a certificate serial and advances the counter. The caller
    /// persists the settings before using the serial.
    pub fn get_and_increment_serial(&mut self) -> BigUint {
        let value = next_value(&self.serial, self.incremental_serial, now_millis());
        self.serial = &value + 1u32;
        value
    }

    pub fn get_and_increment_crl_serial(&mut self) -> BigUint {
        let value = next_value(&self.crl_serial, self.incremental_serial, now_millis());
        self.crl_serial = &value + 1u32;
        value
    }

    pub fn set_serial(&mut self, serial: Option<BigInt>) -> bool {
        raise_counter(&mut self.serial, serial)
    }

    pub fn set_crl_serial(&mut self, serial: Option<BigInt>) -> bool {
        raise_counter(&mut self.crl_serial, serial)
    }
}

impl PartialEq for CertificateAuthoritySettings {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.keystore_filename == other.keystore_filename
            && self.description == other.description
    }
}

impl Eq for CertificateAuthoritySettings {}

impl Hash for CertificateAuthoritySettings {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.keystore_filename.hash(state);
        self.description.hash(state);
    }
}
