//! PEM / DER handling shared by the codecs.
//!
//! Decoders never ask the caller which encoding they hold: input that starts
//! with a PEM armour line is unwrapped (and its label checked), anything else
//! is treated as DER.

use serde::{Deserialize, Serialize};

use crate::error::{CaError, Result};

/// Output encoding for exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Pem,
    Der,
}

impl std::fmt::Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pem => write!(f, "PEM"),
            Self::Der => write!(f, "DER"),
        }
    }
}

/// Returns `true` when `data` looks like PEM armoured text.
pub fn is_pem(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    data[start..].starts_with(b"-----BEGIN ")
}

/// Unwraps PEM input into DER, or passes DER through.
///
/// For PEM input the label must be one of `labels`; a different label is a
/// format mismatch and reported as an I/O failure. The matching label is
/// returned alongside the DER bytes (`None` for DER input).
pub fn to_der(data: &[u8], labels: &[&str]) -> Result<(Vec<u8>, Option<String>)> {
    if data.is_empty() {
        return Err(CaError::io("empty input"));
    }
    if !is_pem(data) {
        return Ok((data.to_vec(), None));
    }

    let block =
        pem::parse(data).map_err(|e| CaError::io(format!("failed to parse PEM: {e}")))?;
    if !labels.iter().any(|l| *l == block.tag()) {
        return Err(CaError::io(format!(
            "unexpected PEM label '{}', expected one of {:?}",
            block.tag(),
            labels
        )));
    }
    let tag = block.tag().to_string();
    Ok((block.into_contents(), Some(tag)))
}

/// Encodes DER bytes in the requested encoding.
pub fn from_der(der: Vec<u8>, label: &str, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Der => der,
        Encoding::Pem => pem::encode(&pem::Pem::new(label, der)).into_bytes(),
    }
}
