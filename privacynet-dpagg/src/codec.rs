//! Wire envelope for serialized aggregators.
//!
//! ```text
//! { "format": 1, "kind": "bounded-sum", "checksum": "<blake3 hex>", "payload": "<json>" }
//! ```
//!
//! The checksum covers the payload bytes so truncated or edited blobs are
//! rejected before any field is trusted.

use std::fmt;

use blake3::Hasher;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::{DpAggError, DpAggResult};

pub const FORMAT_VERSION: u16 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregatorKind {
    Count,
    BoundedSum,
    BoundedMean,
    BoundedQuantiles,
}

impl fmt::Display for AggregatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => write!(f, "count"),
            Self::BoundedSum => write!(f, "bounded-sum"),
            Self::BoundedMean => write!(f, "bounded-mean"),
            Self::BoundedQuantiles => write!(f, "bounded-quantiles"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    format: u16,
    kind: AggregatorKind,
    checksum: String,
    payload: String,
}

pub(crate) fn encode<T: Serialize>(kind: AggregatorKind, value: &T) -> DpAggResult<Vec<u8>> {
    let payload = serde_json::to_string(value)
        .map_err(|err| DpAggError::serialization(format!("encode {kind}: {err}")))?;
    let envelope = Envelope {
        format: FORMAT_VERSION,
        kind,
        checksum: checksum(payload.as_bytes()),
        payload,
    };
    serde_json::to_vec(&envelope)
        .map_err(|err| DpAggError::serialization(format!("encode {kind} envelope: {err}")))
}

pub(crate) fn decode<T: DeserializeOwned>(kind: AggregatorKind, bytes: &[u8]) -> DpAggResult<T> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|err| DpAggError::serialization(format!("malformed envelope: {err}")))?;
    if envelope.format != FORMAT_VERSION {
        return Err(DpAggError::serialization(format!(
            "unsupported format version {} (expected {FORMAT_VERSION})",
            envelope.format
        )));
    }
    if envelope.kind != kind {
        return Err(DpAggError::serialization(format!(
            "expected {kind}, found {}",
            envelope.kind
        )));
    }
    if checksum(envelope.payload.as_bytes()) != envelope.checksum {
        return Err(DpAggError::serialization("payload checksum mismatch"));
    }
    serde_json::from_str(&envelope.payload)
        .map_err(|err| DpAggError::serialization(format!("malformed {kind} payload: {err}")))
}

/// Kind recorded in a serialized blob, without decoding the payload.
pub fn peek_kind(bytes: &[u8]) -> DpAggResult<AggregatorKind> {
    let envelope: Envelope = serde_json::from_slice(bytes)
        .map_err(|err| DpAggError::serialization(format!("malformed envelope: {err}")))?;
    Ok(envelope.kind)
}

fn checksum(payload: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(b"privacynet/dpagg/v1");
    hasher.update(payload);
    hex::encode(hasher.finalize().as_bytes())
}
