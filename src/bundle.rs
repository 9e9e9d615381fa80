//! Copy/paste tokens for signaling without a relay.
//!
//! A token is `ssc:` followed by base64 of the gzip-compressed JSON envelope.

use crate::error::SignalingError;
use crate::peer::types::SignalingEnvelope;
use base64::{engine::general_purpose, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

pub const TOKEN_PREFIX: &str = "ssc:";

pub fn encode_bundle(envelope: &SignalingEnvelope) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(envelope)?;
    let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
    gz.write_all(&json)
        .map_err(|err| SignalingError::Token(err.to_string()))?;
    let compressed = gz
        .finish()
        .map_err(|err| SignalingError::Token(err.to_string()))?;
    Ok(format!(
        "{TOKEN_PREFIX}{}",
        general_purpose::STANDARD.encode(compressed)
    ))
}

pub fn decode_bundle(token: &str) -> Result<SignalingEnvelope, SignalingError> {
    let encoded = token
        .trim()
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| SignalingError::Token("missing ssc: prefix".into()))?;
    let compressed = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| SignalingError::Token(err.to_string()))?;
    let mut json = Vec::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut json)
        .map_err(|err| SignalingError::Token(err.to_string()))?;
    serde_json::from_slice(&json).map_err(|err| SignalingError::Token(err.to_string()))
}
