//! Pluggable wire-format encoding for RPC payloads.
//!
//! Payloads are JSON values encoded either as JSON text (the portable,
//! safe default) or MessagePack (compact binary). Encoded payloads above a
//! size threshold are gzip-compressed. Every encode produces a
//! [`PayloadMeta`] that travels with the bytes; the peer decodes strictly
//! from that metadata, never from local configuration, so the two ends can
//! be configured differently.
//!
//! Encode failures in the configured format degrade to the JSON default
//! with a warning rather than propagating. Decode failures are fatal:
//! silently returning wrong data would be worse than failing.

use crate::config::{settings, RpcConfig};
use crate::error::{Result, RpcError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{Read, Write};
use std::str::FromStr;
use std::time::Instant;
use tracing::warn;

/// Supported wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Json,
    MsgPack,
}

impl WireFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::MsgPack => "msgpack",
        }
    }
}

impl FromStr for WireFormat {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "msgpack" => Ok(WireFormat::MsgPack),
            other => Err(RpcError::Config {
                message: format!("Unknown serialization format: {:?}", other),
            }),
        }
    }
}

/// Metadata describing one encoded payload.
///
/// Transmitted alongside the payload bytes; the peer's decode is driven
/// entirely by this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub format: WireFormat,
    pub compressed: bool,
    /// Final payload size in bytes (after compression, if any).
    pub size: usize,
    /// Encode wall time in microseconds.
    pub encode_micros: u64,
}

/// Encoder/decoder with a configured preferred format.
#[derive(Debug, Clone)]
pub struct Serializer {
    format: WireFormat,
    compression_threshold: usize,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(WireFormat::Json, RpcConfig::COMPRESSION_THRESHOLD)
    }
}

impl Serializer {
    pub fn new(format: WireFormat, compression_threshold: usize) -> Self {
        Self {
            format,
            compression_threshold,
        }
    }

    /// Build a serializer from the process settings.
    ///
    /// An unrecognized configured format falls back to JSON with a warning.
    pub fn from_settings() -> Self {
        let cfg = &settings().serialization;
        let format = WireFormat::from_str(&cfg.format).unwrap_or_else(|e| {
            warn!("{}; defaulting to json", e);
            WireFormat::Json
        });
        Self::new(format, cfg.compression_threshold)
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a value into `(bytes, metadata)`.
    pub fn encode(&self, value: &Value) -> Result<(Vec<u8>, PayloadMeta)> {
        let started = Instant::now();

        let (mut bytes, format) = match self.format {
            WireFormat::Json => (serde_json::to_vec(value)?, WireFormat::Json),
            WireFormat::MsgPack => match rmp_serde::to_vec(value) {
                Ok(bytes) => (bytes, WireFormat::MsgPack),
                Err(e) => {
                    warn!("MessagePack encode failed ({}); falling back to json", e);
                    (serde_json::to_vec(value)?, WireFormat::Json)
                }
            },
        };

        let mut compressed = false;
        if bytes.len() > self.compression_threshold {
            bytes = gzip(&bytes)?;
            compressed = true;
        }

        let meta = PayloadMeta {
            format,
            compressed,
            size: bytes.len(),
            encode_micros: started.elapsed().as_micros() as u64,
        };
        Ok((bytes, meta))
    }

    /// Decode a payload using the metadata its producer recorded.
    pub fn decode(&self, bytes: &[u8], meta: &PayloadMeta) -> Result<Value> {
        let plain;
        let bytes = if meta.compressed {
            plain = gunzip(bytes)?;
            &plain[..]
        } else {
            bytes
        };

        match meta.format {
            WireFormat::Json => serde_json::from_slice(bytes).map_err(|e| RpcError::Decode {
                message: format!("Invalid JSON payload: {}", e),
            }),
            WireFormat::MsgPack => rmp_serde::from_slice(bytes).map_err(|e| RpcError::Decode {
                message: format!("Invalid MessagePack payload: {}", e),
            }),
        }
    }
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| RpcError::Decode {
        message: format!("Failed to decompress payload: {}", e),
    })?;
    Ok(out)
}
