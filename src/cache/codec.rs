//! Encoding pipeline for stored records.
//!
//! ```text
//! value ─► JSON ─► bytes ─► compress ─► hex string   (write)
//! value ◄─ JSON ◄─ text  ◄─ decompress ◄─ bytes ◄─ hex (read)
//! ```
//!
//! The compression and text encoding stages are pluggable through [`Codec`];
//! [`DeflateCodec`] (zlib via `flate2`, UTF-8 text) is the default. Hex
//! rendering is fixed: two lowercase digits per byte.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{OrgCheckError, Result};

/// Compression and text encoding stages of the pipeline.
pub trait Codec: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;
    fn encode(&self, text: &str) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<String>;
}

/// zlib compression with UTF-8 text.
#[derive(Debug, Clone, Copy)]
pub struct DeflateCodec {
    level: Compression,
}

impl DeflateCodec {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    /// Compression level, 0 (none) to 9 (best).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for DeflateCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for DeflateCodec {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(bytes.len() / 2), self.level);
        encoder
            .write_all(bytes)
            .map_err(|e| OrgCheckError::Storage(format!("deflate failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| OrgCheckError::Storage(format!("deflate finalize failed: {e}")))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(bytes.len() * 4);
        ZlibDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| OrgCheckError::CacheCorruption(format!("inflate failed: {e}")))?;
        Ok(out)
    }

    fn encode(&self, text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| OrgCheckError::CacheCorruption(format!("invalid UTF-8: {e}")))
    }
}

/// Run a record through the write pipeline.
///
/// Failures carry the length reached at every stage.
pub(crate) fn encode_record<T: Serialize>(codec: &dyn Codec, record: &T) -> Result<String> {
    let json = serde_json::to_string(record).map_err(|e| OrgCheckError::Serialization {
        stage: "json",
        json_len: 0,
        bytes_len: 0,
        compressed_len: 0,
        reason: e.to_string(),
    })?;
    let bytes = codec.encode(&json);
    let compressed = codec
        .compress(&bytes)
        .map_err(|e| OrgCheckError::Serialization {
            stage: "compress",
            json_len: json.len(),
            bytes_len: bytes.len(),
            compressed_len: 0,
            reason: e.to_string(),
        })?;
    Ok(hex::encode(compressed))
}

/// Run a stored string through the read pipeline.
pub(crate) fn decode_record<T: DeserializeOwned>(codec: &dyn Codec, stored: &str) -> Result<T> {
    let compressed = hex::decode(stored)
        .map_err(|e| OrgCheckError::CacheCorruption(format!("invalid hex: {e}")))?;
    let bytes = codec.decompress(&compressed)?;
    let text = codec.decode(&bytes)?;
    serde_json::from_str(&text)
        .map_err(|e| OrgCheckError::CacheCorruption(format!("invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    struct BrokenCodec;

    impl Codec for BrokenCodec {
        fn compress(&self, _bytes: &[u8]) -> Result<Vec<u8>> {
            Err(OrgCheckError::Storage("out of memory".into()))
        }
        fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
            Ok(bytes.to_vec())
        }
        fn encode(&self, text: &str) -> Vec<u8> {
            text.as_bytes().to_vec()
        }
        fn decode(&self, bytes: &[u8]) -> Result<String> {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    #[test]
    fn stored_form_is_lowercase_hex() {
        let stored = encode_record(&DeflateCodec::new(), &json!({"a": 1})).unwrap();
        assert_eq!(stored.len() % 2, 0);
        assert!(stored.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn pipeline_restores_value() {
        let codec = DeflateCodec::with_level(9);
        let value = json!({"name": "Account", "fields": ["Id", "Name"], "count": 3});
        let stored = encode_record(&codec, &value).unwrap();
        let back: Value = decode_record(&codec, &stored).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn compress_failure_reports_stage_lengths() {
        let err = encode_record(&BrokenCodec, &json!([1, 2, 3])).unwrap_err();
        match err {
            OrgCheckError::Serialization {
                stage,
                json_len,
                bytes_len,
                ..
            } => {
                assert_eq!(stage, "compress");
                assert_eq!(json_len, 7);
                assert_eq!(bytes_len, 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn garbage_reads_as_corruption() {
        let codec = DeflateCodec::new();
        let err = decode_record::<Value>(&codec, "zz").unwrap_err();
        assert!(matches!(err, OrgCheckError::CacheCorruption(_)));
        let err = decode_record::<Value>(&codec, "00ff").unwrap_err();
        assert!(matches!(err, OrgCheckError::CacheCorruption(_)));
    }
}
