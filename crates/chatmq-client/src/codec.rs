//! Payload codecs.
//!
//! Two independent concerns:
//!
//! - **Serialization**: [`JsonSerializer`] turns typed values into bytes and back.
//!   `Producer::send_json` and `Message::decode_json` use it.
//! - **Compression**: a [`Compressor`] per [`CompressionType`]. The producer
//!   compresses record values through [`Codec::encode_record`] and tags the
//!   record with the [`COMPRESSION_HEADER`]; the consumer reverses it with
//!   [`Codec::decode_value`] before the callback sees the message.
//!
//! ## Small messages
//!
//! Chat payloads are often a few dozen bytes, where compression costs more than
//! it saves. With `performance.optimize_for_small_messages` on, values shorter
//! than `small_message_threshold_bytes` are sent as-is. Values whose compressed
//! form is not smaller than the original are also sent uncompressed.
//!
//! ```text
//! value ──▶ < threshold? ──yes──▶ raw
//!               │no
//!               ▼
//!           compress ──▶ smaller? ──no──▶ raw
//!                           │yes
//!                           ▼
//!              compressed + header "chatmq-compression: lz4"
//! ```

use crate::broker::Headers;
use crate::config::{CompressionType, PerformanceConfig};
use crate::error::{MqError, Result};
use crate::producer::Record;
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::Arc;

/// Header naming the codec a record value was compressed with.
pub const COMPRESSION_HEADER: &str = "chatmq-compression";

/// Header set by `send_json`.
pub const CONTENT_TYPE_HEADER: &str = "content-type";

/// Byte-level compression codec.
pub trait Compressor: Send + Sync {
    fn compression_type(&self) -> CompressionType;

    fn compress(&self, data: &[u8]) -> Result<Bytes>;

    fn decompress(&self, data: &[u8]) -> Result<Bytes>;
}

fn compress_err(codec: CompressionType, cause: impl ToString) -> MqError {
    MqError::CompressionFailed {
        codec: codec.as_str().to_string(),
        cause: cause.to_string(),
    }
}

fn decompress_err(codec: CompressionType, cause: impl ToString) -> MqError {
    MqError::DecompressionFailed {
        codec: codec.as_str().to_string(),
        cause: cause.to_string(),
    }
}

pub struct NoCompression;

impl Compressor for NoCompression {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Gzip
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .map_err(|e| compress_err(CompressionType::Gzip, e))?;
        let out = encoder
            .finish()
            .map_err(|e| compress_err(CompressionType::Gzip, e))?;
        Ok(Bytes::from(out))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| decompress_err(CompressionType::Gzip, e))?;
        Ok(Bytes::from(out))
    }
}

pub struct SnappyCompressor;

impl Compressor for SnappyCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Snappy
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        snap::raw::Encoder::new()
            .compress_vec(data)
            .map(Bytes::from)
            .map_err(|e| compress_err(CompressionType::Snappy, e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        snap::raw::Decoder::new()
            .decompress_vec(data)
            .map(Bytes::from)
            .map_err(|e| decompress_err(CompressionType::Snappy, e))
    }
}

pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        Ok(Bytes::from(lz4_flex::compress_prepend_size(data)))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        lz4_flex::decompress_size_prepended(data)
            .map(Bytes::from)
            .map_err(|e| decompress_err(CompressionType::Lz4, e))
    }
}

pub struct ZstdCompressor {
    level: i32,
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

impl Compressor for ZstdCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Zstd
    }

    fn compress(&self, data: &[u8]) -> Result<Bytes> {
        zstd::encode_all(data, self.level)
            .map(Bytes::from)
            .map_err(|e| compress_err(CompressionType::Zstd, e))
    }

    fn decompress(&self, data: &[u8]) -> Result<Bytes> {
        zstd::decode_all(data)
            .map(Bytes::from)
            .map_err(|e| decompress_err(CompressionType::Zstd, e))
    }
}

/// Compressor for a codec.
pub fn compressor_for(compression: CompressionType) -> Arc<dyn Compressor> {
    match compression {
        CompressionType::None => Arc::new(NoCompression),
        CompressionType::Gzip => Arc::new(GzipCompressor),
        CompressionType::Snappy => Arc::new(SnappyCompressor),
        CompressionType::Lz4 => Arc::new(Lz4Compressor),
        CompressionType::Zstd => Arc::new(ZstdCompressor::default()),
    }
}

/// JSON payload serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn content_type(&self) -> &'static str {
        "application/json"
    }

    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| MqError::SerializationFailed(e.to_string()))
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        serde_json::from_slice(data).map_err(|e| MqError::DeserializationFailed(e.to_string()))
    }
}

/// Producer-side compression policy plus the consumer-side inverse.
#[derive(Clone)]
pub struct Codec {
    compressor: Arc<dyn Compressor>,
    small_message_threshold: Option<usize>,
}

impl Codec {
    pub fn new(compression: CompressionType, performance: &PerformanceConfig) -> Self {
        Self {
            compressor: compressor_for(compression),
            small_message_threshold: performance
                .optimize_for_small_messages
                .then_some(performance.small_message_threshold_bytes),
        }
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compressor.compression_type()
    }

    /// Compress the record value in place when worthwhile, tagging the header.
    pub fn encode_record(&self, record: &mut Record) -> Result<()> {
        let codec = self.compressor.compression_type();
        if codec == CompressionType::None || record.headers.contains_key(COMPRESSION_HEADER) {
            return Ok(());
        }
        if let Some(threshold) = self.small_message_threshold {
            if record.value.len() < threshold {
                return Ok(());
            }
        }

        let compressed = self.compressor.compress(&record.value)?;
        if compressed.len() < record.value.len() {
            record.value = compressed;
            record.headers.insert(
                COMPRESSION_HEADER.to_string(),
                Bytes::from_static(codec.as_str().as_bytes()),
            );
        }
        Ok(())
    }

    /// Undo [`Codec::encode_record`]: decompress per the header and drop it.
    ///
    /// Works regardless of which codec this instance was built with.
    pub fn decode_value(headers: &mut Headers, value: Bytes) -> Result<Bytes> {
        let Some(tag) = headers.remove(COMPRESSION_HEADER) else {
            return Ok(value);
        };
        let name = String::from_utf8_lossy(&tag);
        let codec = CompressionType::parse(&name).ok_or_else(|| MqError::DecompressionFailed {
            codec: name.to_string(),
            cause: "unknown codec".into(),
        })?;
        compressor_for(codec).decompress(&value)
    }

    /// `compressed / original`; 0 for empty input.
    pub fn compression_ratio(&self, data: &[u8]) -> Result<f64> {
        if data.is_empty() {
            return Ok(0.0);
        }
        let compressed = self.compressor.compress(data)?;
        Ok(compressed.len() as f64 / data.len() as f64)
    }

    /// Below `threshold` never; under 1 KiB only if it saves at least 10%.
    pub fn is_compression_beneficial(&self, data: &[u8], threshold: usize) -> bool {
        if data.len() < threshold {
            return false;
        }
        if data.len() < 1024 {
            return match self.compressor.compress(data) {
                Ok(compressed) => (compressed.len() as f64 / data.len() as f64) < 0.9,
                Err(_) => false,
            };
        }
        true
    }
}
