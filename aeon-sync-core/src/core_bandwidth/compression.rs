/*
    compression.rs - Byte-level batch compression

    LZ4 (size-prepended frames) with a CRC32 of the original bytes. Falls
    back to the "none" passthrough when compression is disabled, the input
    is below the minimum size, or LZ4 would not shrink it. The level is
    recorded on each batch for the adaptive optimizer; LZ4 block mode has a
    single speed/ratio setting, so it does not change the output.
*/

use crate::errors::{SyncError, SyncResult};
use crate::metrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum CompressionAlgorithm {
    Lz4,
    None,
    /// Declared by a peer but not supported here
    Unsupported,
}

impl From<String> for CompressionAlgorithm {
    fn from(name: String) -> Self {
        match name.as_str() {
            "lz4" => CompressionAlgorithm::Lz4,
            "none" => CompressionAlgorithm::None,
            _ => CompressionAlgorithm::Unsupported,
        }
    }
}

/// A compressed payload plus the header needed to reverse it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressedBatch {
    #[serde(with = "base64_bytes")]
    pub compressed: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    /// compressed / original; 1.0 for empty input
    pub ratio: f64,
    pub algorithm: CompressionAlgorithm,
    pub level: u8,
    /// CRC32 of the original bytes
    pub checksum: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionStats {
    pub batches: u64,
    pub passthrough_batches: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl CompressionStats {
    /// Overall compressed / original, 1.0 before any input
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

pub struct CompressionEngine {
    enabled: bool,
    level: u8,
    min_size: usize,
    stats: CompressionStats,
}

impl CompressionEngine {
    pub fn new(level: u8, min_size: usize) -> Self {
        Self { enabled: true, level: level.clamp(1, 9), min_size, stats: CompressionStats::default() }
    }

    /// Engine that only ever produces passthrough batches
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::new(1, 0) }
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level.clamp(1, 9);
    }

    pub fn stats(&self) -> CompressionStats {
        self.stats
    }

    pub fn compress(&mut self, bytes: &[u8]) -> CompressedBatch {
        let checksum = crc32fast::hash(bytes);

        let compressed = if self.enabled && bytes.len() >= self.min_size && !bytes.is_empty() {
            let out = lz4_flex::compress_prepend_size(bytes);
            if out.len() < bytes.len() {
                Some(out)
            } else {
                debug!(size = bytes.len(), "LZ4 would not shrink input, sending uncompressed");
                None
            }
        } else {
            None
        };

        let (algorithm, compressed) = match compressed {
            Some(out) => (CompressionAlgorithm::Lz4, out),
            None => {
                self.stats.passthrough_batches += 1;
                (CompressionAlgorithm::None, bytes.to_vec())
            }
        };

        self.stats.batches += 1;
        self.stats.bytes_in += bytes.len() as u64;
        self.stats.bytes_out += compressed.len() as u64;
        ::metrics::counter!(metrics::COMPRESSION_BYTES_IN).increment(bytes.len() as u64);
        ::metrics::counter!(metrics::COMPRESSION_BYTES_OUT).increment(compressed.len() as u64);

        let ratio = if bytes.is_empty() { 1.0 } else { compressed.len() as f64 / bytes.len() as f64 };
        CompressedBatch {
            compressed_size: compressed.len(),
            original_size: bytes.len(),
            compressed,
            ratio,
            algorithm,
            level: self.level,
            checksum,
        }
    }

    /// Exact inverse of `compress`
    ///
    /// Rejects batches whose algorithm is unsupported, whose sizes disagree
    /// with the header, or whose checksum does not match.
    pub fn decompress(&self, batch: &CompressedBatch) -> SyncResult<Vec<u8>> {
        let bytes = match batch.algorithm {
            CompressionAlgorithm::None => batch.compressed.clone(),
            CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(&batch.compressed)
                .map_err(|e| SyncError::Serialization(format!("lz4: {}", e)))?,
            CompressionAlgorithm::Unsupported => {
                warn!("Rejecting batch with unsupported compression algorithm");
                return Err(SyncError::Protocol("unsupported compression algorithm".to_string()));
            }
        };

        if bytes.len() != batch.original_size {
            return Err(SyncError::Serialization(format!(
                "decompressed {} bytes, header declares {}",
                bytes.len(),
                batch.original_size
            )));
        }
        if crc32fast::hash(&bytes) != batch.checksum {
            return Err(SyncError::Serialization("batch checksum mismatch".to_string()));
        }
        Ok(bytes)
    }
}

impl Default for CompressionEngine {
    fn default() -> Self {
        Self::new(6, 0)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
