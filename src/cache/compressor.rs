//! Self-describing compression container for cached and evicted payloads.
//!
//! Every encoded buffer starts with a fixed 16-byte [`ContainerHeader`]
//! (magic, version, codec tag, flags, original size) followed immediately by
//! the payload. Decoding fails closed: a short buffer, a wrong magic, an
//! unknown tag, or a decoded length that disagrees with the header is an
//! error, never raw data.
//!
//! Codec availability is a runtime capability ([`Compressor::is_available`]).
//! Encoding with an unavailable codec walks a fixed fallback chain
//! (LZ4-HC → LZ4 → none, zstd-fast → zstd → LZ4 → none) and logs the
//! degradation.

use std::collections::BTreeSet;
use std::io::Read;
use std::time::{Duration, Instant};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CompressionConfig;
use crate::error::{Classify, ErrorKind};

/// Magic bytes at the start of every container.
pub const CONTAINER_MAGIC: [u8; 4] = *b"HSWC";

/// Current container layout version.
pub const CONTAINER_VERSION: u8 = 1;

/// Size of [`ContainerHeader`] on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<ContainerHeader>();

/// Largest output-to-input ratio an LZ4 block can reach.
const LZ4_MAX_EXPANSION: u64 = 255;

/// Compression algorithm identifiers. The discriminant is the header tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Codec {
    /// Copy-through.
    None = 0,
    /// Fast LZ4 block compression.
    Lz4 = 1,
    /// LZ4 high-compression mode.
    Lz4Hc = 2,
    /// Zstandard at an adjustable level.
    Zstd = 3,
    /// Zstandard tuned for speed.
    ZstdFast = 4,
}

impl Codec {
    pub const ALL: [Codec; 5] = [
        Codec::None,
        Codec::Lz4,
        Codec::Lz4Hc,
        Codec::Zstd,
        Codec::ZstdFast,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }

    /// Level used when the configured level is 0.
    pub fn default_level(self) -> i32 {
        match self {
            Codec::None => 0,
            Codec::Lz4 => 1,
            Codec::Lz4Hc => 9,
            Codec::Zstd => 3,
            Codec::ZstdFast => 1,
        }
    }

    /// Next codec to try when this one is unavailable.
    pub fn fallback(self) -> Option<Codec> {
        match self {
            Codec::Lz4Hc => Some(Codec::Lz4),
            Codec::ZstdFast => Some(Codec::Zstd),
            Codec::Zstd => Some(Codec::Lz4),
            Codec::Lz4 => Some(Codec::None),
            Codec::None => None,
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Codec::None => write!(f, "none"),
            Codec::Lz4 => write!(f, "lz4"),
            Codec::Lz4Hc => write!(f, "lz4_hc"),
            Codec::Zstd => write!(f, "zstd"),
            Codec::ZstdFast => write!(f, "zstd_fast"),
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Codec::None),
            "lz4" => Ok(Codec::Lz4),
            "lz4_hc" | "lz4hc" => Ok(Codec::Lz4Hc),
            "zstd" => Ok(Codec::Zstd),
            "zstd_fast" => Ok(Codec::ZstdFast),
            other => Err(format!("unknown codec '{other}'")),
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Empty input data")]
    EmptyInput,

    #[error("Input of {size} bytes is too large for {codec}")]
    InputTooLarge { size: usize, codec: Codec },

    #[error("Container of {0} bytes is shorter than the {HEADER_LEN}-byte header")]
    Truncated(usize),

    #[error("Container magic mismatch: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported container version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown codec tag {0} in header")]
    UnknownCodec(u8),

    #[error("Codec {0} is unavailable and no fallback remains")]
    Unavailable(Codec),

    #[error("Decoded {actual} bytes but the header records {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Header records {expected} bytes, more than {codec} can produce from {payload} bytes")]
    ImplausibleSize {
        codec: Codec,
        expected: u64,
        payload: usize,
    },

    #[error("{codec} encode failed: {source}")]
    EncodeFailed {
        codec: Codec,
        #[source]
        source: std::io::Error,
    },

    #[error("{codec} decode failed: {source}")]
    DecodeFailed {
        codec: Codec,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for CodecError {
    fn kind(&self) -> ErrorKind {
        match self {
            CodecError::EmptyInput
            | CodecError::InputTooLarge { .. }
            | CodecError::EncodeFailed { .. } => ErrorKind::InvalidInput,
            CodecError::Unavailable(_) => ErrorKind::CodecUnavailable,
            CodecError::Truncated(_)
            | CodecError::BadMagic(_)
            | CodecError::UnsupportedVersion(_)
            | CodecError::UnknownCodec(_)
            | CodecError::SizeMismatch { .. }
            | CodecError::ImplausibleSize { .. }
            | CodecError::DecodeFailed { .. } => ErrorKind::CorruptContainer,
        }
    }
}

/// Fixed header preceding every payload. Multi-byte fields are little-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ContainerHeader {
    magic: [u8; 4],
    version: u8,
    codec: u8,
    flags: u16,
    original_size: u64,
}

impl ContainerHeader {
    fn new(codec: Codec, original_size: usize) -> Self {
        Self {
            magic: CONTAINER_MAGIC,
            version: CONTAINER_VERSION,
            codec: codec.tag(),
            flags: 0u16.to_le(),
            original_size: (original_size as u64).to_le(),
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn codec_tag(&self) -> u8 {
        self.codec
    }

    pub fn codec(&self) -> Option<Codec> {
        Codec::from_tag(self.codec)
    }

    pub fn flags(&self) -> u16 {
        u16::from_le(self.flags)
    }

    pub fn original_size(&self) -> u64 {
        u64::from_le(self.original_size)
    }
}

/// An encoded container plus bookkeeping about how it was produced.
#[derive(Debug, Clone)]
pub struct Compressed {
    /// Header followed by payload.
    pub data: Vec<u8>,
    /// Codec the caller asked for.
    pub requested: Codec,
    /// Codec actually used after fallback.
    pub codec: Codec,
    pub original_size: usize,
    pub elapsed: Duration,
}

impl Compressed {
    pub fn compressed_size(&self) -> usize {
        self.data.len()
    }

    /// Original size over container size.
    pub fn ratio(&self) -> f64 {
        if self.data.is_empty() {
            return 1.0;
        }
        self.original_size as f64 / self.data.len() as f64
    }

    /// Whether the fallback chain replaced the requested codec.
    pub fn degraded(&self) -> bool {
        self.requested != self.codec
    }
}

/// The compression engine.
///
/// Cheap to clone; holds only configuration and the enabled codec set.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
    enabled: BTreeSet<Codec>,
}

impl Compressor {
    /// A compressor with every codec compiled into this build enabled,
    /// minus any the configuration disables.
    pub fn new(config: CompressionConfig) -> Self {
        let enabled = Codec::ALL
            .into_iter()
            .filter(|c| !config.disabled_codecs.contains(c))
            .collect();
        Self { config, enabled }
    }

    /// A compressor restricted to exactly `codecs`.
    pub fn with_available(config: CompressionConfig, codecs: &[Codec]) -> Self {
        Self {
            config,
            enabled: codecs.iter().copied().collect(),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Whether `codec` can actually encode and decode here.
    pub fn is_available(&self, codec: Codec) -> bool {
        self.enabled.contains(&codec)
    }

    /// Codecs usable right now.
    pub fn available_codecs(&self) -> Vec<Codec> {
        self.enabled.iter().copied().collect()
    }

    /// Walk the fallback chain from `requested` to the first available codec.
    pub fn resolve(&self, requested: Codec) -> Result<Codec, CodecError> {
        let mut codec = requested;
        while !self.is_available(codec) {
            let next = codec.fallback().ok_or(CodecError::Unavailable(requested))?;
            warn!(
                requested = %requested,
                unavailable = %codec,
                fallback = %next,
                "Codec unavailable, degrading"
            );
            codec = next;
        }
        Ok(codec)
    }

    /// Encode with the configured codec and level.
    pub fn encode(&self, data: &[u8]) -> Result<Compressed, CodecError> {
        self.encode_with(data, self.config.codec, self.config.level)
    }

    /// Encode with an explicit codec and level (0 = codec default).
    pub fn encode_with(
        &self,
        data: &[u8],
        requested: Codec,
        level: i32,
    ) -> Result<Compressed, CodecError> {
        if data.is_empty() {
            return Err(CodecError::EmptyInput);
        }

        let start = Instant::now();
        let codec = self.resolve(requested)?;
        let level = if level == 0 || codec != requested {
            codec.default_level()
        } else {
            level
        };

        let mut out = Vec::with_capacity(Self::max_compressed_size(data.len(), codec));
        out.extend_from_slice(bytemuck::bytes_of(&ContainerHeader::new(codec, data.len())));

        match codec {
            Codec::None => out.extend_from_slice(data),
            Codec::Lz4 | Codec::Lz4Hc => {
                if i32::try_from(data.len()).is_err() {
                    return Err(CodecError::InputTooLarge {
                        size: data.len(),
                        codec,
                    });
                }
                let mode = match codec {
                    Codec::Lz4Hc => lz4::block::CompressionMode::HIGHCOMPRESSION(level),
                    _ => lz4::block::CompressionMode::DEFAULT,
                };
                let payload = lz4::block::compress(data, Some(mode), false)
                    .map_err(|source| CodecError::EncodeFailed { codec, source })?;
                out.extend_from_slice(&payload);
            }
            Codec::Zstd | Codec::ZstdFast => {
                let payload = zstd::encode_all(data, level)
                    .map_err(|source| CodecError::EncodeFailed { codec, source })?;
                out.extend_from_slice(&payload);
            }
        }

        let compressed = Compressed {
            data: out,
            requested,
            codec,
            original_size: data.len(),
            elapsed: start.elapsed(),
        };
        debug!(
            codec = %codec,
            original = compressed.original_size,
            compressed = compressed.compressed_size(),
            ratio = compressed.ratio(),
            "Encoded container"
        );
        Ok(compressed)
    }

    /// Decode a container produced by [`Compressor::encode`].
    pub fn decode(&self, container: &[u8]) -> Result<Vec<u8>, CodecError> {
        let header = Self::read_header(container)?;
        let codec = header
            .codec()
            .ok_or(CodecError::UnknownCodec(header.codec_tag()))?;
        if !self.is_available(codec) {
            return Err(CodecError::Unavailable(codec));
        }

        let expected = header.original_size();
        let payload = &container[HEADER_LEN..];

        let decoded = match codec {
            Codec::None => payload.to_vec(),
            Codec::Lz4 | Codec::Lz4Hc => {
                let implausible = CodecError::ImplausibleSize {
                    codec,
                    expected,
                    payload: payload.len(),
                };
                if expected > (payload.len() as u64).saturating_mul(LZ4_MAX_EXPANSION) {
                    return Err(implausible);
                }
                let size = i32::try_from(expected).map_err(|_| implausible)?;
                lz4::block::decompress(payload, Some(size))
                    .map_err(|source| CodecError::DecodeFailed { codec, source })?
            }
            Codec::Zstd | Codec::ZstdFast => {
                // Reading one byte past the header size is enough to detect a mismatch.
                let mut out = Vec::new();
                zstd::stream::read::Decoder::new(payload)
                    .and_then(|decoder| {
                        decoder
                            .take(expected.saturating_add(1))
                            .read_to_end(&mut out)
                    })
                    .map_err(|source| CodecError::DecodeFailed { codec, source })?;
                out
            }
        };

        if decoded.len() as u64 != expected {
            return Err(CodecError::SizeMismatch {
                expected,
                actual: decoded.len() as u64,
            });
        }
        Ok(decoded)
    }

    /// Validate and return the header at the start of `data`.
    pub fn read_header(data: &[u8]) -> Result<ContainerHeader, CodecError> {
        let raw = data
            .get(..HEADER_LEN)
            .ok_or(CodecError::Truncated(data.len()))?;
        let header: ContainerHeader = bytemuck::pod_read_unaligned(raw);
        if header.magic != CONTAINER_MAGIC {
            return Err(CodecError::BadMagic(header.magic));
        }
        if header.version != CONTAINER_VERSION {
            return Err(CodecError::UnsupportedVersion(header.version));
        }
        Ok(header)
    }

    /// Whether `data` starts with a valid header.
    pub fn has_header(data: &[u8]) -> bool {
        Self::read_header(data).is_ok()
    }

    /// Upper bound on the container size for `input_size` bytes.
    pub fn max_compressed_size(input_size: usize, codec: Codec) -> usize {
        let payload = match codec {
            Codec::None => input_size,
            Codec::Lz4 | Codec::Lz4Hc => input_size + input_size / 255 + 16,
            Codec::Zstd | Codec::ZstdFast => zstd::zstd_safe::compress_bound(input_size),
        };
        HEADER_LEN + payload
    }

    /// Buffering encoder that emits one container on [`StreamingCompressor::finish`].
    pub fn streaming_encoder(&self) -> StreamingCompressor {
        StreamingCompressor {
            compressor: self.clone(),
            buffer: Vec::new(),
        }
    }

    /// Buffering decoder for a container delivered in chunks.
    pub fn streaming_decoder(&self) -> StreamingDecompressor {
        StreamingDecompressor {
            compressor: self.clone(),
            buffer: Vec::new(),
        }
    }
}

/// Chunked encode interface.
///
/// Currently buffers everything and encodes once on `finish`; `feed` already
/// returns output so callers keep working if it becomes incremental.
#[derive(Debug)]
pub struct StreamingCompressor {
    compressor: Compressor,
    buffer: Vec<u8>,
}

impl StreamingCompressor {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);
        Vec::new()
    }

    pub fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        let data = std::mem::take(&mut self.buffer);
        Ok(self.compressor.encode(&data)?.data)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Chunked decode interface; see [`StreamingCompressor`].
#[derive(Debug)]
pub struct StreamingDecompressor {
    compressor: Compressor,
    buffer: Vec<u8>,
}

impl StreamingDecompressor {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);
        Vec::new()
    }

    pub fn finish(&mut self) -> Result<Vec<u8>, CodecError> {
        let data = std::mem::take(&mut self.buffer);
        self.compressor.decode(&data)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
