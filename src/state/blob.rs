//! Extracted sequence state and its persisted envelope.
//!
//! The state bytes themselves are opaque and only round-trip through the
//! runtime family that produced them. The envelope adds a fixed header so a
//! stored blob remembers which sequence it came from and how many tokens it
//! covers.

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Classify, ErrorKind};
use crate::state::shape::{KvCacheShape, KvDataType};

pub const ENVELOPE_MAGIC: [u8; 4] = *b"HSKV";
pub const ENVELOPE_VERSION: u32 = 1;
pub const ENVELOPE_HEADER_LEN: usize = std::mem::size_of::<EnvelopeHeader>();

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Envelope of {0} bytes is shorter than its header")]
    Truncated(usize),

    #[error("Envelope magic mismatch")]
    BadMagic,

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("Unknown dtype tag {0}")]
    UnknownDtype(u32),

    #[error("Envelope declares {declared} bytes after the header, found {actual}")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("Model name is not valid UTF-8")]
    ModelName(#[from] std::str::Utf8Error),
}

impl Classify for EnvelopeError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::CorruptContainer
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct EnvelopeHeader {
    magic: [u8; 4],
    version: u32,
    sequence_id: i32,
    token_count: u32,
    num_layers: u32,
    num_heads: u32,
    head_dim: u32,
    sequence_length: u32,
    dtype: u32,
    model_len: u32,
    id: [u8; 16],
    data_len: u64,
}

/// Opaque per-sequence state plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBlob {
    pub id: Uuid,
    pub model: String,
    pub sequence_id: i32,
    /// Tokens the state covers.
    pub token_count: u32,
    pub shape: KvCacheShape,
    #[serde(skip)]
    pub data: Bytes,
}

impl StateBlob {
    pub fn new(
        model: impl Into<String>,
        sequence_id: i32,
        token_count: u32,
        shape: KvCacheShape,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model: model.into(),
            sequence_id,
            token_count,
            shape,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Header, model name, then the state bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = EnvelopeHeader {
            magic: ENVELOPE_MAGIC,
            version: ENVELOPE_VERSION.to_le(),
            sequence_id: self.sequence_id.to_le(),
            token_count: self.token_count.to_le(),
            num_layers: self.shape.num_layers.to_le(),
            num_heads: self.shape.num_heads.to_le(),
            head_dim: self.shape.head_dim.to_le(),
            sequence_length: self.shape.sequence_length.to_le(),
            dtype: self.shape.dtype.tag().to_le(),
            model_len: (self.model.len() as u32).to_le(),
            id: *self.id.as_bytes(),
            data_len: (self.data.len() as u64).to_le(),
        };
        let mut out =
            Vec::with_capacity(ENVELOPE_HEADER_LEN + self.model.len() + self.data.len());
        out.extend_from_slice(bytemuck::bytes_of(&header));
        out.extend_from_slice(self.model.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, EnvelopeError> {
        let head = raw
            .get(..ENVELOPE_HEADER_LEN)
            .ok_or(EnvelopeError::Truncated(raw.len()))?;
        let header: EnvelopeHeader = bytemuck::pod_read_unaligned(head);
        if header.magic != ENVELOPE_MAGIC {
            return Err(EnvelopeError::BadMagic);
        }
        let version = u32::from_le(header.version);
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let dtype_tag = u32::from_le(header.dtype);
        let dtype = KvDataType::from_tag(dtype_tag).ok_or(EnvelopeError::UnknownDtype(dtype_tag))?;

        let model_len = u32::from_le(header.model_len) as u64;
        let data_len = u64::from_le(header.data_len);
        let body = &raw[ENVELOPE_HEADER_LEN..];
        if model_len.checked_add(data_len) != Some(body.len() as u64) {
            return Err(EnvelopeError::LengthMismatch {
                declared: model_len.saturating_add(data_len),
                actual: body.len() as u64,
            });
        }
        let (model, data) = body.split_at(model_len as usize);

        Ok(Self {
            id: Uuid::from_bytes(header.id),
            model: std::str::from_utf8(model)?.to_string(),
            sequence_id: i32::from_le(header.sequence_id),
            token_count: u32::from_le(header.token_count),
            shape: KvCacheShape {
                num_layers: u32::from_le(header.num_layers),
                num_heads: u32::from_le(header.num_heads),
                head_dim: u32::from_le(header.head_dim),
                sequence_length: u32::from_le(header.sequence_length),
                dtype,
            },
            data: Bytes::copy_from_slice(data),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob() -> StateBlob {
        let shape = KvCacheShape {
            num_layers: 2,
            num_heads: 4,
            head_dim: 64,
            sequence_length: 3,
            dtype: KvDataType::Bf16,
        };
        StateBlob::new("qwen", 5, 3, shape, vec![9u8, 8, 7, 6])
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(ENVELOPE_HEADER_LEN, 64);
    }

    #[test]
    fn test_envelope_preserves_fields() {
        let original = blob();
        let restored = StateBlob::from_bytes(&original.to_bytes()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_truncated_envelope() {
        let raw = blob().to_bytes();
        let err = StateBlob::from_bytes(&raw[..raw.len() - 1]).unwrap_err();
        assert!(matches!(err, EnvelopeError::LengthMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::CorruptContainer);
        assert!(matches!(
            StateBlob::from_bytes(&raw[..10]),
            Err(EnvelopeError::Truncated(10))
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut raw = blob().to_bytes();
        raw[0] = b'X';
        assert!(matches!(
            StateBlob::from_bytes(&raw),
            Err(EnvelopeError::BadMagic)
        ));
    }
}
