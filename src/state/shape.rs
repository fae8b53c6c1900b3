//! Descriptive metadata for extracted attention-cache state.

use serde::{Deserialize, Serialize};

/// Element type of the K/V tensors a state describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum KvDataType {
    Fp32 = 0,
    #[default]
    Fp16 = 1,
    Bf16 = 2,
    Int8 = 3,
    /// Two values packed per byte.
    Int4 = 4,
}

impl KvDataType {
    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Fp32),
            1 => Some(Self::Fp16),
            2 => Some(Self::Bf16),
            3 => Some(Self::Int8),
            4 => Some(Self::Int4),
            _ => None,
        }
    }

    /// Bytes per stored element; `Int4` reports 1 because it is packed.
    pub fn element_size(self) -> usize {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 | Self::Bf16 => 2,
            Self::Int8 | Self::Int4 => 1,
        }
    }
}

impl std::fmt::Display for KvDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
        };
        f.write_str(name)
    }
}

/// Dimensions of one model's attention cache.
///
/// Derived from the model's hyperparameters, never parsed out of a state blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KvCacheShape {
    pub num_layers: u32,
    pub num_heads: u32,
    pub head_dim: u32,
    /// Tokens covered; 0 until an extraction fills it in.
    pub sequence_length: u32,
    pub dtype: KvDataType,
}

impl KvCacheShape {
    pub fn with_sequence_length(mut self, tokens: u32) -> Self {
        self.sequence_length = tokens;
        self
    }

    fn elements_per_tensor(&self) -> u64 {
        u64::from(self.num_heads) * u64::from(self.sequence_length) * u64::from(self.head_dim)
    }

    /// Bytes of one layer's K (or V) tensor.
    pub fn layer_tensor_size(&self) -> u64 {
        let elements = self.elements_per_tensor();
        match self.dtype {
            KvDataType::Int4 => elements.div_ceil(2),
            dtype => elements * dtype.element_size() as u64,
        }
    }

    /// Bytes of every K and V tensor across all layers.
    pub fn total_size(&self) -> u64 {
        2 * u64::from(self.num_layers) * self.layer_tensor_size()
    }

    pub fn layer_k_offset(&self, layer: u32) -> u64 {
        2 * u64::from(layer) * self.layer_tensor_size()
    }

    pub fn layer_v_offset(&self, layer: u32) -> u64 {
        (2 * u64::from(layer) + 1) * self.layer_tensor_size()
    }

    pub fn is_valid(&self) -> bool {
        self.num_layers > 0 && self.num_heads > 0 && self.head_dim > 0 && self.sequence_length > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dtype: KvDataType) -> KvCacheShape {
        KvCacheShape {
            num_layers: 2,
            num_heads: 4,
            head_dim: 8,
            sequence_length: 3,
            dtype,
        }
    }

    #[test]
    fn test_sizes() {
        let s = shape(KvDataType::Fp16);
        assert_eq!(s.layer_tensor_size(), 4 * 3 * 8 * 2);
        assert_eq!(s.total_size(), 2 * 2 * 192);
        assert_eq!(s.layer_v_offset(1), 3 * 192);
    }

    #[test]
    fn test_int4_packs_two_per_byte() {
        let mut s = shape(KvDataType::Int4);
        assert_eq!(s.layer_tensor_size(), 48);
        s.head_dim = 1;
        s.num_heads = 1;
        assert_eq!(s.layer_tensor_size(), 2); // 3 values round up
    }

    #[test]
    fn test_validity_needs_tokens() {
        let s = shape(KvDataType::Fp32).with_sequence_length(0);
        assert!(!s.is_valid());
        assert!(s.with_sequence_length(1).is_valid());
    }

    #[test]
    fn test_dtype_tags() {
        for dtype in [
            KvDataType::Fp32,
            KvDataType::Fp16,
            KvDataType::Bf16,
            KvDataType::Int8,
            KvDataType::Int4,
        ] {
            assert_eq!(KvDataType::from_tag(dtype.tag()), Some(dtype));
        }
        assert_eq!(KvDataType::from_tag(9), None);
        assert_eq!(KvDataType::Bf16.to_string(), "bf16");
    }
}
