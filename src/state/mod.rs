//! Per-sequence inference state: extraction, injection and persistence.
//!
//! - [`shape`]: K/V cache dimensions and element types
//! - [`context`]: traits the inference runtime implements, plus a mock
//!   runtime behind the `mock` feature
//! - [`extractor`]: prefill-and-snapshot / restore driver
//! - [`blob`]: extracted state and its on-disk envelope

pub mod blob;
pub mod context;
pub mod extractor;
pub mod shape;

pub use blob::{EnvelopeError, StateBlob};
pub use context::{Batch, ContextProvider, ExecutionContext, ModelDims, Token, Tokenized};
pub use extractor::{
    Extraction, ExtractionProgress, ExtractionTimings, Injection, SequencePhase, StateError,
    StateExtractor,
};
pub use shape::{KvCacheShape, KvDataType};
