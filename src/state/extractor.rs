//! Inference-state extraction and injection.
//!
//! Extraction tokenizes content, prefills it through the model's execution
//! context in batches, and snapshots the sequence's serialized state into a
//! [`StateBlob`]. Injection writes a blob back into a cleared sequence slot
//! so generation can resume without recomputing the prefix.
//!
//! Per (model, sequence) the extractor tracks a [`SequencePhase`]:
//! `Empty → Prefilling → Ready → Extracted`, and `Injecting → Ready` for
//! restores. Any failure leaves the sequence cleared and `Empty`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ExtractionConfig;
use crate::error::{Classify, ErrorKind};
use crate::state::blob::StateBlob;
use crate::state::context::{
    Batch, ContextProvider, ExecutionContext, ModelDims, Token, Tokenized,
};
use crate::state::shape::{KvCacheShape, KvDataType};

/// Shared handle to one model's execution context.
pub type SharedContext = Arc<Mutex<Box<dyn ExecutionContext>>>;

fn shape_of(dims: ModelDims, tokens: u32) -> KvCacheShape {
    KvCacheShape {
        num_layers: dims.n_layer,
        num_heads: dims.n_head,
        head_dim: dims.n_embd.checked_div(dims.n_head).unwrap_or(0),
        sequence_length: tokens,
        dtype: KvDataType::Fp16,
    }
}

fn checked_token_count(len: usize) -> Result<u32, StateError> {
    u32::try_from(len).map_err(|_| StateError::TooManyTokens(len))
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Empty content")]
    EmptyContent,

    #[error("Empty state blob")]
    EmptyBlob,

    #[error("Batch size must be at least 1")]
    InvalidBatchSize,

    #[error("Tokenization of {chars} bytes for model {model} produced no tokens")]
    NoTokens { model: String, chars: usize },

    #[error("Tokenizer for model {model} still needs {required} slots after resizing")]
    TokenizeFailed { model: String, required: usize },

    #[error("{0} tokens exceed the per-sequence limit of {max}", max = u32::MAX)]
    TooManyTokens(usize),

    #[error("No execution context available for model {0}")]
    NoContext(String),

    #[error("Decode failed at token {position} of {total} (status {status})")]
    Decode {
        position: usize,
        total: usize,
        status: i32,
    },

    #[error("Runtime reported zero state size for sequence {0}")]
    ZeroStateSize(i32),

    #[error("{operation} moved {actual} bytes, expected {expected}")]
    SizeMismatch {
        operation: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Extraction cancelled after {processed} of {total} tokens")]
    Cancelled { processed: usize, total: usize },
}

impl Classify for StateError {
    fn kind(&self) -> ErrorKind {
        match self {
            StateError::EmptyContent
            | StateError::EmptyBlob
            | StateError::InvalidBatchSize
            | StateError::TooManyTokens(_) => ErrorKind::InvalidInput,
            StateError::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            StateError::NoTokens { .. }
            | StateError::TokenizeFailed { .. }
            | StateError::NoContext(_)
            | StateError::Decode { .. }
            | StateError::ZeroStateSize(_)
            | StateError::Cancelled { .. } => ErrorKind::ExternalContextFailure,
        }
    }
}

/// Where a sequence slot is in its extract/inject lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencePhase {
    Empty,
    Prefilling,
    Ready,
    Extracted,
    Injecting,
}

/// Wall time spent in each extraction step.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExtractionTimings {
    pub tokenize: Duration,
    pub prefill: Duration,
    pub extract: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub blob: StateBlob,
    pub timings: ExtractionTimings,
}

/// Progress snapshot passed to extraction callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractionProgress {
    pub tokens_processed: usize,
    pub total_tokens: usize,
    pub elapsed: Duration,
}

/// A sequence restored from a blob, ready for further generation.
pub struct Injection {
    pub model: String,
    pub sequence_id: i32,
    pub tokens_restored: u32,
    pub elapsed: Duration,
    context: SharedContext,
}

impl Injection {
    /// The context holding the restored sequence.
    pub fn context(&self) -> &SharedContext {
        &self.context
    }
}

impl std::fmt::Debug for Injection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injection")
            .field("model", &self.model)
            .field("sequence_id", &self.sequence_id)
            .field("tokens_restored", &self.tokens_restored)
            .field("elapsed", &self.elapsed)
            .finish_non_exhaustive()
    }
}

/// Extracts and restores per-sequence inference state.
pub struct StateExtractor {
    provider: Arc<dyn ContextProvider>,
    contexts: Mutex<HashMap<String, SharedContext>>,
    phases: Mutex<HashMap<(String, i32), SequencePhase>>,
}

impl StateExtractor {
    pub fn new(provider: Arc<dyn ContextProvider>) -> Self {
        Self {
            provider,
            contexts: Mutex::new(HashMap::new()),
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// The cached context for `model`, created through the provider on first use.
    pub fn context(&self, model: &str) -> Result<SharedContext, StateError> {
        let mut contexts = self.contexts.lock();
        if let Some(ctx) = contexts.get(model) {
            return Ok(Arc::clone(ctx));
        }
        let ctx = self
            .provider
            .create_context(model)
            .ok_or_else(|| StateError::NoContext(model.to_string()))?;
        let ctx = Arc::new(Mutex::new(ctx));
        contexts.insert(model.to_string(), Arc::clone(&ctx));
        info!(model, "Created execution context");
        Ok(ctx)
    }

    /// Drop cached contexts for one model, or all of them.
    pub fn clear_context_cache(&self, model: Option<&str>) {
        let mut contexts = self.contexts.lock();
        let mut phases = self.phases.lock();
        match model {
            Some(model) => {
                contexts.remove(model);
                phases.retain(|(m, _), _| m != model);
            }
            None => {
                contexts.clear();
                phases.clear();
            }
        }
    }

    pub fn cached_contexts(&self) -> usize {
        self.contexts.lock().len()
    }

    pub fn supports_extraction(&self, model: &str) -> bool {
        self.context(model).is_ok()
    }

    pub fn sequence_state(&self, model: &str, sequence_id: i32) -> SequencePhase {
        self.phases
            .lock()
            .get(&(model.to_string(), sequence_id))
            .copied()
            .unwrap_or(SequencePhase::Empty)
    }

    fn set_phase(&self, model: &str, sequence_id: i32, phase: SequencePhase) {
        let mut phases = self.phases.lock();
        if phase == SequencePhase::Empty {
            phases.remove(&(model.to_string(), sequence_id));
        } else {
            phases.insert((model.to_string(), sequence_id), phase);
        }
    }

    /// Shape of `model`'s attention cache with `sequence_length` 0.
    pub fn kv_shape(&self, model: &str) -> Result<KvCacheShape, StateError> {
        let ctx = self.context(model)?;
        let dims = ctx.lock().model_dims();
        Ok(shape_of(dims, 0))
    }

    /// Tokenize `text` with the model's vocabulary.
    ///
    /// Starts from an estimate of `len / 2 + 128` slots and retries once at
    /// exactly the reported size if that was too small.
    pub fn tokenize(&self, model: &str, text: &str, add_bos: bool) -> Result<Vec<Token>, StateError> {
        let ctx = self.context(model)?;
        let mut ctx = ctx.lock();
        Self::tokenize_with(ctx.as_mut(), model, text, add_bos)
    }

    fn tokenize_with(
        ctx: &mut dyn ExecutionContext,
        model: &str,
        text: &str,
        add_bos: bool,
    ) -> Result<Vec<Token>, StateError> {
        let mut tokens = vec![0; text.len() / 2 + 128];
        let mut outcome = ctx.tokenize(text, &mut tokens, add_bos);
        if let Tokenized::NeedCapacity(required) = outcome {
            debug!(model, estimate = tokens.len(), required, "Token buffer undersized, retrying");
            tokens.resize(required, 0);
            outcome = ctx.tokenize(text, &mut tokens, add_bos);
        }
        match outcome {
            Tokenized::Written(n) if n > 0 => {
                tokens.truncate(n);
                Ok(tokens)
            }
            Tokenized::NeedCapacity(required) => Err(StateError::TokenizeFailed {
                model: model.to_string(),
                required,
            }),
            Tokenized::Written(_) => Err(StateError::NoTokens {
                model: model.to_string(),
                chars: text.len(),
            }),
        }
    }

    /// Prefill `content` into a sequence and snapshot its state.
    pub fn extract(
        &self,
        model: &str,
        content: &str,
        config: &ExtractionConfig,
    ) -> Result<Extraction, StateError> {
        self.extract_with_progress(model, content, config, |_| {})
    }

    /// [`StateExtractor::extract`] reporting progress after tokenization and
    /// after every prefill batch.
    pub fn extract_with_progress<F>(
        &self,
        model: &str,
        content: &str,
        config: &ExtractionConfig,
        mut progress: F,
    ) -> Result<Extraction, StateError>
    where
        F: FnMut(ExtractionProgress),
    {
        if content.is_empty() {
            return Err(StateError::EmptyContent);
        }
        let start = Instant::now();
        let ctx = self.context(model)?;
        let mut guard = ctx.lock();

        let tokens = Self::tokenize_with(guard.as_mut(), model, content, config.add_bos)?;
        let tokenize = start.elapsed();
        progress(ExtractionProgress {
            tokens_processed: 0,
            total_tokens: tokens.len(),
            elapsed: tokenize,
        });

        let mut extraction =
            self.run_extraction(guard.as_mut(), model, &tokens, config, start, &mut progress)?;
        extraction.timings.tokenize = tokenize;
        Ok(extraction)
    }

    /// Prefill an existing token sequence and snapshot its state.
    pub fn extract_from_tokens(
        &self,
        model: &str,
        tokens: &[Token],
        config: &ExtractionConfig,
    ) -> Result<Extraction, StateError> {
        if tokens.is_empty() {
            return Err(StateError::NoTokens {
                model: model.to_string(),
                chars: 0,
            });
        }
        let start = Instant::now();
        let ctx = self.context(model)?;
        let mut guard = ctx.lock();
        self.run_extraction(
            guard.as_mut(),
            model,
            tokens,
            config,
            start,
            &mut |_: ExtractionProgress| {},
        )
    }

    fn run_extraction(
        &self,
        ctx: &mut dyn ExecutionContext,
        model: &str,
        tokens: &[Token],
        config: &ExtractionConfig,
        start: Instant,
        progress: &mut dyn FnMut(ExtractionProgress),
    ) -> Result<Extraction, StateError> {
        if config.batch_size == 0 {
            return Err(StateError::InvalidBatchSize);
        }
        let token_count = checked_token_count(tokens.len())?;
        let seq = config.sequence_id;

        ctx.clear_sequence(seq);
        self.set_phase(model, seq, SequencePhase::Prefilling);

        let prefill_start = Instant::now();
        if let Err(err) = Self::prefill(ctx, model, tokens, config, start, progress) {
            ctx.clear_sequence(seq);
            self.set_phase(model, seq, SequencePhase::Empty);
            warn!(model, sequence_id = seq, error = %err, "Prefill failed");
            return Err(err);
        }
        let prefill = prefill_start.elapsed();
        self.set_phase(model, seq, SequencePhase::Ready);

        let extract_start = Instant::now();
        let data = match Self::snapshot(ctx, seq) {
            Ok(data) => data,
            Err(err) => {
                ctx.clear_sequence(seq);
                self.set_phase(model, seq, SequencePhase::Empty);
                return Err(err);
            }
        };
        let state_size = data.len();
        let extract = extract_start.elapsed();

        let shape = shape_of(ctx.model_dims(), token_count);
        self.set_phase(model, seq, SequencePhase::Extracted);

        let timings = ExtractionTimings {
            tokenize: Duration::ZERO,
            prefill,
            extract,
            total: start.elapsed(),
        };
        info!(
            model,
            sequence_id = seq,
            tokens = token_count,
            state_bytes = state_size,
            prefill_ms = prefill.as_secs_f64() * 1000.0,
            total_ms = timings.total.as_secs_f64() * 1000.0,
            "State extracted"
        );

        Ok(Extraction {
            blob: StateBlob::new(model, seq, token_count, shape, data),
            timings,
        })
    }

    fn snapshot(ctx: &mut dyn ExecutionContext, seq: i32) -> Result<Vec<u8>, StateError> {
        let state_size = ctx.state_size(seq);
        if state_size == 0 {
            return Err(StateError::ZeroStateSize(seq));
        }
        let mut data = vec![0u8; state_size];
        let copied = ctx.copy_state(seq, &mut data);
        if copied != state_size {
            return Err(StateError::SizeMismatch {
                operation: "state extraction",
                expected: state_size,
                actual: copied,
            });
        }
        Ok(data)
    }

    fn prefill(
        ctx: &mut dyn ExecutionContext,
        model: &str,
        tokens: &[Token],
        config: &ExtractionConfig,
        start: Instant,
        progress: &mut dyn FnMut(ExtractionProgress),
    ) -> Result<(), StateError> {
        let total = tokens.len();
        let mut processed = 0;
        let mut next_log = config.progress_interval_tokens;

        for chunk in tokens.chunks(config.batch_size) {
            if let Some(cancel) = &config.cancel {
                if cancel.is_cancelled() {
                    return Err(StateError::Cancelled { processed, total });
                }
            }

            let final_batch = processed + chunk.len() == total;
            let batch = Batch::new(chunk, processed, config.sequence_id, final_batch);
            ctx.decode(&batch).map_err(|status| StateError::Decode {
                position: processed,
                total,
                status,
            })?;
            processed += chunk.len();

            progress(ExtractionProgress {
                tokens_processed: processed,
                total_tokens: total,
                elapsed: start.elapsed(),
            });
            if next_log > 0 && processed >= next_log {
                info!(model, processed, total, "Prefill progress");
                next_log = (processed / config.progress_interval_tokens + 1)
                    * config.progress_interval_tokens;
            }
        }
        Ok(())
    }

    /// Restore `blob` into `sequence_id` of `model`'s context.
    pub fn inject(
        &self,
        model: &str,
        blob: &StateBlob,
        sequence_id: i32,
    ) -> Result<Injection, StateError> {
        if blob.is_empty() {
            return Err(StateError::EmptyBlob);
        }
        let start = Instant::now();
        let ctx = self.context(model)?;
        {
            let mut guard = ctx.lock();
            guard.clear_sequence(sequence_id);
            self.set_phase(model, sequence_id, SequencePhase::Injecting);

            let consumed = guard.restore_state(sequence_id, &blob.data);
            if consumed != blob.len() {
                guard.clear_sequence(sequence_id);
                self.set_phase(model, sequence_id, SequencePhase::Empty);
                return Err(StateError::SizeMismatch {
                    operation: "state injection",
                    expected: blob.len(),
                    actual: consumed,
                });
            }
            self.set_phase(model, sequence_id, SequencePhase::Ready);
        }

        let elapsed = start.elapsed();
        info!(
            model,
            sequence_id,
            tokens = blob.token_count,
            bytes = blob.len(),
            inject_ms = elapsed.as_secs_f64() * 1000.0,
            "State injected"
        );
        Ok(Injection {
            model: model.to_string(),
            sequence_id,
            tokens_restored: blob.token_count,
            elapsed,
            context: ctx,
        })
    }

    /// Clear one sequence, or every sequence of the model if negative.
    pub fn clear_sequence(&self, model: &str, sequence_id: i32) -> Result<(), StateError> {
        let ctx = self.context(model)?;
        ctx.lock().clear_sequence(sequence_id);
        if sequence_id < 0 {
            self.phases.lock().retain(|(m, _), _| m != model);
        } else {
            self.set_phase(model, sequence_id, SequencePhase::Empty);
        }
        debug!(model, sequence_id, "Sequence cleared");
        Ok(())
    }

    /// Serialized state size of one sequence, or the whole context if negative.
    pub fn get_state_size(&self, model: &str, sequence_id: i32) -> Result<usize, StateError> {
        let ctx = self.context(model)?;
        let size = ctx.lock().state_size(sequence_id);
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::context::mock::MockProvider;
    use tokio_util::sync::CancellationToken;

    fn extractor(provider: MockProvider) -> (StateExtractor, Arc<MockProvider>) {
        let provider = Arc::new(provider);
        (StateExtractor::new(provider.clone()), provider)
    }

    fn config(batch_size: usize) -> ExtractionConfig {
        ExtractionConfig {
            batch_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_tokenize_retries_when_estimate_too_small() {
        let (ex, _) = extractor(MockProvider::new(["m"]));
        // One token per byte exceeds len / 2 + 128 for long inputs.
        let text = "x".repeat(1000);
        let tokens = ex.tokenize("m", &text, true).unwrap();
        assert_eq!(tokens.len(), 1001);
    }

    #[test]
    fn test_tokenize_fails_when_retry_still_short() {
        let (ex, _) = extractor(MockProvider::new(["m"]).short_tokenize());
        // Estimate of 129 slots, then the reported 130, then gives up.
        let err = ex.tokenize("m", "abc", true).unwrap_err();
        assert!(matches!(
            err,
            StateError::TokenizeFailed { required: 131, .. }
        ));
        assert_eq!(err.kind(), ErrorKind::ExternalContextFailure);
    }

    #[test]
    fn test_token_count_limit() {
        assert_eq!(checked_token_count(7).unwrap(), 7);
        assert_eq!(checked_token_count(u32::MAX as usize).unwrap(), u32::MAX);
        let err = checked_token_count(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, StateError::TooManyTokens(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_extract_batches_and_logits() {
        let (ex, provider) = extractor(MockProvider::new(["m"]));
        let extraction = ex.extract("m", "abcdefghij", &config(4)).unwrap();

        let batches = provider.batches();
        assert_eq!(batches.iter().map(|b| b.len).collect::<Vec<_>>(), vec![4, 4, 3]);
        assert_eq!(batches[1].start, 4);
        let flagged: usize = batches
            .iter()
            .map(|b| b.logits.iter().filter(|l| **l).count())
            .sum();
        assert_eq!(flagged, 1);
        assert_eq!(batches[2].logits.last(), Some(&true));

        assert_eq!(extraction.blob.token_count, 11);
        assert_eq!(extraction.blob.shape.sequence_length, 11);
        assert_eq!(extraction.blob.shape.head_dim, 64);
        assert_eq!(extraction.blob.len(), ex.get_state_size("m", 0).unwrap());
        assert_eq!(ex.sequence_state("m", 0), SequencePhase::Extracted);
    }

    #[test]
    fn test_extract_clears_stale_state_first() {
        let (ex, _) = extractor(MockProvider::new(["m"]));
        let first = ex.extract("m", "long stale prefix", &config(8)).unwrap();
        let second = ex.extract("m", "ab", &config(8)).unwrap();
        assert!(second.blob.len() < first.blob.len());
        assert_eq!(second.blob.token_count, 3);
    }

    #[test]
    fn test_inject_roundtrip_into_other_sequence() {
        let (ex, _) = extractor(MockProvider::new(["m"]));
        let blob = ex.extract("m", "hello world", &config(3)).unwrap().blob;

        ex.clear_sequence("m", -1).unwrap();
        let injection = ex.inject("m", &blob, 4).unwrap();
        assert_eq!(injection.tokens_restored, blob.token_count);
        assert_eq!(ex.get_state_size("m", 4).unwrap(), blob.len());
        assert_eq!(ex.sequence_state("m", 4), SequencePhase::Ready);
        assert_eq!(injection.context().lock().state_size(4), blob.len());
    }

    #[test]
    fn test_error_kinds_are_distinct() {
        let (ex, _) = extractor(MockProvider::new(["m"]));
        assert_eq!(
            ex.extract("nope", "x", &config(2)).unwrap_err().kind(),
            ErrorKind::ExternalContextFailure
        );
        assert!(matches!(
            ex.extract("nope", "x", &config(2)),
            Err(StateError::NoContext(_))
        ));
        assert_eq!(
            ex.extract("m", "", &config(2)).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert!(matches!(
            ex.extract_from_tokens("m", &[], &config(2)),
            Err(StateError::NoTokens { .. })
        ));

        let (ex, _) = extractor(MockProvider::new(["m"]).fail_decode_at(5));
        let err = ex.extract("m", "abcdefgh", &config(2)).unwrap_err();
        assert!(matches!(err, StateError::Decode { position: 4, .. }));
        assert_eq!(ex.sequence_state("m", 0), SequencePhase::Empty);
        assert_eq!(ex.get_state_size("m", 0).unwrap(), 0);

        let (ex, _) = extractor(MockProvider::new(["m"]).short_copy());
        let err = ex.extract("m", "abc", &config(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SizeMismatch);
    }

    #[test]
    fn test_inject_size_mismatch() {
        let (ex, _) = extractor(MockProvider::new(["m"]).short_restore());
        let blob = ex.extract("m", "abc", &config(2)).unwrap().blob;
        let err = ex.inject("m", &blob, 1).unwrap_err();
        assert!(matches!(
            err,
            StateError::SizeMismatch {
                operation: "state injection",
                ..
            }
        ));
        assert_eq!(ex.sequence_state("m", 1), SequencePhase::Empty);
    }

    #[test]
    fn test_progress_and_cancellation() {
        let (ex, _) = extractor(MockProvider::new(["m"]));
        let mut seen = Vec::new();
        ex.extract_with_progress("m", "abcdefg", &config(3), |p| seen.push(p.tokens_processed))
            .unwrap();
        assert_eq!(seen, vec![0, 3, 6, 8]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = ExtractionConfig {
            batch_size: 3,
            cancel: Some(cancel),
            ..Default::default()
        };
        let err = ex.extract("m", "abcdefg", &cfg).unwrap_err();
        assert!(matches!(err, StateError::Cancelled { processed: 0, total: 8 }));
        assert_eq!(ex.sequence_state("m", 0), SequencePhase::Empty);
    }

    #[test]
    fn test_context_cache_reuse() {
        let (ex, provider) = extractor(MockProvider::new(["a", "b"]));
        assert!(ex.supports_extraction("a"));
        ex.tokenize("a", "x", false).unwrap();
        ex.kv_shape("b").unwrap();
        assert_eq!(provider.contexts_created(), 2);
        assert_eq!(ex.cached_contexts(), 2);

        ex.clear_context_cache(Some("a"));
        assert_eq!(ex.cached_contexts(), 1);
        ex.tokenize("a", "x", false).unwrap();
        assert_eq!(provider.contexts_created(), 3);

        ex.clear_context_cache(None);
        assert_eq!(ex.cached_contexts(), 0);
    }
}
