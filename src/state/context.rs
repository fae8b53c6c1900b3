//! Seams to the external inference runtime.
//!
//! The runtime owns tokenization, decoding and the serialized per-sequence
//! state. This crate only drives it through [`ExecutionContext`] and obtains
//! one context per model from a [`ContextProvider`].

/// Vocabulary token id.
pub type Token = i32;

/// Outcome of a tokenization attempt into a caller-sized buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tokenized {
    /// This many tokens were written to the front of the buffer.
    Written(usize),
    /// The buffer was too small; this many slots are required.
    NeedCapacity(usize),
}

/// Model hyperparameters needed to describe a state's shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub n_layer: u32,
    pub n_head: u32,
    pub n_embd: u32,
}

/// One decode call: consecutive tokens of a single sequence.
#[derive(Debug, Clone)]
pub struct Batch {
    tokens: Vec<Token>,
    positions: Vec<i32>,
    sequence_id: i32,
    logits: Vec<bool>,
}

impl Batch {
    /// Tokens starting at position `start`. Only the last token requests
    /// output when `final_batch` is set.
    pub fn new(tokens: &[Token], start: usize, sequence_id: i32, final_batch: bool) -> Self {
        let positions = (start..start + tokens.len()).map(|p| p as i32).collect();
        let mut logits = vec![false; tokens.len()];
        if final_batch {
            if let Some(last) = logits.last_mut() {
                *last = true;
            }
        }
        Self {
            tokens: tokens.to_vec(),
            positions,
            sequence_id,
            logits,
        }
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn positions(&self) -> &[i32] {
        &self.positions
    }

    pub fn sequence_id(&self) -> i32 {
        self.sequence_id
    }

    /// Per-token flag: keep this token's output.
    pub fn logits(&self) -> &[bool] {
        &self.logits
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// A live inference context for one model.
///
/// `sequence_id < 0` addresses every sequence where noted.
pub trait ExecutionContext: Send {
    fn tokenize(&mut self, text: &str, out: &mut [Token], add_bos: bool) -> Tokenized;

    /// Run one batch. The error is the runtime's status code.
    fn decode(&mut self, batch: &Batch) -> Result<(), i32>;

    /// Serialized state size of one sequence, or of the whole context if negative.
    fn state_size(&self, sequence_id: i32) -> usize;

    /// Copy a sequence's state into `out`; returns bytes written.
    fn copy_state(&mut self, sequence_id: i32, out: &mut [u8]) -> usize;

    /// Restore a sequence from `data`; returns bytes consumed.
    fn restore_state(&mut self, sequence_id: i32, data: &[u8]) -> usize;

    /// Drop a sequence's cells, or every sequence if negative.
    fn clear_sequence(&mut self, sequence_id: i32);

    fn model_dims(&self) -> ModelDims;
}

/// Creates execution contexts on demand.
pub trait ContextProvider: Send + Sync {
    /// `None` if the model is not loaded or a context cannot be created.
    fn create_context(&self, model: &str) -> Option<Box<dyn ExecutionContext>>;
}

/// Deterministic in-memory runtime for tests and benchmarks.
#[cfg(any(test, feature = "mock"))]
pub mod mock {
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    const BOS: Token = 1;
    const STATE_MAGIC: &[u8; 4] = b"MOCK";

    /// What a decode call looked like, for assertions.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BatchRecord {
        pub sequence_id: i32,
        pub start: i32,
        pub len: usize,
        pub logits: Vec<bool>,
    }

    #[derive(Debug, Clone, Default)]
    struct Faults {
        decode_fails_at: Option<usize>,
        short_copy: bool,
        short_restore: bool,
        short_tokenize: bool,
    }

    /// Provider that knows a fixed set of model names.
    #[derive(Debug)]
    pub struct MockProvider {
        models: HashSet<String>,
        dims: ModelDims,
        bytes_per_token: usize,
        faults: Faults,
        created: AtomicUsize,
        batches: Arc<Mutex<Vec<BatchRecord>>>,
    }

    impl MockProvider {
        pub fn new<I, S>(models: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                models: models.into_iter().map(Into::into).collect(),
                dims: ModelDims {
                    n_layer: 4,
                    n_head: 8,
                    n_embd: 512,
                },
                bytes_per_token: 16,
                faults: Faults::default(),
                created: AtomicUsize::new(0),
                batches: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Decoding fails on the batch containing this token position.
        pub fn fail_decode_at(mut self, position: usize) -> Self {
            self.faults.decode_fails_at = Some(position);
            self
        }

        /// State copies write one byte less than the reported size.
        pub fn short_copy(mut self) -> Self {
            self.faults.short_copy = true;
            self
        }

        /// Restores consume one byte less than given.
        pub fn short_restore(mut self) -> Self {
            self.faults.short_restore = true;
            self
        }

        /// The tokenizer always asks for one slot more than it was given.
        pub fn short_tokenize(mut self) -> Self {
            self.faults.short_tokenize = true;
            self
        }

        pub fn contexts_created(&self) -> usize {
            self.created.load(Ordering::Relaxed)
        }

        /// Every decode call made through contexts from this provider.
        pub fn batches(&self) -> Vec<BatchRecord> {
            self.batches.lock().clone()
        }
    }

    impl ContextProvider for MockProvider {
        fn create_context(&self, model: &str) -> Option<Box<dyn ExecutionContext>> {
            if !self.models.contains(model) {
                return None;
            }
            self.created.fetch_add(1, Ordering::Relaxed);
            Some(Box::new(MockContext {
                dims: self.dims,
                bytes_per_token: self.bytes_per_token,
                faults: self.faults.clone(),
                sequences: BTreeMap::new(),
                batches: Arc::clone(&self.batches),
            }))
        }
    }

    /// Tokenizes one token per byte and keeps per-sequence token cells.
    ///
    /// Serialized sequence state: magic, token count (u32 LE), token ids
    /// (i32 LE), then `bytes_per_token` derived bytes per token.
    #[derive(Debug)]
    pub struct MockContext {
        dims: ModelDims,
        bytes_per_token: usize,
        faults: Faults,
        sequences: BTreeMap<i32, Vec<Token>>,
        batches: Arc<Mutex<Vec<BatchRecord>>>,
    }

    impl MockContext {
        fn encoded_len(&self, tokens: usize) -> usize {
            STATE_MAGIC.len() + 4 + tokens * (4 + self.bytes_per_token)
        }

        fn encode(&self, tokens: &[Token]) -> Vec<u8> {
            let mut out = Vec::with_capacity(self.encoded_len(tokens.len()));
            out.extend_from_slice(STATE_MAGIC);
            out.extend_from_slice(&(tokens.len() as u32).to_le_bytes());
            for t in tokens {
                out.extend_from_slice(&t.to_le_bytes());
            }
            for (i, t) in tokens.iter().enumerate() {
                out.extend((0..self.bytes_per_token).map(|j| (*t as usize + i + j) as u8));
            }
            out
        }

        fn decode_state(&self, data: &[u8]) -> Option<Vec<Token>> {
            let rest = data.strip_prefix(STATE_MAGIC.as_slice())?;
            let count = u32::from_le_bytes(rest.get(..4)?.try_into().ok()?) as usize;
            if data.len() < self.encoded_len(count) {
                return None;
            }
            let ids = rest.get(4..4 + count * 4)?;
            Some(
                ids.chunks_exact(4)
                    .map(|c| Token::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            )
        }
    }

    impl ExecutionContext for MockContext {
        fn tokenize(&mut self, text: &str, out: &mut [Token], add_bos: bool) -> Tokenized {
            if self.faults.short_tokenize {
                return Tokenized::NeedCapacity(out.len() + 1);
            }
            let mut tokens: Vec<Token> = Vec::with_capacity(text.len() + 1);
            if add_bos {
                tokens.push(BOS);
            }
            tokens.extend(text.bytes().map(|b| Token::from(b) + 2));
            if tokens.len() > out.len() {
                return Tokenized::NeedCapacity(tokens.len());
            }
            out[..tokens.len()].copy_from_slice(&tokens);
            Tokenized::Written(tokens.len())
        }

        fn decode(&mut self, batch: &Batch) -> Result<(), i32> {
            self.batches.lock().push(BatchRecord {
                sequence_id: batch.sequence_id(),
                start: batch.positions().first().copied().unwrap_or(0),
                len: batch.len(),
                logits: batch.logits().to_vec(),
            });
            if let Some(fail) = self.faults.decode_fails_at {
                if batch.positions().iter().any(|&p| p as usize == fail) {
                    return Err(-1);
                }
            }
            self.sequences
                .entry(batch.sequence_id())
                .or_default()
                .extend_from_slice(batch.tokens());
            Ok(())
        }

        fn state_size(&self, sequence_id: i32) -> usize {
            if sequence_id < 0 {
                return self
                    .sequences
                    .values()
                    .map(|t| self.encoded_len(t.len()))
                    .sum();
            }
            self.sequences
                .get(&sequence_id)
                .map_or(0, |t| self.encoded_len(t.len()))
        }

        fn copy_state(&mut self, sequence_id: i32, out: &mut [u8]) -> usize {
            let Some(tokens) = self.sequences.get(&sequence_id) else {
                return 0;
            };
            let encoded = self.encode(tokens);
            if out.len() < encoded.len() {
                return 0;
            }
            let n = if self.faults.short_copy {
                encoded.len() - 1
            } else {
                encoded.len()
            };
            out[..n].copy_from_slice(&encoded[..n]);
            n
        }

        fn restore_state(&mut self, sequence_id: i32, data: &[u8]) -> usize {
            let Some(tokens) = self.decode_state(data) else {
                return 0;
            };
            let consumed = self.encoded_len(tokens.len());
            self.sequences.insert(sequence_id, tokens);
            if self.faults.short_restore {
                consumed - 1
            } else {
                consumed
            }
        }

        fn clear_sequence(&mut self, sequence_id: i32) {
            if sequence_id < 0 {
                self.sequences.clear();
            } else {
                self.sequences.remove(&sequence_id);
            }
        }

        fn model_dims(&self) -> ModelDims {
            self.dims
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;

    #[test]
    fn test_batch_marks_only_last_of_final() {
        let batch = Batch::new(&[5, 6, 7], 10, 2, true);
        assert_eq!(batch.positions(), &[10, 11, 12]);
        assert_eq!(batch.logits(), &[false, false, true]);

        let batch = Batch::new(&[5, 6], 0, 2, false);
        assert!(batch.logits().iter().all(|l| !l));
    }

    #[test]
    fn test_mock_tokenize_reports_capacity() {
        let provider = MockProvider::new(["m"]);
        let mut ctx = provider.create_context("m").unwrap();
        let mut small = [0; 2];
        assert_eq!(
            ctx.tokenize("abcd", &mut small, true),
            Tokenized::NeedCapacity(5)
        );
        let mut big = [0; 5];
        assert_eq!(ctx.tokenize("abcd", &mut big, true), Tokenized::Written(5));
        assert!(provider.create_context("other").is_none());
    }

    #[test]
    fn test_mock_state_roundtrip() {
        let provider = MockProvider::new(["m"]);
        let mut ctx = provider.create_context("m").unwrap();
        ctx.decode(&Batch::new(&[3, 4, 5], 0, 0, true)).unwrap();

        let size = ctx.state_size(0);
        let mut buf = vec![0u8; size];
        assert_eq!(ctx.copy_state(0, &mut buf), size);

        ctx.clear_sequence(-1);
        assert_eq!(ctx.state_size(0), 0);
        assert_eq!(ctx.restore_state(7, &buf), size);
        assert_eq!(ctx.state_size(7), size);
    }
}
