//! Tokenizer port
//!
//! The engine never tokenizes text itself; it consumes exactly two
//! operations from a [`Tokenizer`] implementation plus a handful of framing
//! constants. Both operations may suspend (a tokenizer may live behind I/O)
//! and both observe the render's cancellation token.
//!
//! The contract between the two operations: for any message, the sum of
//! [`token_length`](Tokenizer::token_length) over its parts plus the framing
//! overheads must never be below
//! [`count_message_tokens`](Tokenizer::count_message_tokens) for that
//! message. The engine relies on the sum as a cheap upper bound that shrinks
//! monotonically as parts are removed.

use crate::content::ContentPart;
use crate::message::RawMessage;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result type for tokenizer operations.
pub type Result<T> = std::result::Result<T, TokenizerError>;

/// Errors surfaced by a tokenizer implementation.
#[derive(Debug, Clone, Error)]
pub enum TokenizerError {
    /// The underlying tokenizer failed.
    #[error("tokenizer failed: {0}")]
    Failed(String),

    /// The operation observed a cancellation request.
    #[error("tokenization cancelled")]
    Cancelled,
}

/// Fixed framing costs a chat endpoint adds around counted content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerOverhead {
    /// Tokens added per message for role framing
    pub per_message: usize,

    /// Tokens added when a message carries a participant name
    pub per_name: usize,

    /// Tokens added once per completion request
    pub per_completion: usize,
}

/// Abstract token-counting boundary.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    /// Tokens in a single text or image fragment.
    async fn token_length(&self, part: &ContentPart, cancel: &CancellationToken) -> Result<usize>;

    /// Tokens of a full chat message including role and name framing.
    async fn count_message_tokens(
        &self,
        message: &RawMessage,
        cancel: &CancellationToken,
    ) -> Result<usize>;

    /// Framing constants for this tokenizer's target endpoint.
    fn overhead(&self) -> TokenizerOverhead;
}

/// Average characters per token for rough estimation
const CHARS_PER_TOKEN: usize = 4;

/// Flat per-image token estimate
const IMAGE_TOKENS: usize = 85;

/// Deterministic character-count estimator.
///
/// Counts roughly four characters per token. Fragment estimates include a
/// one-character separator allowance so that summing fragment estimates for
/// a message always dominates the joined-message count, even after the
/// emitter inserts line breaks between fragments. Intended for tests,
/// examples, and offline sizing; production callers plug in a real
/// byte-pair tokenizer behind the same trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

impl HeuristicTokenizer {
    /// Create a new estimator.
    pub fn new() -> Self {
        Self
    }

    fn fragment_estimate(part: &ContentPart) -> usize {
        match part {
            ContentPart::Text { text } => (text.len() + 1).div_ceil(CHARS_PER_TOKEN),
            ContentPart::Image { .. } => IMAGE_TOKENS,
            ContentPart::CacheCheckpoint { .. } => 0,
            ContentPart::Opaque { value } => {
                let encoded = value.to_string();
                (encoded.len() + 1).div_ceil(CHARS_PER_TOKEN)
            }
        }
    }

    fn part_count(part: &ContentPart) -> usize {
        match part {
            ContentPart::Text { text } => text.len().div_ceil(CHARS_PER_TOKEN),
            ContentPart::Image { .. } => IMAGE_TOKENS,
            ContentPart::CacheCheckpoint { .. } => 0,
            ContentPart::Opaque { value } => {
                let encoded = value.to_string();
                encoded.len().div_ceil(CHARS_PER_TOKEN)
            }
        }
    }
}

#[async_trait]
impl Tokenizer for HeuristicTokenizer {
    async fn token_length(&self, part: &ContentPart, cancel: &CancellationToken) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(TokenizerError::Cancelled);
        }
        Ok(Self::fragment_estimate(part))
    }

    async fn count_message_tokens(
        &self,
        message: &RawMessage,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(TokenizerError::Cancelled);
        }

        let overhead = self.overhead();
        let mut tokens = overhead.per_message;
        if message.name.is_some() {
            tokens += overhead.per_name;
        }
        for part in &message.content {
            tokens += Self::part_count(part);
        }
        for call in &message.tool_calls {
            tokens += (call.function.name.len() + call.function.arguments.len())
                .div_ceil(CHARS_PER_TOKEN);
        }
        Ok(tokens)
    }

    fn overhead(&self) -> TokenizerOverhead {
        TokenizerOverhead {
            per_message: 3,
            per_name: 1,
            per_completion: 3,
        }
    }
}
