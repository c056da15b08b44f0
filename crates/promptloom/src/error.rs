//! Error types for the composition engine
//!
//! One error enum covers the whole render pipeline, following Rust idioms
//! with the `thiserror` crate. Structural errors are contract violations in
//! the authored tree and abort the render before any message list exists;
//! budget over-use is not an error (the pruner resolves it).

use promptloom_protocol::TokenizerError;
use thiserror::Error;

/// Result type alias for operations that can fail with an engine error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the composition engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Text or image content appeared outside of a chat message.
    #[error("text content is only allowed inside a chat message")]
    TextOutsideMessage,

    /// A chat message was nested inside another chat message.
    #[error("a chat message cannot be nested inside another chat message")]
    NestedMessage,

    /// A text chunk contained a child that is neither a literal nor an intrinsic.
    #[error("text chunk children must be literals or intrinsics")]
    InvalidTextChunkChild,

    /// Two global metadata records used the same key.
    #[error("duplicate metadata key: {0}")]
    DuplicateMetadataKey(String),

    /// Two token-limit scopes declared the same id.
    #[error("duplicate token limit id: {0}")]
    DuplicateTokenLimitId(String),

    /// An assistant tool call carried arguments that are not valid JSON.
    #[error("invalid tool call arguments for '{name}'")]
    InvalidToolCallArguments {
        /// Name of the function whose arguments failed to parse
        name: String,
        /// The underlying parse failure
        #[source]
        source: serde_json::Error,
    },

    /// Pruning was still required but no node was eligible for removal.
    #[error("no lowest priority node left to remove")]
    NoRemovableNode,

    /// A serialized element document declared an unsupported version.
    #[error("unsupported serialized element version: {0}")]
    UnsupportedVersion(u32),

    /// A tokenizer operation failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The render was cancelled.
    #[error("render cancelled")]
    Cancelled,

    /// Other errors not covered by specific variants.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error is a structural violation of the authored tree.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::TextOutsideMessage
                | Error::NestedMessage
                | Error::InvalidTextChunkChild
                | Error::DuplicateMetadataKey(_)
                | Error::DuplicateTokenLimitId(_)
                | Error::InvalidToolCallArguments { .. }
                | Error::NoRemovableNode
        )
    }

    /// Whether this error resulted from a cancellation request.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Tokenizer(TokenizerError::Cancelled)
        )
    }
}
