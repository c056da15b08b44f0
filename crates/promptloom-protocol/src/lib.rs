//! Shared message shapes and the tokenizer port for the promptloom engine
//!
//! This crate holds the pure-data boundary between the composition engine
//! and its collaborators: the raw chat messages a render produces, the
//! content parts those messages carry, and the two-operation tokenizer
//! interface the engine counts with.
//!
//! # Type Organization
//!
//! - **Message types**: [`message`] - Roles, raw messages, tool calls
//! - **Content types**: [`content`] - Text, images, checkpoints, opaque values
//! - **Tokenizer port**: [`tokenizer`] - Counting trait, overheads, heuristic
//!
//! # Design Principles
//!
//! - **Zero I/O**: all types are pure data structures
//! - **Serialization**: serde-based JSON throughout
//! - **No engine logic**: budget distribution and pruning live upstream

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod content;
pub mod message;
pub mod tokenizer;

// Re-export commonly used types at crate level
pub use content::{CacheType, ContentPart, ImageDetail, ImageUrl};
pub use message::{FunctionCall, RawMessage, Role, ToolCall};
pub use tokenizer::{HeuristicTokenizer, Tokenizer, TokenizerError, TokenizerOverhead};
