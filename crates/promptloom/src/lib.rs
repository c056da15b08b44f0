//! # Promptloom
//!
//! A prompt-composition engine for chat-style model requests. Authors
//! declare a tree of prompt pieces; the engine distributes a token budget
//! across it, renders elements against their share, prunes the lowest
//! priority content until everything fits, and emits an ordered list of
//! chat messages.
//!
//! - **Budget distribution**: siblings are budgeted in flex groups with
//!   proportional weights, reservations for later groups, and token-limit
//!   caps; growable elements re-render against the surplus.
//! - **Prioritized pruning**: the lowest-priority leaf goes first, with
//!   atomic chunks, keep-with groups, transparent containers, and content
//!   pinned behind cache checkpoints.
//! - **Pluggable counting**: the engine consumes a two-operation tokenizer
//!   port and never tokenizes text itself.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use promptloom::{Endpoint, Node, PromptRenderer};
//! use promptloom::protocol::HeuristicTokenizer;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let renderer = PromptRenderer::new(
//!         Endpoint::new(1024),
//!         Arc::new(HeuristicTokenizer::new()),
//!     );
//!
//!     let tree = Node::fragment(vec![
//!         Node::system_message(vec![Node::text("You are a careful assistant.")]),
//!         Node::user_message(vec![
//!             Node::text_chunk("Older context that may be dropped.", 1),
//!             Node::text_chunk("The actual question.", 100),
//!         ]),
//!     ]);
//!
//!     let result = renderer.render(tree).await?;
//!     println!("{} messages, {} tokens", result.messages.len(), result.token_count);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// Re-export commonly used types
pub use element::{DEFAULT_PRIORITY, Element, FlexReserve, Props, State};
pub use error::{Error, Result};
pub use json::{JSON_ELEMENT_VERSION, JsonElement, JsonNode, JsonTokenLimit};
pub use materialize::LineBreakBefore;
pub use meta::{Metadata, Reference, UsedContext};
pub use node::{
    ContainerKind, ContainerNode, ElementNode, ImageNode, Intrinsic, KeepWithGroup, MessageNode,
    Node, TextChunkNode,
};
pub use render::{Progress, ProgressUpdate, PromptRenderer, RenderOptions, RenderResult};
pub use sizing::{Endpoint, Sizing};

// Module declarations
pub mod element;
mod emit;
pub mod error;
pub mod json;
mod materialize;
pub mod meta;
pub mod node;
mod prune;
mod scheduler;
pub mod render;
pub mod sizing;
mod tree;

/// The message shapes and tokenizer port consumed by the engine.
pub use promptloom_protocol as protocol;

// Re-export key dependencies for convenience
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

/// Prelude module for common imports
///
/// # Examples
///
/// ```rust
/// use promptloom::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Element, Endpoint, Error, FlexReserve, Node, Props, PromptRenderer, RenderOptions,
        RenderResult, Result, Sizing, State,
        protocol::{ContentPart, RawMessage, Role, Tokenizer},
    };
}

/// Engine version, taken from the crate manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod property_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }
}
