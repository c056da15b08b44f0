//! Raw chat-message types
//!
//! Defines the message structure the engine emits. This is the neutral
//! shape output-format adapters consume; it is not tied to any one vendor
//! API.

use crate::content::ContentPart;
use serde::{Deserialize, Serialize};

/// The role that a chat message is attributed to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,

    /// End-user input
    User,

    /// Model output
    Assistant,

    /// Tool result, paired with a tool-call id
    Tool,

    /// Legacy function result, paired with a function name
    Function,
}

/// A single chat message produced by a render.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawMessage {
    /// The role that produced the message
    pub role: Role,

    /// Optional participant name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ordered content parts
    pub content: Vec<ContentPart>,

    /// Tool invocations requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Id of the tool call a `Role::Tool` message responds to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// A tool invocation attached to an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Unique identifier for this call
    pub id: String,

    /// Call type discriminator (always `"function"`)
    #[serde(rename = "type")]
    pub call_type: String,

    /// The function being invoked
    pub function: FunctionCall,
}

/// The function payload of a [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    /// Function name
    pub name: String,

    /// JSON-encoded arguments
    pub arguments: String,
}

impl RawMessage {
    /// Create a message with a role and content parts.
    pub fn new(role: Role, content: Vec<ContentPart>) -> Self {
        Self {
            role,
            name: None,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a system message from text.
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    /// Create a user message from text.
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    /// Create an assistant message from text.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// Set the participant name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// All text content, joined without separators.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| part.as_text())
            .collect()
    }

    /// Whether the message carries any content other than cache checkpoints.
    pub fn has_non_checkpoint_content(&self) -> bool {
        !self.tool_calls.is_empty()
            || self
                .content
                .iter()
                .any(|part| !matches!(part, ContentPart::CacheCheckpoint { .. }))
    }
}

impl ToolCall {
    /// Create a function tool call.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}
