//! Serialized element documents
//!
//! A subtree can be rendered to a JSON document mirroring the materialized
//! structure, shipped around, and later spliced back into another prompt
//! via the element-JSON intrinsic. On splice, every priority inside the
//! document is rebased into the fractional slot
//! `[parent_priority, parent_priority + 1)` so nothing in the splice can
//! outrank or underrank content outside of its parent's own priority.

use crate::error::{Error, Result};
use crate::materialize::{LineBreakBefore, MContainer, MaterializedNode};
use crate::meta::{Metadata, Reference, UsedContext};
use crate::tree::{
    ContainerData, ImageData, MessageData, NodeId, OpaqueData, TextData, TreeKind, TreeNode,
};
use promptloom_protocol::{CacheType, ImageDetail, Role, ToolCall};
use serde::{Deserialize, Serialize};

/// Version tag written into serialized element documents.
pub const JSON_ELEMENT_VERSION: u32 = 1;

/// A serialized element subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonElement {
    /// Document format version.
    pub version: u32,

    /// The serialized root node.
    pub node: JsonNode,
}

/// A node of a serialized element document. The shape mirrors the
/// materialized tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JsonNode {
    /// A structural container.
    Container {
        /// Pruning priority.
        priority: f64,
        /// Atomic-chunk flag.
        #[serde(default)]
        chunk: bool,
        /// Pruning transparency flag.
        #[serde(default)]
        pass_priority: bool,
        /// Token ceiling, when the container is a limit scope.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_limit: Option<JsonTokenLimit>,
        /// Keep-with group id.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        keep_with: Option<u64>,
        /// Metadata attached to the container.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        metadata: Vec<Metadata>,
        /// References attached to the container.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<Reference>,
        /// Used-context records attached to the container.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        used_context: Vec<UsedContext>,
        /// Ignored-file markers attached to the container.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ignored_files: Vec<String>,
        /// Ordered children.
        children: Vec<JsonNode>,
    },

    /// A chat message.
    Message {
        /// The message role.
        role: Role,
        /// Optional participant name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Tool invocations.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        /// Tool-call id the message responds to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_call_id: Option<String>,
        /// Pruning priority.
        priority: f64,
        /// Metadata attached to the message.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        metadata: Vec<Metadata>,
        /// References attached to the message.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<Reference>,
        /// Used-context records attached to the message.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        used_context: Vec<UsedContext>,
        /// Ignored-file markers attached to the message.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ignored_files: Vec<String>,
        /// Ordered children.
        children: Vec<JsonNode>,
    },

    /// A sized text chunk.
    Text {
        /// The text content.
        text: String,
        /// Pruning priority.
        priority: f64,
        /// Cached token length.
        tokens: usize,
        /// Line-break policy recorded at materialization.
        #[serde(default)]
        line_break_before: LineBreakBefore,
        /// Local metadata that shares the chunk's fate.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        metadata: Vec<Metadata>,
        /// References that share the chunk's fate.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        references: Vec<Reference>,
    },

    /// A sized image part.
    Image {
        /// Image URL.
        url: String,
        /// Requested fidelity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<ImageDetail>,
        /// Pruning priority.
        priority: f64,
        /// Cached token length.
        tokens: usize,
    },

    /// A cache boundary.
    CacheCheckpoint {
        /// Requested cache variant.
        cache_type: CacheType,
    },

    /// A verbatim value with its declared token cost.
    Opaque {
        /// The opaque payload.
        value: serde_json::Value,
        /// Declared token cost.
        tokens: usize,
        /// Pruning priority.
        priority: f64,
    },
}

/// Token-limit declaration on a serialized container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonTokenLimit {
    /// Scope id, unique across a render.
    pub id: String,

    /// Token ceiling enforced on the subtree.
    pub max: usize,
}

impl JsonElement {
    pub(crate) fn from_root(root: &MContainer) -> Self {
        // The synthetic render root carries the undeclared-priority
        // sentinel; serializing that would dominate the rebasing
        // denominator on splice. The wrapper is not content, so it is
        // written out at priority zero.
        let mut node = container_to_json(root);
        if let JsonNode::Container { priority, .. } = &mut node {
            *priority = 0.0;
        }
        Self {
            version: JSON_ELEMENT_VERSION,
            node,
        }
    }
}

fn container_to_json(container: &MContainer) -> JsonNode {
    JsonNode::Container {
        priority: container.priority,
        chunk: container.chunk,
        pass_priority: container.pass_priority,
        token_limit: container
            .token_limit
            .as_ref()
            .map(|(id, max)| JsonTokenLimit {
                id: id.clone(),
                max: *max,
            }),
        keep_with: container.keep_with,
        metadata: container.side.metadata.clone(),
        references: container.side.references.clone(),
        used_context: container.side.used_context.clone(),
        ignored_files: container.side.ignored_files.clone(),
        children: container.children.iter().map(node_to_json).collect(),
    }
}

pub(crate) fn node_to_json(node: &MaterializedNode) -> JsonNode {
    match node {
        MaterializedNode::Container(container) => container_to_json(container),
        MaterializedNode::Message(message) => JsonNode::Message {
            role: message.role,
            name: message.name.clone(),
            tool_calls: message.tool_calls.clone(),
            tool_call_id: message.tool_call_id.clone(),
            priority: message.priority,
            metadata: message.side.metadata.clone(),
            references: message.side.references.clone(),
            used_context: message.side.used_context.clone(),
            ignored_files: message.side.ignored_files.clone(),
            children: message.children.iter().map(node_to_json).collect(),
        },
        MaterializedNode::Text(text) => JsonNode::Text {
            text: text.text.clone(),
            priority: text.priority,
            tokens: text.tokens,
            line_break_before: text.line_break_before,
            metadata: text.metadata.clone(),
            references: text.references.clone(),
        },
        MaterializedNode::Image(image) => JsonNode::Image {
            url: image.url.clone(),
            detail: image.detail,
            priority: image.priority,
            tokens: image.tokens,
        },
        MaterializedNode::Checkpoint(checkpoint) => JsonNode::CacheCheckpoint {
            cache_type: checkpoint.cache_type,
        },
        MaterializedNode::Opaque(opaque) => JsonNode::Opaque {
            value: opaque.value.clone(),
            tokens: opaque.tokens,
            priority: opaque.priority,
        },
    }
}

/// Result of converting a serialized document back into rendered-tree form.
#[derive(Debug)]
pub(crate) struct SpliceOutcome {
    pub node: TreeNode,
    pub limit_ids: Vec<String>,
    pub tokens: usize,
}

/// Convert a serialized document into a rendered subtree, rebasing every
/// priority into the parent's fractional slot. The denominator is the
/// maximum priority found in the document plus two, which guarantees
/// `parent <= rebased < parent + 1` for every node.
pub(crate) fn splice_into_tree(
    document: &JsonElement,
    parent_priority: f64,
    index: usize,
    next_id: &dyn Fn() -> NodeId,
) -> Result<SpliceOutcome> {
    if document.version != JSON_ELEMENT_VERSION {
        return Err(Error::UnsupportedVersion(document.version));
    }

    let denominator = max_priority(&document.node).max(0.0) + 2.0;
    let rebase = |priority: f64| parent_priority + priority / denominator;

    let mut limit_ids = Vec::new();
    let mut tokens = 0usize;
    let node = convert(
        &document.node,
        index,
        &rebase,
        next_id,
        &mut limit_ids,
        &mut tokens,
    );
    Ok(SpliceOutcome {
        node,
        limit_ids,
        tokens,
    })
}

fn max_priority(node: &JsonNode) -> f64 {
    let (own, children) = match node {
        JsonNode::Container {
            priority, children, ..
        }
        | JsonNode::Message {
            priority, children, ..
        } => (*priority, children.as_slice()),
        JsonNode::Text { priority, .. }
        | JsonNode::Image { priority, .. }
        | JsonNode::Opaque { priority, .. } => (*priority, &[][..]),
        JsonNode::CacheCheckpoint { .. } => (0.0, &[][..]),
    };
    children
        .iter()
        .map(max_priority)
        .fold(own, |acc, child| acc.max(child))
}

fn convert(
    node: &JsonNode,
    index: usize,
    rebase: &dyn Fn(f64) -> f64,
    next_id: &dyn Fn() -> NodeId,
    limit_ids: &mut Vec<String>,
    tokens: &mut usize,
) -> TreeNode {
    match node {
        JsonNode::Container {
            priority,
            chunk,
            pass_priority,
            token_limit,
            keep_with,
            metadata,
            references,
            used_context,
            ignored_files,
            children,
        } => {
            if let Some(limit) = token_limit {
                limit_ids.push(limit.id.clone());
            }
            let kids = convert_children(
                metadata,
                references,
                used_context,
                ignored_files,
                children,
                rebase,
                next_id,
                limit_ids,
                tokens,
            );
            TreeNode {
                id: next_id(),
                index,
                kind: TreeKind::Container(ContainerData {
                    priority: rebase(*priority),
                    chunk: *chunk,
                    pass_priority: *pass_priority,
                    token_limit: token_limit
                        .as_ref()
                        .map(|limit| (limit.id.clone(), limit.max)),
                    keep_with: *keep_with,
                }),
                children: kids,
            }
        }
        JsonNode::Message {
            role,
            name,
            tool_calls,
            tool_call_id,
            priority,
            metadata,
            references,
            used_context,
            ignored_files,
            children,
        } => {
            let kids = convert_children(
                metadata,
                references,
                used_context,
                ignored_files,
                children,
                rebase,
                next_id,
                limit_ids,
                tokens,
            );
            TreeNode {
                id: next_id(),
                index,
                kind: TreeKind::Message(MessageData {
                    role: *role,
                    name: name.clone(),
                    tool_calls: tool_calls.clone(),
                    tool_call_id: tool_call_id.clone(),
                    priority: rebase(*priority),
                }),
                children: kids,
            }
        }
        JsonNode::Text {
            text,
            priority,
            tokens: text_tokens,
            line_break_before,
            metadata,
            references,
        } => {
            *tokens += text_tokens;
            TreeNode {
                id: next_id(),
                index,
                kind: TreeKind::Text(TextData {
                    text: text.clone(),
                    priority: rebase(*priority),
                    tokens: *text_tokens,
                    chunk_boundary: *line_break_before == LineBreakBefore::Always,
                    metadata: metadata.clone(),
                    references: references.clone(),
                }),
                children: Vec::new(),
            }
        }
        JsonNode::Image {
            url,
            detail,
            priority,
            tokens: image_tokens,
        } => {
            *tokens += image_tokens;
            TreeNode {
                id: next_id(),
                index,
                kind: TreeKind::Image(ImageData {
                    url: url.clone(),
                    detail: *detail,
                    priority: rebase(*priority),
                    tokens: *image_tokens,
                }),
                children: Vec::new(),
            }
        }
        JsonNode::CacheCheckpoint { cache_type } => TreeNode {
            id: next_id(),
            index,
            kind: TreeKind::Checkpoint(*cache_type),
            children: Vec::new(),
        },
        JsonNode::Opaque {
            value,
            tokens: opaque_tokens,
            priority,
        } => {
            *tokens += opaque_tokens;
            TreeNode {
                id: next_id(),
                index,
                kind: TreeKind::Opaque(OpaqueData {
                    value: value.clone(),
                    priority: rebase(*priority),
                    tokens: *opaque_tokens,
                }),
                children: Vec::new(),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn convert_children(
    metadata: &[Metadata],
    references: &[Reference],
    used_context: &[UsedContext],
    ignored_files: &[String],
    children: &[JsonNode],
    rebase: &dyn Fn(f64) -> f64,
    next_id: &dyn Fn() -> NodeId,
    limit_ids: &mut Vec<String>,
    tokens: &mut usize,
) -> Vec<TreeNode> {
    // Side-channel payloads become leading marker nodes so the
    // materializer re-attaches them to the converted container.
    let mut out = Vec::new();
    let mut position = 0usize;
    let mut push = |kind: TreeKind, position: &mut usize, out: &mut Vec<TreeNode>| {
        out.push(TreeNode {
            id: next_id(),
            index: *position,
            kind,
            children: Vec::new(),
        });
        *position += 1;
    };
    for meta in metadata {
        push(TreeKind::Meta(meta.clone()), &mut position, &mut out);
    }
    if !references.is_empty() {
        push(
            TreeKind::References(references.to_vec()),
            &mut position,
            &mut out,
        );
    }
    for used in used_context {
        push(
            TreeKind::UsedContext(used.clone()),
            &mut position,
            &mut out,
        );
    }
    if !ignored_files.is_empty() {
        push(
            TreeKind::IgnoredFiles(ignored_files.to_vec()),
            &mut position,
            &mut out,
        );
    }
    for child in children {
        let converted = convert(child, position, rebase, next_id, limit_ids, tokens);
        out.push(converted);
        position += 1;
    }
    out
}
