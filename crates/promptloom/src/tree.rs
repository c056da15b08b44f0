//! The rendered tree
//!
//! While the scheduler drives elements, their output is recorded as a tree
//! of owned nodes: containers and messages with ordered children, sized
//! text and image leaves, and intrinsic markers waiting to be lowered by
//! the materializer. Parents own children exclusively; the only index kept
//! on the side is id-based lookup for growable replacement.

use crate::meta::{Metadata, Reference, UsedContext};
use promptloom_protocol::{CacheType, ImageDetail, Role, ToolCall};
use std::collections::HashMap;

/// Stable identity of a rendered node within one render.
pub(crate) type NodeId = u64;

/// A node of the rendered tree.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub id: NodeId,
    /// Declaration index among siblings. Pieces folded out of a text chunk
    /// share the chunk's index so a stable sort keeps them adjacent.
    pub index: usize,
    pub kind: TreeKind,
    pub children: Vec<TreeNode>,
}

#[derive(Debug, Clone)]
pub(crate) enum TreeKind {
    Root,
    Container(ContainerData),
    Message(MessageData),
    Text(TextData),
    Image(ImageData),
    LineBreak,
    Checkpoint(CacheType),
    Opaque(OpaqueData),
    Meta(Metadata),
    References(Vec<Reference>),
    UsedContext(UsedContext),
    IgnoredFiles(Vec<String>),
}

#[derive(Debug, Clone)]
pub(crate) struct ContainerData {
    pub priority: f64,
    pub chunk: bool,
    pub pass_priority: bool,
    pub token_limit: Option<(String, usize)>,
    pub keep_with: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageData {
    pub role: Role,
    pub name: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub priority: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct TextData {
    pub text: String,
    pub priority: f64,
    pub tokens: usize,
    /// Chunk boundaries force a line break before the text.
    pub chunk_boundary: bool,
    pub metadata: Vec<Metadata>,
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone)]
pub(crate) struct ImageData {
    pub url: String,
    pub detail: Option<ImageDetail>,
    pub priority: f64,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct OpaqueData {
    pub value: serde_json::Value,
    pub priority: f64,
    pub tokens: usize,
}

impl TreeNode {
    /// Find a node by id.
    pub fn find_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(id))
    }

    /// Pre-order position of every node, used to order growables by their
    /// place in the document.
    pub fn document_positions(&self) -> HashMap<NodeId, u64> {
        let mut positions = HashMap::new();
        let mut next = 0u64;
        self.collect_positions(&mut positions, &mut next);
        positions
    }

    fn collect_positions(&self, positions: &mut HashMap<NodeId, u64>, next: &mut u64) {
        positions.insert(self.id, *next);
        *next += 1;
        for child in &self.children {
            child.collect_positions(positions, next);
        }
    }
}
