//! Materialization
//!
//! Lowers the rendered tree into the tagged structure the pruner and
//! emitter operate on: containers and chat messages holding ordered
//! children, sized text and image leaves, cache checkpoints, and opaque
//! values. Side-channel intrinsics are folded onto the node that declared
//! them so pruning a node also drops its metadata and references.
//!
//! Structural contracts are enforced here: text only inside messages, no
//! message nesting, unique global metadata keys, tool-call arguments that
//! parse as JSON.

use crate::element::DEFAULT_PRIORITY;
use crate::error::{Error, Result};
use crate::meta::{Metadata, Reference, UsedContext};
use crate::tree::{NodeId, TreeKind, TreeNode};
use promptloom_protocol::{CacheType, ImageDetail, Role, ToolCall};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Whether a line break is inserted before a text chunk when the emitter
/// joins adjacent chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LineBreakBefore {
    /// Run the chunk inline with the preceding text.
    #[default]
    None,

    /// Always break: the chunk follows an explicit break or opens a
    /// prioritized text run.
    Always,

    /// Break unless the preceding chunk was inline literal text.
    IfNotTextSibling,
}

/// Side-channel payloads attached to a container or message.
#[derive(Debug, Clone, Default)]
pub(crate) struct SideChannel {
    pub metadata: Vec<Metadata>,
    pub references: Vec<Reference>,
    pub used_context: Vec<UsedContext>,
    pub ignored_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct MContainer {
    pub id: NodeId,
    pub order: u64,
    pub index: usize,
    pub priority: f64,
    pub chunk: bool,
    pub pass_priority: bool,
    pub token_limit: Option<(String, usize)>,
    pub keep_with: Option<u64>,
    pub side: SideChannel,
    pub children: Vec<MaterializedNode>,
}

#[derive(Debug, Clone)]
pub(crate) struct MMessage {
    pub id: NodeId,
    pub order: u64,
    pub index: usize,
    pub priority: f64,
    pub role: Role,
    pub name: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub tool_call_id: Option<String>,
    pub side: SideChannel,
    pub children: Vec<MaterializedNode>,
}

#[derive(Debug, Clone)]
pub(crate) struct MText {
    pub id: NodeId,
    pub order: u64,
    pub index: usize,
    pub priority: f64,
    pub text: String,
    pub tokens: usize,
    pub line_break_before: LineBreakBefore,
    pub metadata: Vec<Metadata>,
    pub references: Vec<Reference>,
}

#[derive(Debug, Clone)]
pub(crate) struct MImage {
    pub id: NodeId,
    pub order: u64,
    pub index: usize,
    pub priority: f64,
    pub url: String,
    pub detail: Option<ImageDetail>,
    pub tokens: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MCheckpoint {
    pub id: NodeId,
    pub order: u64,
    pub index: usize,
    pub cache_type: CacheType,
}

#[derive(Debug, Clone)]
pub(crate) struct MOpaque {
    pub id: NodeId,
    pub order: u64,
    pub index: usize,
    pub priority: f64,
    pub value: serde_json::Value,
    pub tokens: usize,
}

/// The tagged sum the pruner and emitter operate on.
#[derive(Debug, Clone)]
pub(crate) enum MaterializedNode {
    Container(MContainer),
    Message(MMessage),
    Text(MText),
    Image(MImage),
    Checkpoint(MCheckpoint),
    Opaque(MOpaque),
}

impl MaterializedNode {
    pub fn id(&self) -> NodeId {
        match self {
            MaterializedNode::Container(n) => n.id,
            MaterializedNode::Message(n) => n.id,
            MaterializedNode::Text(n) => n.id,
            MaterializedNode::Image(n) => n.id,
            MaterializedNode::Checkpoint(n) => n.id,
            MaterializedNode::Opaque(n) => n.id,
        }
    }

    pub fn order(&self) -> u64 {
        match self {
            MaterializedNode::Container(n) => n.order,
            MaterializedNode::Message(n) => n.order,
            MaterializedNode::Text(n) => n.order,
            MaterializedNode::Image(n) => n.order,
            MaterializedNode::Checkpoint(n) => n.order,
            MaterializedNode::Opaque(n) => n.order,
        }
    }

    pub fn priority(&self) -> f64 {
        match self {
            MaterializedNode::Container(n) => n.priority,
            MaterializedNode::Message(n) => n.priority,
            MaterializedNode::Text(n) => n.priority,
            MaterializedNode::Image(n) => n.priority,
            MaterializedNode::Checkpoint(_) => DEFAULT_PRIORITY,
            MaterializedNode::Opaque(n) => n.priority,
        }
    }

    pub fn children(&self) -> &[MaterializedNode] {
        match self {
            MaterializedNode::Container(n) => &n.children,
            MaterializedNode::Message(n) => &n.children,
            _ => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<MaterializedNode>> {
        match self {
            MaterializedNode::Container(n) => Some(&mut n.children),
            MaterializedNode::Message(n) => Some(&mut n.children),
            _ => None,
        }
    }

    /// Depth-first first text leaf, used to assign the block-level break
    /// policy of a nested container.
    pub fn first_text_mut(&mut self) -> Option<&mut MText> {
        match self {
            MaterializedNode::Text(text) => Some(text),
            MaterializedNode::Container(container) => container
                .children
                .iter_mut()
                .find_map(|child| child.first_text_mut()),
            _ => None,
        }
    }
}

impl MContainer {
    /// Every message in the subtree, in document order.
    pub(crate) fn collect_messages(&self) -> Vec<&MMessage> {
        fn walk<'a>(children: &'a [MaterializedNode], out: &mut Vec<&'a MMessage>) {
            for child in children {
                match child {
                    MaterializedNode::Message(message) => out.push(message),
                    MaterializedNode::Container(container) => walk(&container.children, out),
                    _ => {}
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.children, &mut out);
        out
    }
}

/// The materialized tree plus everything collected while lowering it.
#[derive(Debug)]
pub(crate) struct Materialized {
    pub root: MContainer,
    pub global_metadata: Vec<Metadata>,
    /// Every reference declared anywhere, kept to report the ones whose
    /// content did not survive pruning.
    pub all_references: Vec<Reference>,
    pub keep_with: HashMap<u64, Vec<NodeId>>,
}

struct Lowering {
    next_order: u64,
    global_metadata: Vec<Metadata>,
    all_references: Vec<Reference>,
    keep_with: HashMap<u64, Vec<NodeId>>,
}

impl Lowering {
    fn order(&mut self) -> u64 {
        let order = self.next_order;
        self.next_order += 1;
        order
    }

    fn add_global_metadata(&mut self, metadata: Metadata) -> Result<()> {
        if self
            .global_metadata
            .iter()
            .any(|existing| existing.key == metadata.key)
        {
            return Err(Error::DuplicateMetadataKey(metadata.key));
        }
        self.global_metadata.push(metadata);
        Ok(())
    }
}

/// Where content sits relative to a chat message while lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageContext {
    /// Above every message; bare text is a contract violation.
    Outside,

    /// Inside a message; nested messages are a contract violation.
    Inside,

    /// Serialized-document root: bare text and messages both allowed,
    /// since the document only gains a message context when spliced.
    Permissive,
}

impl MessageContext {
    fn holds_text(self) -> bool {
        !matches!(self, MessageContext::Outside)
    }
}

/// Lower the rendered tree into the materialized structure, enforcing the
/// message contracts of a full render.
pub(crate) fn materialize(tree: TreeNode) -> Result<Materialized> {
    materialize_in(tree, MessageContext::Outside)
}

/// Lower a tree destined for a serialized document: bare content is
/// allowed at the root because the splice site supplies the message
/// context.
pub(crate) fn materialize_document(tree: TreeNode) -> Result<Materialized> {
    materialize_in(tree, MessageContext::Permissive)
}

fn materialize_in(tree: TreeNode, context: MessageContext) -> Result<Materialized> {
    let TreeKind::Root = tree.kind else {
        unreachable!("materialization starts at the render root");
    };

    let mut lowering = Lowering {
        next_order: 1,
        global_metadata: Vec::new(),
        all_references: Vec::new(),
        keep_with: HashMap::new(),
    };

    let mut side = SideChannel::default();
    let children = lower_children(tree.children, context, &mut side, &mut lowering)?;

    Ok(Materialized {
        root: MContainer {
            id: tree.id,
            order: 0,
            index: 0,
            priority: DEFAULT_PRIORITY,
            chunk: false,
            pass_priority: false,
            token_limit: None,
            keep_with: None,
            side,
            children,
        },
        global_metadata: lowering.global_metadata,
        all_references: lowering.all_references,
        keep_with: lowering.keep_with,
    })
}

fn lower_children(
    mut children: Vec<TreeNode>,
    context: MessageContext,
    parent_side: &mut SideChannel,
    lowering: &mut Lowering,
) -> Result<Vec<MaterializedNode>> {
    children.sort_by_key(|child| child.index);

    let mut out: Vec<MaterializedNode> = Vec::new();
    let mut pending_break = false;

    for child in children {
        let order = lowering.order();
        match child.kind {
            TreeKind::Root => unreachable!("the root is never a child"),
            TreeKind::LineBreak => {
                pending_break = true;
            }
            TreeKind::Meta(metadata) => {
                if metadata.local {
                    parent_side.metadata.push(metadata);
                } else {
                    lowering.add_global_metadata(metadata)?;
                }
            }
            TreeKind::References(references) => {
                lowering.all_references.extend(references.iter().cloned());
                parent_side.references.extend(references);
            }
            TreeKind::UsedContext(used) => {
                parent_side.used_context.push(used);
            }
            TreeKind::IgnoredFiles(files) => {
                parent_side.ignored_files.extend(files);
            }
            TreeKind::Text(data) => {
                if !context.holds_text() {
                    return Err(Error::TextOutsideMessage);
                }
                let line_break_before = if pending_break || data.chunk_boundary {
                    LineBreakBefore::Always
                } else {
                    LineBreakBefore::None
                };
                pending_break = false;
                lowering.all_references.extend(data.references.iter().cloned());
                out.push(MaterializedNode::Text(MText {
                    id: child.id,
                    order,
                    index: child.index,
                    priority: data.priority,
                    text: data.text,
                    tokens: data.tokens,
                    line_break_before,
                    metadata: data.metadata,
                    references: data.references,
                }));
            }
            TreeKind::Image(data) => {
                if !context.holds_text() {
                    return Err(Error::TextOutsideMessage);
                }
                out.push(MaterializedNode::Image(MImage {
                    id: child.id,
                    order,
                    index: child.index,
                    priority: data.priority,
                    url: data.url,
                    detail: data.detail,
                    tokens: data.tokens,
                }));
            }
            TreeKind::Checkpoint(cache_type) => {
                if !context.holds_text() {
                    return Err(Error::TextOutsideMessage);
                }
                out.push(MaterializedNode::Checkpoint(MCheckpoint {
                    id: child.id,
                    order,
                    index: child.index,
                    cache_type,
                }));
            }
            TreeKind::Opaque(data) => {
                if !context.holds_text() {
                    return Err(Error::TextOutsideMessage);
                }
                out.push(MaterializedNode::Opaque(MOpaque {
                    id: child.id,
                    order,
                    index: child.index,
                    priority: data.priority,
                    value: data.value,
                    tokens: data.tokens,
                }));
            }
            TreeKind::Message(data) => {
                if context == MessageContext::Inside {
                    return Err(Error::NestedMessage);
                }
                validate_tool_calls(&data.tool_calls)?;
                let mut side = SideChannel::default();
                let grandchildren =
                    lower_children(child.children, MessageContext::Inside, &mut side, lowering)?;
                out.push(MaterializedNode::Message(MMessage {
                    id: child.id,
                    order,
                    index: child.index,
                    priority: data.priority,
                    role: data.role,
                    name: data.name,
                    tool_calls: data.tool_calls,
                    tool_call_id: data.tool_call_id,
                    side,
                    children: grandchildren,
                }));
            }
            TreeKind::Container(data) => {
                let mut side = SideChannel::default();
                let grandchildren = lower_children(child.children, context, &mut side, lowering)?;
                if let Some(group) = data.keep_with {
                    lowering.keep_with.entry(group).or_default().push(child.id);
                }
                let mut container = MaterializedNode::Container(MContainer {
                    id: child.id,
                    order,
                    index: child.index,
                    priority: data.priority,
                    chunk: data.chunk,
                    pass_priority: data.pass_priority,
                    token_limit: data.token_limit,
                    keep_with: data.keep_with,
                    side,
                    children: grandchildren,
                });
                // Containers behave as blocks: their opening text breaks
                // away from a preceding block, but runs inline after plain
                // literal text.
                if context.holds_text() {
                    if let Some(first) = container.first_text_mut() {
                        if pending_break {
                            first.line_break_before = LineBreakBefore::Always;
                        } else if first.line_break_before == LineBreakBefore::None {
                            first.line_break_before = LineBreakBefore::IfNotTextSibling;
                        }
                    }
                    pending_break = false;
                }
                out.push(container);
            }
        }
    }

    Ok(out)
}

fn validate_tool_calls(tool_calls: &[ToolCall]) -> Result<()> {
    for call in tool_calls {
        if let Err(source) = serde_json::from_str::<serde_json::Value>(&call.function.arguments) {
            return Err(Error::InvalidToolCallArguments {
                name: call.function.name.clone(),
                source,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{ContainerData, MessageData, TextData};

    fn text_node(id: NodeId, index: usize, text: &str, chunk_boundary: bool) -> TreeNode {
        TreeNode {
            id,
            index,
            kind: TreeKind::Text(TextData {
                text: text.to_string(),
                priority: DEFAULT_PRIORITY,
                tokens: 1,
                chunk_boundary,
                metadata: Vec::new(),
                references: Vec::new(),
            }),
            children: Vec::new(),
        }
    }

    fn message_node(id: NodeId, index: usize, children: Vec<TreeNode>) -> TreeNode {
        TreeNode {
            id,
            index,
            kind: TreeKind::Message(MessageData {
                role: Role::User,
                name: None,
                tool_calls: Vec::new(),
                tool_call_id: None,
                priority: DEFAULT_PRIORITY,
            }),
            children,
        }
    }

    fn container_node(id: NodeId, index: usize, children: Vec<TreeNode>) -> TreeNode {
        TreeNode {
            id,
            index,
            kind: TreeKind::Container(ContainerData {
                priority: DEFAULT_PRIORITY,
                chunk: false,
                pass_priority: false,
                token_limit: None,
                keep_with: None,
            }),
            children,
        }
    }

    fn root(children: Vec<TreeNode>) -> TreeNode {
        TreeNode {
            id: 0,
            index: 0,
            kind: TreeKind::Root,
            children,
        }
    }

    #[test]
    fn test_text_outside_message_is_fatal() {
        let tree = root(vec![text_node(1, 0, "stray", false)]);
        let err = materialize(tree).unwrap_err();
        assert!(matches!(err, Error::TextOutsideMessage));
    }

    #[test]
    fn test_nested_message_is_fatal() {
        let inner = message_node(2, 0, vec![]);
        let tree = root(vec![message_node(1, 0, vec![inner])]);
        let err = materialize(tree).unwrap_err();
        assert!(matches!(err, Error::NestedMessage));
    }

    #[test]
    fn test_duplicate_global_metadata_key_is_fatal() {
        let meta = |id| TreeNode {
            id,
            index: 0,
            kind: TreeKind::Meta(Metadata::global("key", serde_json::json!(1))),
            children: Vec::new(),
        };
        let tree = root(vec![meta(1), meta(2)]);
        let err = materialize(tree).unwrap_err();
        assert!(matches!(err, Error::DuplicateMetadataKey(_)));
    }

    #[test]
    fn test_sibling_containers_break_between_chunks() {
        let first = container_node(2, 0, vec![text_node(3, 0, "alpha", false)]);
        let second = container_node(4, 1, vec![text_node(5, 0, "beta", false)]);
        let tree = root(vec![message_node(1, 0, vec![first, second])]);
        let materialized = materialize(tree).unwrap();

        let MaterializedNode::Message(message) = &materialized.root.children[0] else {
            panic!("expected message");
        };
        let policies: Vec<LineBreakBefore> = message
            .children
            .iter()
            .map(|child| {
                let MaterializedNode::Container(container) = child else {
                    panic!("expected container");
                };
                let MaterializedNode::Text(text) = &container.children[0] else {
                    panic!("expected text");
                };
                text.line_break_before
            })
            .collect();
        assert_eq!(
            policies,
            [
                LineBreakBefore::IfNotTextSibling,
                LineBreakBefore::IfNotTextSibling
            ]
        );
    }

    #[test]
    fn test_line_break_marker_forces_break() {
        let br = TreeNode {
            id: 2,
            index: 1,
            kind: TreeKind::LineBreak,
            children: Vec::new(),
        };
        let tree = root(vec![message_node(
            1,
            0,
            vec![
                text_node(3, 0, "first", false),
                br,
                text_node(4, 2, "second", false),
            ],
        )]);
        let materialized = materialize(tree).unwrap();
        let MaterializedNode::Message(message) = &materialized.root.children[0] else {
            panic!("expected message");
        };
        let MaterializedNode::Text(second) = &message.children[1] else {
            panic!("expected text");
        };
        assert_eq!(second.line_break_before, LineBreakBefore::Always);
    }

    #[test]
    fn test_invalid_tool_call_arguments_are_fatal() {
        let message = TreeNode {
            id: 1,
            index: 0,
            kind: TreeKind::Message(MessageData {
                role: Role::Assistant,
                name: None,
                tool_calls: vec![ToolCall::function("call_1", "search", "{broken")],
                tool_call_id: None,
                priority: DEFAULT_PRIORITY,
            }),
            children: Vec::new(),
        };
        let err = materialize(root(vec![message])).unwrap_err();
        assert!(matches!(err, Error::InvalidToolCallArguments { .. }));
    }
}
