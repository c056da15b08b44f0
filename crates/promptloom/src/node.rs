//! The authored prompt tree
//!
//! A [`Node`] is one piece of a prompt declaration: a text literal, a chat
//! message, a user element, a structural container, or one of the closed
//! set of intrinsics. Authors assemble a tree of nodes and hand the root to
//! [`PromptRenderer`](crate::render::PromptRenderer); the engine takes it
//! from there.

use crate::element::{Element, Props};
use crate::json::JsonElement;
use crate::meta::{Metadata, Reference, UsedContext};
use promptloom_protocol::{CacheType, ImageDetail, Role, ToolCall};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A piece of an authored prompt tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// A text literal, emitted inline at the declaration site.
    Text(String),

    /// A user-defined element, rendered under a budget.
    Element(ElementNode),

    /// A structural container (plain, chunk, token-limit, or keep-with).
    Container(ContainerNode),

    /// A chat message.
    Message(MessageNode),

    /// A prioritized run of text that is pruned as one piece.
    TextChunk(TextChunkNode),

    /// An image part.
    Image(ImageNode),

    /// One of the closed set of intrinsic markers.
    Intrinsic(Intrinsic),

    /// A transparent grouping of pieces.
    Fragment(Vec<Node>),
}

/// A user element together with its layout hints.
#[derive(Clone)]
pub struct ElementNode {
    /// The element implementation.
    pub element: Arc<dyn Element>,

    /// Layout and pruning hints.
    pub props: Props,

    /// Whether the element may re-render once with the leftover budget.
    pub grow: bool,
}

impl std::fmt::Debug for ElementNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementNode")
            .field("props", &self.props)
            .field("grow", &self.grow)
            .finish_non_exhaustive()
    }
}

/// Structural flavor of a [`ContainerNode`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerKind {
    /// Plain grouping with its own priority slot.
    Plain,

    /// Atomic unit: pruned wholly or not at all.
    Chunk,

    /// A sub-scope with its own token ceiling.
    TokenLimit {
        /// Scope id, unique across the render.
        id: String,
        /// Token ceiling enforced on the subtree.
        max: usize,
    },

    /// Survival is coupled to the other members of the group.
    KeepWith(KeepWithGroup),
}

/// A structural container and its children.
#[derive(Debug, Clone)]
pub struct ContainerNode {
    /// Layout and pruning hints.
    pub props: Props,

    /// Structural flavor.
    pub kind: ContainerKind,

    /// Ordered children.
    pub children: Vec<Node>,
}

/// A chat message and its children.
#[derive(Debug, Clone)]
pub struct MessageNode {
    /// The message role.
    pub role: Role,

    /// Optional participant name.
    pub name: Option<String>,

    /// Tool invocations (assistant messages only).
    pub tool_calls: Vec<ToolCall>,

    /// Tool-call id this message responds to (tool messages only).
    pub tool_call_id: Option<String>,

    /// Layout and pruning hints.
    pub props: Props,

    /// Ordered children.
    pub children: Vec<Node>,
}

impl MessageNode {
    fn new(role: Role, children: Vec<Node>) -> Self {
        Self {
            role,
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            props: Props::default(),
            children,
        }
    }

    /// Create a system message.
    pub fn system(children: Vec<Node>) -> Self {
        Self::new(Role::System, children)
    }

    /// Create a user message.
    pub fn user(children: Vec<Node>) -> Self {
        Self::new(Role::User, children)
    }

    /// Create an assistant message.
    pub fn assistant(children: Vec<Node>) -> Self {
        Self::new(Role::Assistant, children)
    }

    /// Create a tool-result message bound to a tool-call id.
    pub fn tool(tool_call_id: impl Into<String>, children: Vec<Node>) -> Self {
        let mut msg = Self::new(Role::Tool, children);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// Create a legacy function-result message.
    pub fn function(name: impl Into<String>, children: Vec<Node>) -> Self {
        Self::new(Role::Function, children).with_name(name)
    }

    /// Set the participant name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach tool invocations (assistant messages).
    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Replace the layout hints.
    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }
}

impl From<MessageNode> for Node {
    fn from(message: MessageNode) -> Self {
        Node::Message(message)
    }
}

/// A prioritized text run. Children are restricted to literals and
/// intrinsics; the run is materialized as a single prunable chunk.
#[derive(Debug, Clone)]
pub struct TextChunkNode {
    /// Layout and pruning hints.
    pub props: Props,

    /// Ordered children (literals and intrinsics only).
    pub children: Vec<Node>,
}

/// An image part with optional fidelity hint.
#[derive(Debug, Clone)]
pub struct ImageNode {
    /// Image URL (remote or data URI).
    pub url: String,

    /// Requested processing fidelity.
    pub detail: Option<ImageDetail>,

    /// Layout and pruning hints.
    pub props: Props,
}

/// The closed set of intrinsic markers.
#[derive(Debug, Clone)]
pub enum Intrinsic {
    /// Attach a metadata record to the enclosing scope.
    Meta(Metadata),

    /// Force a line break before the following text.
    LineBreak,

    /// Attach references to the enclosing scope.
    References(Vec<Reference>),

    /// Attach a used-context record to the enclosing scope.
    UsedContext(UsedContext),

    /// Mark files that were deliberately left out of the prompt.
    IgnoredFiles(Vec<String>),

    /// Splice a previously serialized subtree into the tree.
    ElementJson(Box<JsonElement>),

    /// Mark a cache boundary inside a message.
    CacheCheckpoint(CacheType),

    /// A verbatim value with a declared token cost.
    Opaque {
        /// The opaque payload.
        value: serde_json::Value,

        /// Declared token cost; estimated by the tokenizer when absent.
        token_usage: Option<usize>,
    },
}

/// Identity of a keep-with group. Members of the same group survive or are
/// removed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeepWithGroup(pub(crate) u64);

static NEXT_KEEP_WITH: AtomicU64 = AtomicU64::new(1);

impl KeepWithGroup {
    /// Allocate a fresh group id.
    pub fn next() -> Self {
        Self(NEXT_KEEP_WITH.fetch_add(1, Ordering::Relaxed))
    }
}

impl Node {
    /// A text literal.
    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(text.into())
    }

    /// A transparent grouping of pieces.
    pub fn fragment(children: Vec<Node>) -> Self {
        Node::Fragment(children)
    }

    /// A user element.
    pub fn element(element: impl Element + 'static, props: Props) -> Self {
        Node::Element(ElementNode {
            element: Arc::new(element),
            props,
            grow: false,
        })
    }

    /// A user element that may re-render once with the leftover budget.
    pub fn expandable(element: impl Element + 'static, props: Props) -> Self {
        Node::Element(ElementNode {
            element: Arc::new(element),
            props,
            grow: true,
        })
    }

    /// A plain container.
    pub fn container(props: Props, children: Vec<Node>) -> Self {
        Node::Container(ContainerNode {
            props,
            kind: ContainerKind::Plain,
            children,
        })
    }

    /// An atomic container: pruned wholly or not at all.
    pub fn chunk(props: Props, children: Vec<Node>) -> Self {
        Node::Container(ContainerNode {
            props,
            kind: ContainerKind::Chunk,
            children,
        })
    }

    /// A sub-scope with its own token ceiling.
    pub fn token_limit(id: impl Into<String>, max: usize, children: Vec<Node>) -> Self {
        Node::Container(ContainerNode {
            props: Props::default(),
            kind: ContainerKind::TokenLimit { id: id.into(), max },
            children,
        })
    }

    /// A container whose survival is coupled to its group.
    pub fn keep_with(group: KeepWithGroup, props: Props, children: Vec<Node>) -> Self {
        Node::Container(ContainerNode {
            props,
            kind: ContainerKind::KeepWith(group),
            children,
        })
    }

    /// A prioritized text run.
    pub fn text_chunk(text: impl Into<String>, priority: u64) -> Self {
        Node::TextChunk(TextChunkNode {
            props: Props::new().with_priority(priority),
            children: vec![Node::text(text)],
        })
    }

    /// A prioritized text run with explicit props and children.
    pub fn text_chunk_with(props: Props, children: Vec<Node>) -> Self {
        Node::TextChunk(TextChunkNode { props, children })
    }

    /// An image part.
    pub fn image(url: impl Into<String>, detail: Option<ImageDetail>, props: Props) -> Self {
        Node::Image(ImageNode {
            url: url.into(),
            detail,
            props,
        })
    }

    /// A plain container whose children receive consecutive priorities
    /// starting at `base`: ascending declaration order when `descending` is
    /// false, so later children are pruned later; descending otherwise, so
    /// earlier children are pruned later.
    pub fn prioritized_list(
        props: Props,
        base: u64,
        descending: bool,
        children: Vec<Node>,
    ) -> Self {
        let assigned = children
            .into_iter()
            .enumerate()
            .map(|(i, child)| {
                let offset = i as u64;
                let priority = if descending {
                    base.saturating_sub(offset)
                } else {
                    base.saturating_add(offset)
                };
                child.with_priority(priority)
            })
            .collect();
        Node::container(props, assigned)
    }

    /// A system message.
    pub fn system_message(children: Vec<Node>) -> Self {
        MessageNode::system(children).into()
    }

    /// A user message.
    pub fn user_message(children: Vec<Node>) -> Self {
        MessageNode::user(children).into()
    }

    /// An assistant message.
    pub fn assistant_message(children: Vec<Node>) -> Self {
        MessageNode::assistant(children).into()
    }

    /// A tool-result message.
    pub fn tool_message(tool_call_id: impl Into<String>, children: Vec<Node>) -> Self {
        MessageNode::tool(tool_call_id, children).into()
    }

    /// A line break before the following text.
    pub fn line_break() -> Self {
        Node::Intrinsic(Intrinsic::LineBreak)
    }

    /// Attach a metadata record to the enclosing scope.
    pub fn meta(metadata: Metadata) -> Self {
        Node::Intrinsic(Intrinsic::Meta(metadata))
    }

    /// Attach references to the enclosing scope.
    pub fn references(references: Vec<Reference>) -> Self {
        Node::Intrinsic(Intrinsic::References(references))
    }

    /// Attach a used-context record to the enclosing scope.
    pub fn used_context(used: UsedContext) -> Self {
        Node::Intrinsic(Intrinsic::UsedContext(used))
    }

    /// Mark files deliberately left out of the prompt.
    pub fn ignored_files(files: Vec<String>) -> Self {
        Node::Intrinsic(Intrinsic::IgnoredFiles(files))
    }

    /// Splice a serialized subtree into the tree.
    pub fn element_json(document: JsonElement) -> Self {
        Node::Intrinsic(Intrinsic::ElementJson(Box::new(document)))
    }

    /// Mark an ephemeral cache boundary.
    pub fn cache_checkpoint() -> Self {
        Node::Intrinsic(Intrinsic::CacheCheckpoint(CacheType::Ephemeral))
    }

    /// Mark a cache boundary with an explicit cache type.
    pub fn cache_checkpoint_with(cache_type: CacheType) -> Self {
        Node::Intrinsic(Intrinsic::CacheCheckpoint(cache_type))
    }

    /// A verbatim value with a declared token cost.
    pub fn opaque(value: serde_json::Value, token_usage: Option<usize>) -> Self {
        Node::Intrinsic(Intrinsic::Opaque { value, token_usage })
    }

    /// Assign a priority to this node. Literals are wrapped in a text chunk
    /// so they can carry one; fragments and intrinsics are unchanged.
    pub fn with_priority(self, priority: u64) -> Self {
        match self {
            Node::Text(text) => Node::text_chunk(text, priority),
            Node::Element(mut node) => {
                node.props.priority = Some(priority);
                Node::Element(node)
            }
            Node::Container(mut node) => {
                node.props.priority = Some(priority);
                Node::Container(node)
            }
            Node::Message(mut node) => {
                node.props.priority = Some(priority);
                Node::Message(node)
            }
            Node::TextChunk(mut node) => {
                node.props.priority = Some(priority);
                Node::TextChunk(node)
            }
            Node::Image(mut node) => {
                node.props.priority = Some(priority);
                Node::Image(node)
            }
            other @ (Node::Intrinsic(_) | Node::Fragment(_)) => other,
        }
    }

    /// Expand fragments into their pieces, preserving declaration order.
    pub(crate) fn flatten_into(self, out: &mut Vec<Node>) {
        match self {
            Node::Fragment(children) => {
                for child in children {
                    child.flatten_into(out);
                }
            }
            other => out.push(other),
        }
    }
}

impl From<&str> for Node {
    fn from(text: &str) -> Self {
        Node::text(text)
    }
}

impl From<String> for Node {
    fn from(text: String) -> Self {
        Node::Text(text)
    }
}
