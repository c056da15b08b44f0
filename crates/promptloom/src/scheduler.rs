//! The render scheduler
//!
//! Drives the flex-group rendering protocol: siblings are grouped by
//! `flex_grow`, each group is budgeted against the tokens left over by the
//! groups before it (minus reservations held for the groups after it),
//! `prepare` and `render` run joined in parallel within a group, and the
//! scheduler recurses into whatever each child produced. Literals are sized
//! immediately and charged to the enclosing scope before any sibling budget
//! is computed.
//!
//! Elements wrapped as growable are remembered with their first-pass
//! consumption; [`Scheduler::expand`] re-renders them in document order
//! against the surplus once the whole tree has rendered.

use crate::element::{DEFAULT_PRIORITY, Element, FlexReserve, Props, State};
use crate::error::{Error, Result};
use crate::json;
use crate::node::{ContainerKind, Intrinsic, Node, TextChunkNode};
use crate::sizing::{Endpoint, Sizing};
use crate::tree::{
    ContainerData, ImageData, MessageData, NodeId, OpaqueData, TextData, TreeKind, TreeNode,
};
use futures::future::{BoxFuture, join_all};
use promptloom_protocol::{ContentPart, Tokenizer};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Output of a scheduling pass: the rendered tree plus the tokens its
/// literals and leaves consumed.
pub(crate) struct ScheduledTree {
    pub root: TreeNode,
    pub consumed: usize,
}

struct Scope {
    nodes: Vec<TreeNode>,
    consumed: usize,
}

struct Growable {
    node_id: NodeId,
    element: Arc<dyn Element>,
    state: State,
    priority: f64,
    initial_consumed: usize,
}

enum PendingPayload {
    Element { element: Arc<dyn Element>, grow: bool },
    Container { kind: ContainerKind },
    Message(MessageData),
}

struct PendingChild {
    position: usize,
    payload: PendingPayload,
    children: Vec<Node>,
    props: Props,
    cap: Option<usize>,
}

pub(crate) struct Scheduler {
    tokenizer: Arc<dyn Tokenizer>,
    endpoint: Endpoint,
    cancel: CancellationToken,
    ids: AtomicU64,
    growables: Mutex<Vec<Growable>>,
    limit_ids: Mutex<HashSet<String>>,
}

impl Scheduler {
    pub(crate) fn new(
        tokenizer: Arc<dyn Tokenizer>,
        endpoint: Endpoint,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tokenizer,
            endpoint,
            cancel,
            ids: AtomicU64::new(0),
            growables: Mutex::new(Vec::new()),
            limit_ids: Mutex::new(HashSet::new()),
        }
    }

    fn next_id(&self) -> NodeId {
        self.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sizing(&self, budget: usize) -> Sizing {
        Sizing::new(
            budget,
            self.endpoint,
            Arc::clone(&self.tokenizer),
            self.cancel.clone(),
        )
    }

    async fn fragment_tokens(&self, part: &ContentPart) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.tokenizer.token_length(part, &self.cancel).await?)
    }

    fn register_limit_id(&self, id: &str) -> Result<()> {
        let mut ids = self.limit_ids.lock().expect("limit id registry poisoned");
        if !ids.insert(id.to_string()) {
            return Err(Error::DuplicateTokenLimitId(id.to_string()));
        }
        Ok(())
    }

    /// Render the whole tree against the endpoint budget.
    pub(crate) async fn run(&self, root: Node, budget: usize) -> Result<ScheduledTree> {
        let scope = self.process(vec![root], budget, DEFAULT_PRIORITY).await?;
        debug!(consumed = scope.consumed, budget, "render pass complete");
        Ok(ScheduledTree {
            root: TreeNode {
                id: 0,
                index: 0,
                kind: TreeKind::Root,
                children: scope.nodes,
            },
            consumed: scope.consumed,
        })
    }

    /// Re-render growable elements, in document order, against the budget
    /// left over by the first pass. Each growable sees its original
    /// consumption plus the current surplus; expansion stops once the
    /// budget is spent. Over-use is left for the pruner.
    pub(crate) async fn expand(
        &self,
        tree: &mut TreeNode,
        consumed: &mut usize,
        budget: usize,
    ) -> Result<()> {
        let mut entries: Vec<Growable> = {
            let mut growables = self.growables.lock().expect("growable registry poisoned");
            growables.drain(..).collect()
        };
        if entries.is_empty() {
            return Ok(());
        }

        let positions = tree.document_positions();
        entries.sort_by_key(|entry| positions.get(&entry.node_id).copied().unwrap_or(u64::MAX));

        for entry in entries {
            if *consumed >= budget {
                break;
            }
            let surplus = budget - *consumed;
            let replacement_budget = surplus + entry.initial_consumed;
            debug!(
                node = entry.node_id,
                replacement_budget, surplus, "expanding growable"
            );

            let sizing = self.sizing(replacement_budget);
            let rendered = entry.element.render(&entry.state, &sizing).await?;
            let scope = self
                .process(vec![rendered], replacement_budget, entry.priority)
                .await?;

            if let Some(node) = tree.find_mut(entry.node_id) {
                node.children = scope.nodes;
                *consumed = consumed.saturating_sub(entry.initial_consumed) + scope.consumed;
            }
        }

        // Growables discovered during re-renders are not expanded again.
        self.growables
            .lock()
            .expect("growable registry poisoned")
            .clear();
        Ok(())
    }

    fn process<'a>(
        &'a self,
        pieces: Vec<Node>,
        scope_budget: usize,
        parent_priority: f64,
    ) -> BoxFuture<'a, Result<Scope>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut flat = Vec::new();
            for piece in pieces {
                piece.flatten_into(&mut flat);
            }

            let mut consumed = 0usize;
            let mut done: Vec<(usize, TreeNode)> = Vec::new();
            let mut pending: Vec<PendingChild> = Vec::new();

            // Literals, images, and intrinsics are sized and attached up
            // front; only elements, containers, and messages wait for a
            // budget.
            for (position, piece) in flat.into_iter().enumerate() {
                match piece {
                    Node::Text(text) => {
                        let tokens = self
                            .fragment_tokens(&ContentPart::text(text.clone()))
                            .await?;
                        consumed += tokens;
                        done.push((
                            position,
                            TreeNode {
                                id: self.next_id(),
                                index: position,
                                kind: TreeKind::Text(TextData {
                                    text,
                                    priority: DEFAULT_PRIORITY,
                                    tokens,
                                    chunk_boundary: false,
                                    metadata: Vec::new(),
                                    references: Vec::new(),
                                }),
                                children: Vec::new(),
                            },
                        ));
                    }
                    Node::TextChunk(chunk) => {
                        let (nodes, tokens) = self
                            .fold_text_chunk(chunk, position, parent_priority)
                            .await?;
                        consumed += tokens;
                        for node in nodes {
                            done.push((position, node));
                        }
                    }
                    Node::Image(image) => {
                        let part = ContentPart::image(image.url.clone(), image.detail);
                        let tokens = self.fragment_tokens(&part).await?;
                        consumed += tokens;
                        done.push((
                            position,
                            TreeNode {
                                id: self.next_id(),
                                index: position,
                                kind: TreeKind::Image(ImageData {
                                    url: image.url,
                                    detail: image.detail,
                                    priority: image.props.effective_priority(),
                                    tokens,
                                }),
                                children: Vec::new(),
                            },
                        ));
                    }
                    Node::Intrinsic(intrinsic) => {
                        let (node, tokens) = self
                            .lower_intrinsic(intrinsic, position, parent_priority)
                            .await?;
                        consumed += tokens;
                        done.push((position, node));
                    }
                    Node::Element(element) => {
                        pending.push(PendingChild {
                            position,
                            props: element.props.clone(),
                            cap: None,
                            children: Vec::new(),
                            payload: PendingPayload::Element {
                                element: element.element,
                                grow: element.grow,
                            },
                        });
                    }
                    Node::Container(container) => {
                        let cap = match &container.kind {
                            ContainerKind::TokenLimit { id, max } => {
                                self.register_limit_id(id)?;
                                Some(*max)
                            }
                            _ => None,
                        };
                        pending.push(PendingChild {
                            position,
                            props: container.props.clone(),
                            cap,
                            children: container.children,
                            payload: PendingPayload::Container {
                                kind: container.kind,
                            },
                        });
                    }
                    Node::Message(message) => {
                        let data = MessageData {
                            role: message.role,
                            name: message.name,
                            tool_calls: message.tool_calls,
                            tool_call_id: message.tool_call_id,
                            priority: message.props.effective_priority(),
                        };
                        pending.push(PendingChild {
                            position,
                            props: message.props,
                            cap: None,
                            children: message.children,
                            payload: PendingPayload::Message(data),
                        });
                    }
                    Node::Fragment(_) => unreachable!("fragments are flattened"),
                }
            }

            // Group the budgeted children by flex_grow; group 0 renders
            // first, later groups see what it left behind.
            let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
            for (slot, child) in pending.iter().enumerate() {
                groups.entry(child.props.flex_grow).or_default().push(slot);
            }
            let group_keys: Vec<u32> = groups.keys().copied().collect();

            let mut taken: Vec<Option<PendingChild>> =
                pending.into_iter().map(Some).collect::<Vec<_>>();

            for (key_index, grow_value) in group_keys.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let mut members: Vec<PendingChild> = groups[grow_value]
                    .iter()
                    .map(|&slot| taken[slot].take().expect("group member consumed twice"))
                    .collect();

                let remaining = scope_budget.saturating_sub(consumed);

                // Hold back the reservations declared by later groups.
                let reserved: usize = group_keys[key_index + 1..]
                    .iter()
                    .flat_map(|later| groups[later].iter())
                    .filter_map(|&slot| taken[slot].as_ref())
                    .map(|child| child.props.flex_reserve.resolve(remaining))
                    .sum();
                let pool = remaining.saturating_sub(reserved);

                let budgets = distribute(
                    pool,
                    &members
                        .iter()
                        .map(|child| (child.props.flex_basis, child.cap))
                        .collect::<Vec<_>>(),
                );
                debug!(
                    flex_grow = grow_value,
                    pool,
                    reserved,
                    budgets = ?budgets,
                    "budgeted flex group"
                );

                // Prepare, then render, all members of the group jointly.
                let states: Vec<State> =
                    join_all(members.iter().zip(&budgets).map(|(child, &budget)| {
                        let sizing = self.sizing(budget);
                        async move {
                            match &child.payload {
                                PendingPayload::Element { element, .. } => {
                                    element.prepare(&sizing).await
                                }
                                _ => Ok(State::empty()),
                            }
                        }
                    }))
                    .await
                    .into_iter()
                    .collect::<Result<_>>()?;

                let rendered: Vec<Option<Node>> = join_all(
                    members
                        .iter()
                        .zip(&states)
                        .zip(&budgets)
                        .map(|((child, state), &budget)| {
                            let sizing = self.sizing(budget);
                            async move {
                                match &child.payload {
                                    PendingPayload::Element { element, .. } => {
                                        element.render(state, &sizing).await.map(Some)
                                    }
                                    _ => Ok(None),
                                }
                            }
                        }),
                )
                .await
                .into_iter()
                .collect::<Result<_>>()?;

                // Recurse into what each member produced, every subtree
                // against its own budget.
                let child_priorities: Vec<f64> = members
                    .iter()
                    .map(|child| child.props.effective_priority())
                    .collect();
                let outcomes: Vec<Scope> = join_all(
                    members
                        .iter_mut()
                        .map(|child| std::mem::take(&mut child.children))
                        .collect::<Vec<_>>()
                        .into_iter()
                        .zip(rendered)
                        .zip(&budgets)
                        .zip(&child_priorities)
                        .map(|(((declared, rendered), &budget), &priority)| {
                            let pieces = match rendered {
                                Some(node) => vec![node],
                                None => declared,
                            };
                            self.process(pieces, budget, priority)
                        }),
                )
                .await
                .into_iter()
                .collect::<Result<_>>()?;

                for ((child, state), outcome) in
                    members.into_iter().zip(states).zip(outcomes.into_iter())
                {
                    consumed += outcome.consumed;
                    let id = self.next_id();
                    let kind = match &child.payload {
                        PendingPayload::Element { .. } => TreeKind::Container(ContainerData {
                            priority: child.props.effective_priority(),
                            chunk: false,
                            pass_priority: child.props.pass_priority,
                            token_limit: None,
                            keep_with: None,
                        }),
                        PendingPayload::Container { kind } => {
                            TreeKind::Container(ContainerData {
                                priority: child.props.effective_priority(),
                                chunk: matches!(kind, ContainerKind::Chunk),
                                pass_priority: child.props.pass_priority,
                                token_limit: match kind {
                                    ContainerKind::TokenLimit { id, max } => {
                                        Some((id.clone(), *max))
                                    }
                                    _ => None,
                                },
                                keep_with: match kind {
                                    ContainerKind::KeepWith(group) => Some(group.0),
                                    _ => None,
                                },
                            })
                        }
                        PendingPayload::Message(data) => TreeKind::Message(data.clone()),
                    };
                    trace!(node = id, consumed = outcome.consumed, "rendered child");
                    if let PendingPayload::Element { element, grow: true } = child.payload {
                        let mut growables =
                            self.growables.lock().expect("growable registry poisoned");
                        growables.push(Growable {
                            node_id: id,
                            element,
                            state,
                            priority: child.props.effective_priority(),
                            initial_consumed: outcome.consumed,
                        });
                    }
                    done.push((
                        child.position,
                        TreeNode {
                            id,
                            index: child.position,
                            kind,
                            children: outcome.nodes,
                        },
                    ));
                }
            }

            done.sort_by_key(|(position, _)| *position);
            Ok(Scope {
                nodes: done.into_iter().map(|(_, node)| node).collect(),
                consumed,
            })
        })
    }

    async fn lower_intrinsic(
        &self,
        intrinsic: Intrinsic,
        position: usize,
        parent_priority: f64,
    ) -> Result<(TreeNode, usize)> {
        let node = |kind: TreeKind| TreeNode {
            id: self.next_id(),
            index: position,
            kind,
            children: Vec::new(),
        };
        match intrinsic {
            Intrinsic::LineBreak => Ok((node(TreeKind::LineBreak), 0)),
            Intrinsic::Meta(metadata) => Ok((node(TreeKind::Meta(metadata)), 0)),
            Intrinsic::References(references) => Ok((node(TreeKind::References(references)), 0)),
            Intrinsic::UsedContext(used) => Ok((node(TreeKind::UsedContext(used)), 0)),
            Intrinsic::IgnoredFiles(files) => Ok((node(TreeKind::IgnoredFiles(files)), 0)),
            Intrinsic::CacheCheckpoint(cache_type) => {
                Ok((node(TreeKind::Checkpoint(cache_type)), 0))
            }
            Intrinsic::Opaque { value, token_usage } => {
                let tokens = match token_usage {
                    Some(declared) => declared,
                    None => {
                        self.fragment_tokens(&ContentPart::opaque(value.clone()))
                            .await?
                    }
                };
                Ok((
                    node(TreeKind::Opaque(OpaqueData {
                        value,
                        priority: DEFAULT_PRIORITY,
                        tokens,
                    })),
                    tokens,
                ))
            }
            Intrinsic::ElementJson(document) => {
                let outcome =
                    json::splice_into_tree(&document, parent_priority, position, &|| {
                        self.next_id()
                    })?;
                for id in &outcome.limit_ids {
                    self.register_limit_id(id)?;
                }
                Ok((outcome.node, outcome.tokens))
            }
        }
    }

    async fn fold_text_chunk(
        &self,
        chunk: TextChunkNode,
        position: usize,
        parent_priority: f64,
    ) -> Result<(Vec<TreeNode>, usize)> {
        let mut text = String::new();
        let mut metadata = Vec::new();
        let mut references = Vec::new();
        let mut trailing = Vec::new();
        let mut total_tokens = 0usize;

        let mut flat = Vec::new();
        for child in chunk.children {
            child.flatten_into(&mut flat);
        }
        for child in flat {
            match child {
                Node::Text(literal) => text.push_str(&literal),
                Node::Intrinsic(Intrinsic::LineBreak) => text.push('\n'),
                Node::Intrinsic(Intrinsic::Meta(meta)) if meta.local => metadata.push(meta),
                Node::Intrinsic(Intrinsic::References(refs)) => references.extend(refs),
                Node::Intrinsic(other) => {
                    let (node, tokens) = self
                        .lower_intrinsic(other, position, parent_priority)
                        .await?;
                    total_tokens += tokens;
                    trailing.push(node);
                }
                _ => return Err(Error::InvalidTextChunkChild),
            }
        }

        let tokens = self
            .fragment_tokens(&ContentPart::text(text.clone()))
            .await?;
        total_tokens += tokens;

        let mut nodes = vec![TreeNode {
            id: self.next_id(),
            index: position,
            kind: TreeKind::Text(TextData {
                text,
                priority: chunk.props.effective_priority(),
                tokens,
                chunk_boundary: true,
                metadata,
                references,
            }),
            children: Vec::new(),
        }];
        nodes.extend(trailing);
        Ok((nodes, total_tokens))
    }
}

/// Split `pool` across group members proportionally to their flex basis.
/// Members whose proportional share would exceed their token-limit cap are
/// granted exactly the cap; the cap leaves the pool and the member's basis
/// leaves the denominator, repeatedly, until the assignment is stable.
fn distribute(pool: usize, members: &[(f64, Option<usize>)]) -> Vec<usize> {
    let mut budgets = vec![0usize; members.len()];
    let mut active: Vec<usize> = (0..members.len()).collect();
    let mut remaining_pool = pool;

    loop {
        let basis_sum: f64 = active.iter().map(|&i| members[i].0).sum();
        if basis_sum <= 0.0 {
            break;
        }
        let newly_capped: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| {
                members[i].1.is_some_and(|cap| {
                    let share =
                        (remaining_pool as f64 * members[i].0 / basis_sum).floor() as usize;
                    share > cap
                })
            })
            .collect();
        if newly_capped.is_empty() {
            for &i in &active {
                budgets[i] =
                    (remaining_pool as f64 * members[i].0 / basis_sum).floor() as usize;
            }
            break;
        }
        for i in newly_capped {
            let cap = members[i].1.expect("capped member has a cap");
            budgets[i] = cap;
            remaining_pool = remaining_pool.saturating_sub(cap);
            active.retain(|&j| j != i);
        }
    }
    budgets
}
