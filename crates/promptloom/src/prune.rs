//! Prioritized pruning
//!
//! Repeatedly removes the lowest-priority leaf from each enforced
//! token-limit scope until token counts fit. Inner scopes are settled
//! before the root scope. Selection compares direct children of a
//! container by priority, breaking ties by the lowest priority found
//! anywhere in the child's subtree and then by later declaration order;
//! pass-priority containers are transparent to the comparison, chunks are
//! removed whole, keep-with groups fall together, and content pinned
//! behind a message's last cache checkpoint is never touched.
//!
//! Two counts gate the loop: a cheap upper bound (cached leaf lengths plus
//! framing overheads, monotone under removal) and the tokenizer's precise
//! message count (recomputed when a message changes). Pruning stops only
//! when both fit.

use crate::emit::assemble_message;
use crate::error::{Error, Result};
use crate::materialize::{MContainer, MMessage, Materialized, MaterializedNode};
use crate::tree::NodeId;
use promptloom_protocol::{ContentPart, Tokenizer, TokenizerOverhead};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct MessageCounts {
    upper: usize,
    precise: Option<usize>,
}

struct Candidate {
    priority: f64,
    subtree_min: f64,
    order: u64,
}

impl Candidate {
    /// Whether this candidate should be removed before `other`.
    fn beats(&self, other: &Candidate) -> bool {
        match self.priority.total_cmp(&other.priority) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => match self.subtree_min.total_cmp(&other.subtree_min) {
                std::cmp::Ordering::Less => true,
                std::cmp::Ordering::Greater => false,
                // Later declarations are removed first.
                std::cmp::Ordering::Equal => self.order > other.order,
            },
        }
    }
}

struct Pruner {
    tokenizer: Arc<dyn Tokenizer>,
    overhead: TokenizerOverhead,
    cancel: CancellationToken,
    legacy: bool,
    pinned: HashSet<NodeId>,
    keep_with: HashMap<u64, Vec<NodeId>>,
    tool_call_tokens: HashMap<NodeId, usize>,
    counts: HashMap<NodeId, MessageCounts>,
    pending_groups: Vec<u64>,
    cascaded_groups: HashSet<u64>,
    removed: usize,
}

/// Prune the materialized tree until every token-limit scope and the root
/// budget are satisfied. Returns the number of removal steps performed.
pub(crate) async fn prune(
    materialized: &mut Materialized,
    tokenizer: Arc<dyn Tokenizer>,
    budget: usize,
    legacy: bool,
    cancel: CancellationToken,
) -> Result<usize> {
    let overhead = tokenizer.overhead();
    let mut pruner = Pruner {
        overhead,
        cancel,
        legacy,
        pinned: HashSet::new(),
        keep_with: materialized.keep_with.clone(),
        tool_call_tokens: HashMap::new(),
        counts: HashMap::new(),
        pending_groups: Vec::new(),
        cascaded_groups: HashSet::new(),
        removed: 0,
        tokenizer,
    };

    for child in &materialized.root.children {
        collect_pinned(child, &mut pruner.pinned);
    }
    pruner.seed_tool_call_tokens(&materialized.root).await?;

    pruner.prune_limit_scopes(&mut materialized.root)?;
    pruner.prune_root(&mut materialized.root, budget).await?;

    debug!(removed = pruner.removed, budget, "pruning complete");
    Ok(pruner.removed)
}

impl Pruner {
    async fn seed_tool_call_tokens(&mut self, root: &MContainer) -> Result<()> {
        for message in root.collect_messages() {
            if message.tool_calls.is_empty() {
                continue;
            }
            let mut tokens = 0usize;
            for call in &message.tool_calls {
                let part = ContentPart::text(format!(
                    "{}{}",
                    call.function.name, call.function.arguments
                ));
                tokens += self.tokenizer.token_length(&part, &self.cancel).await?;
            }
            self.tool_call_tokens.insert(message.id, tokens);
        }
        Ok(())
    }

    // ===== Scope processing =====

    fn prune_limit_scopes(&mut self, root: &mut MContainer) -> Result<()> {
        let mut scopes = Vec::new();
        limit_scopes_post_order(&root.children, &mut scopes);

        for (scope_id, max) in scopes {
            loop {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let Some(scope_path) = find_path_by_id(&root.children, scope_id) else {
                    break;
                };
                let scope = resolve(&root.children, &scope_path);
                if leaf_token_sum_of(scope.children()) <= max {
                    break;
                }
                trace!(scope = scope_id, max, "token limit scope over budget");
                let victim = self
                    .find_victim_in_scope(scope.children())
                    .ok_or(Error::NoRemovableNode)?;
                let mut full = scope_path.clone();
                full.extend(victim);
                self.remove_and_settle(root, full)?;
            }
        }
        Ok(())
    }

    async fn prune_root(&mut self, root: &mut MContainer, budget: usize) -> Result<()> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let upper = self.total_upper(root);
            if upper <= budget {
                let precise = self.total_precise(root).await?;
                if precise <= budget {
                    break;
                }
            }
            let victim = self
                .find_victim_in_scope(&root.children)
                .ok_or(Error::NoRemovableNode)?;
            self.remove_and_settle(root, victim)?;
        }
        Ok(())
    }

    fn find_victim_in_scope(&self, children: &[MaterializedNode]) -> Option<Vec<usize>> {
        if self.legacy {
            self.find_victim_flat(children)
        } else {
            self.find_victim(children)
        }
    }

    fn remove_and_settle(&mut self, root: &mut MContainer, path: Vec<usize>) -> Result<()> {
        self.invalidate_along_path(&root.children, &path);
        let removed = remove_with_cleanup(&mut root.children, path);
        self.note_removed(&removed);
        self.removed += 1;
        self.apply_cascades(root);
        Ok(())
    }

    // ===== Victim selection =====

    fn find_victim(&self, children: &[MaterializedNode]) -> Option<Vec<usize>> {
        let mut best: Option<(Candidate, Vec<usize>)> = None;
        self.collect_candidates(children, &mut Vec::new(), &mut best);
        let (_, path) = best?;

        let node = resolve(children, &path);
        if self.is_atomic(node) {
            Some(path)
        } else {
            let deeper = self.find_victim(node.children())?;
            let mut full = path;
            full.extend(deeper);
            Some(full)
        }
    }

    fn collect_candidates(
        &self,
        children: &[MaterializedNode],
        prefix: &mut Vec<usize>,
        best: &mut Option<(Candidate, Vec<usize>)>,
    ) {
        for (i, child) in children.iter().enumerate() {
            if !self.has_removable(child) {
                continue;
            }
            if let MaterializedNode::Container(container) = child {
                if container.pass_priority && !container.chunk {
                    prefix.push(i);
                    self.collect_candidates(&container.children, prefix, best);
                    prefix.pop();
                    continue;
                }
            }
            let candidate = Candidate {
                priority: child.priority(),
                subtree_min: self.min_removable(child).unwrap_or(f64::INFINITY),
                order: child.order(),
            };
            let replace = match best {
                None => true,
                Some((current, _)) => candidate.beats(current),
            };
            if replace {
                let mut path = prefix.clone();
                path.push(i);
                *best = Some((candidate, path));
            }
        }
    }

    /// Legacy flat prioritization: every removable unit in the scope
    /// competes directly, regardless of the container it sits in.
    fn find_victim_flat(&self, children: &[MaterializedNode]) -> Option<Vec<usize>> {
        let mut best: Option<(Candidate, Vec<usize>)> = None;
        self.collect_flat(children, &mut Vec::new(), &mut best);
        best.map(|(_, path)| path)
    }

    fn collect_flat(
        &self,
        children: &[MaterializedNode],
        prefix: &mut Vec<usize>,
        best: &mut Option<(Candidate, Vec<usize>)>,
    ) {
        for (i, child) in children.iter().enumerate() {
            if !self.has_removable(child) {
                continue;
            }
            let unit = match child {
                MaterializedNode::Container(container) if !container.chunk => None,
                MaterializedNode::Message(_) => None,
                _ => Some(Candidate {
                    priority: child.priority(),
                    subtree_min: self.min_removable(child).unwrap_or(f64::INFINITY),
                    order: child.order(),
                }),
            };
            match unit {
                Some(candidate) => {
                    let replace = match best {
                        None => true,
                        Some((current, _)) => candidate.beats(current),
                    };
                    if replace {
                        let mut path = prefix.clone();
                        path.push(i);
                        *best = Some((candidate, path));
                    }
                }
                None => {
                    prefix.push(i);
                    self.collect_flat(child.children(), prefix, best);
                    prefix.pop();
                }
            }
        }
    }

    fn is_atomic(&self, node: &MaterializedNode) -> bool {
        match node {
            MaterializedNode::Text(_)
            | MaterializedNode::Image(_)
            | MaterializedNode::Opaque(_) => true,
            MaterializedNode::Checkpoint(_) => true,
            MaterializedNode::Container(container) => container.chunk,
            MaterializedNode::Message(_) => false,
        }
    }

    fn has_removable(&self, node: &MaterializedNode) -> bool {
        match node {
            MaterializedNode::Text(text) => !self.pinned.contains(&text.id),
            MaterializedNode::Image(image) => !self.pinned.contains(&image.id),
            MaterializedNode::Opaque(opaque) => !self.pinned.contains(&opaque.id),
            MaterializedNode::Checkpoint(_) => false,
            MaterializedNode::Container(container) if container.chunk => {
                !container.children.is_empty() && !self.holds_protected(node)
            }
            MaterializedNode::Container(container) => {
                container.children.iter().any(|child| self.has_removable(child))
            }
            MaterializedNode::Message(message) => {
                message.children.iter().any(|child| self.has_removable(child))
            }
        }
    }

    /// Whether the subtree contains a checkpoint or pinned content, which
    /// makes it ineligible for wholesale removal.
    fn holds_protected(&self, node: &MaterializedNode) -> bool {
        match node {
            MaterializedNode::Checkpoint(_) => true,
            MaterializedNode::Text(text) => self.pinned.contains(&text.id),
            MaterializedNode::Image(image) => self.pinned.contains(&image.id),
            MaterializedNode::Opaque(opaque) => self.pinned.contains(&opaque.id),
            other => other
                .children()
                .iter()
                .any(|child| self.holds_protected(child)),
        }
    }

    fn min_removable(&self, node: &MaterializedNode) -> Option<f64> {
        match node {
            MaterializedNode::Checkpoint(_) => None,
            MaterializedNode::Text(_)
            | MaterializedNode::Image(_)
            | MaterializedNode::Opaque(_) => {
                if self.has_removable(node) {
                    Some(node.priority())
                } else {
                    None
                }
            }
            MaterializedNode::Container(container) if container.chunk => {
                if self.has_removable(node) {
                    Some(subtree_min_priority(node))
                } else {
                    None
                }
            }
            other => other
                .children()
                .iter()
                .filter_map(|child| self.min_removable(child))
                .min_by(|a, b| a.total_cmp(b)),
        }
    }

    // ===== Removal bookkeeping =====

    fn invalidate_along_path(&mut self, children: &[MaterializedNode], path: &[usize]) {
        let mut current = children;
        for &i in path {
            let node = &current[i];
            if let MaterializedNode::Message(message) = node {
                self.counts.remove(&message.id);
            }
            current = node.children();
        }
    }

    fn note_removed(&mut self, removed: &[MaterializedNode]) {
        for node in removed {
            self.note_removed_node(node);
        }
    }

    fn note_removed_node(&mut self, node: &MaterializedNode) {
        match node {
            MaterializedNode::Message(message) => {
                self.counts.remove(&message.id);
            }
            MaterializedNode::Container(container) => {
                if let Some(group) = container.keep_with {
                    self.pending_groups.push(group);
                }
            }
            _ => {}
        }
        for child in node.children() {
            self.note_removed_node(child);
        }
    }

    /// A keep-with member that was removed (or emptied out) takes every
    /// other member of its group with it, transitively across groups.
    /// Members that would drag pinned content or a checkpoint along are
    /// left in place.
    fn apply_cascades(&mut self, root: &mut MContainer) {
        while let Some(group) = self.pending_groups.pop() {
            if !self.cascaded_groups.insert(group) {
                continue;
            }
            let members = self.keep_with.get(&group).cloned().unwrap_or_default();
            for member in members {
                let Some(path) = find_path_by_id(&root.children, member) else {
                    continue;
                };
                if self.holds_protected(resolve(&root.children, &path)) {
                    continue;
                }
                trace!(group, member, "removing keep-with member");
                self.invalidate_along_path(&root.children, &path);
                let removed = remove_with_cleanup(&mut root.children, path);
                self.note_removed(&removed);
            }
        }
    }

    // ===== Token accounting =====

    fn message_upper(&mut self, message: &MMessage) -> usize {
        if let Some(counts) = self.counts.get(&message.id) {
            return counts.upper;
        }
        let mut upper = self.overhead.per_message;
        if message.name.is_some() {
            upper += self.overhead.per_name;
        }
        upper += leaf_token_sum_of(&message.children);
        upper += self
            .tool_call_tokens
            .get(&message.id)
            .copied()
            .unwrap_or(0);
        self.counts.insert(
            message.id,
            MessageCounts {
                upper,
                precise: None,
            },
        );
        upper
    }

    fn total_upper(&mut self, root: &MContainer) -> usize {
        let mut total = self.overhead.per_completion;
        for message in root.collect_messages() {
            total += self.message_upper(message);
        }
        total
    }

    async fn total_precise(&mut self, root: &MContainer) -> Result<usize> {
        let mut total = self.overhead.per_completion;
        for message in root.collect_messages() {
            total += self.message_precise(message).await?;
        }
        Ok(total)
    }

    async fn message_precise(&mut self, message: &MMessage) -> Result<usize> {
        if let Some(counts) = self.counts.get(&message.id) {
            if let Some(precise) = counts.precise {
                return Ok(precise);
            }
        }
        let raw = assemble_message(message);
        let precise = self
            .tokenizer
            .count_message_tokens(&raw, &self.cancel)
            .await?;
        let upper = self.message_upper(message);
        self.counts.insert(
            message.id,
            MessageCounts {
                upper,
                precise: Some(precise),
            },
        );
        Ok(precise)
    }
}

// ===== Tree walking helpers =====

fn collect_pinned(node: &MaterializedNode, pinned: &mut HashSet<NodeId>) {
    match node {
        MaterializedNode::Message(message) => {
            let mut leaves = Vec::new();
            leaf_sequence(&message.children, &mut leaves);
            if let Some(last_checkpoint) = leaves.iter().rposition(|(_, is_checkpoint)| *is_checkpoint)
            {
                for (id, is_checkpoint) in &leaves[..last_checkpoint] {
                    if !is_checkpoint {
                        pinned.insert(*id);
                    }
                }
            }
        }
        MaterializedNode::Container(container) => {
            for child in &container.children {
                collect_pinned(child, pinned);
            }
        }
        _ => {}
    }
}

fn leaf_sequence(children: &[MaterializedNode], out: &mut Vec<(NodeId, bool)>) {
    for child in children {
        match child {
            MaterializedNode::Text(text) => out.push((text.id, false)),
            MaterializedNode::Image(image) => out.push((image.id, false)),
            MaterializedNode::Opaque(opaque) => out.push((opaque.id, false)),
            MaterializedNode::Checkpoint(checkpoint) => out.push((checkpoint.id, true)),
            other => leaf_sequence(other.children(), out),
        }
    }
}

fn leaf_token_sum(node: &MaterializedNode) -> usize {
    match node {
        MaterializedNode::Text(text) => text.tokens,
        MaterializedNode::Image(image) => image.tokens,
        MaterializedNode::Opaque(opaque) => opaque.tokens,
        MaterializedNode::Checkpoint(_) => 0,
        other => leaf_token_sum_of(other.children()),
    }
}

fn leaf_token_sum_of(children: &[MaterializedNode]) -> usize {
    children.iter().map(leaf_token_sum).sum()
}

fn subtree_min_priority(node: &MaterializedNode) -> f64 {
    let mut min = node.priority();
    for child in node.children() {
        min = min.min(subtree_min_priority(child));
    }
    min
}

fn limit_scopes_post_order(children: &[MaterializedNode], out: &mut Vec<(NodeId, usize)>) {
    for child in children {
        limit_scopes_post_order(child.children(), out);
        if let MaterializedNode::Container(container) = child {
            if let Some((_, max)) = &container.token_limit {
                out.push((container.id, *max));
            }
        }
    }
}

fn resolve<'a>(children: &'a [MaterializedNode], path: &[usize]) -> &'a MaterializedNode {
    let mut node = &children[path[0]];
    for &i in &path[1..] {
        node = &node.children()[i];
    }
    node
}

fn find_path_by_id(children: &[MaterializedNode], id: NodeId) -> Option<Vec<usize>> {
    for (i, child) in children.iter().enumerate() {
        if child.id() == id {
            return Some(vec![i]);
        }
        if let Some(mut sub) = find_path_by_id(child.children(), id) {
            let mut path = vec![i];
            path.append(&mut sub);
            return Some(path);
        }
    }
    None
}

fn remove_path(children: &mut Vec<MaterializedNode>, path: &[usize]) -> MaterializedNode {
    if path.len() == 1 {
        return children.remove(path[0]);
    }
    let child = children[path[0]]
        .children_mut()
        .expect("interior path nodes hold children");
    remove_path(child, &path[1..])
}

/// Remove the node at `path`, then remove any ancestors the removal left
/// empty (stopping at the scope root).
fn remove_with_cleanup(
    scope_children: &mut Vec<MaterializedNode>,
    mut path: Vec<usize>,
) -> Vec<MaterializedNode> {
    let mut removed = vec![remove_path(scope_children, &path)];
    path.pop();
    while !path.is_empty() {
        let node = resolve(scope_children, &path);
        let emptied = matches!(
            node,
            MaterializedNode::Container(_) | MaterializedNode::Message(_)
        ) && node.children().is_empty();
        if !emptied {
            break;
        }
        removed.push(remove_path(scope_children, &path));
        path.pop();
    }
    removed
}
