//! Emission
//!
//! Walks the pruned tree and produces the final ordered message list.
//! Adjacent text chunks are coalesced into single content parts, with line
//! breaks inserted per chunk policy: always between explicit-break chunks,
//! once between chunks from sibling containers, never between a container
//! chunk and trailing literal text. Messages left with nothing but cache
//! checkpoints are dropped. Side-channel data that survived pruning is
//! collected on the way.

use crate::error::Result;
use crate::materialize::{LineBreakBefore, MMessage, Materialized, MaterializedNode};
use crate::meta::{Metadata, Reference, UsedContext};
use promptloom_protocol::{ContentPart, RawMessage, Tokenizer};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The final product of a render.
#[derive(Debug, Clone)]
pub(crate) struct EmittedPrompt {
    pub messages: Vec<RawMessage>,
    pub token_count: usize,
    pub metadata: Vec<Metadata>,
    pub used_context: Vec<UsedContext>,
    pub references: Vec<Reference>,
    pub omitted_references: Vec<Reference>,
    pub has_ignored_files: bool,
}

/// Assemble the current content of a message into its wire shape. Shared
/// with the pruner, which counts messages in exactly the form they would
/// be emitted.
pub(crate) fn assemble_message(message: &MMessage) -> RawMessage {
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut buffer = String::new();
    let mut previous: Option<LineBreakBefore> = None;

    fn flush(buffer: &mut String, parts: &mut Vec<ContentPart>) {
        if !buffer.is_empty() {
            parts.push(ContentPart::text(std::mem::take(buffer)));
        }
    }

    let mut leaves = Vec::new();
    collect_leaves(&message.children, &mut leaves);
    for leaf in leaves {
        match leaf {
            MaterializedNode::Text(text) => {
                match text.line_break_before {
                    LineBreakBefore::Always => {
                        if previous.is_some()
                            && (!buffer.ends_with('\n')
                                || previous == Some(LineBreakBefore::Always))
                        {
                            buffer.push('\n');
                        }
                    }
                    LineBreakBefore::IfNotTextSibling => {
                        let after_block =
                            previous.is_some_and(|policy| policy != LineBreakBefore::None);
                        if after_block && !buffer.ends_with('\n') {
                            buffer.push('\n');
                        }
                    }
                    LineBreakBefore::None => {}
                }
                buffer.push_str(&text.text);
                previous = Some(text.line_break_before);
            }
            MaterializedNode::Image(image) => {
                flush(&mut buffer, &mut parts);
                parts.push(ContentPart::image(image.url.clone(), image.detail));
                previous = None;
            }
            MaterializedNode::Checkpoint(checkpoint) => {
                flush(&mut buffer, &mut parts);
                parts.push(ContentPart::cache_checkpoint(checkpoint.cache_type));
                previous = None;
            }
            MaterializedNode::Opaque(opaque) => {
                flush(&mut buffer, &mut parts);
                parts.push(ContentPart::opaque(opaque.value.clone()));
                previous = None;
            }
            MaterializedNode::Container(_) | MaterializedNode::Message(_) => {
                unreachable!("leaf collection flattens interior nodes")
            }
        }
    }
    flush(&mut buffer, &mut parts);

    RawMessage {
        role: message.role,
        name: message.name.clone(),
        content: parts,
        tool_calls: message.tool_calls.clone(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn collect_leaves<'a>(children: &'a [MaterializedNode], out: &mut Vec<&'a MaterializedNode>) {
    for child in children {
        match child {
            MaterializedNode::Container(container) => collect_leaves(&container.children, out),
            MaterializedNode::Message(message) => collect_leaves(&message.children, out),
            leaf => out.push(leaf),
        }
    }
}

#[derive(Default)]
struct Collector {
    metadata: Vec<Metadata>,
    references: Vec<Reference>,
    used_context: Vec<UsedContext>,
    has_ignored_files: bool,
}

impl Collector {
    fn add_references(&mut self, references: &[Reference]) {
        for reference in references {
            if self
                .references
                .iter()
                .all(|existing| existing.variable_name != reference.variable_name)
            {
                self.references.push(reference.clone());
            }
        }
    }

    fn visit(&mut self, node: &MaterializedNode) {
        match node {
            MaterializedNode::Container(container) => {
                self.metadata.extend(container.side.metadata.iter().cloned());
                self.add_references(&container.side.references);
                self.used_context
                    .extend(container.side.used_context.iter().cloned());
                self.has_ignored_files |= !container.side.ignored_files.is_empty();
                for child in &container.children {
                    self.visit(child);
                }
            }
            MaterializedNode::Message(message) => {
                self.metadata.extend(message.side.metadata.iter().cloned());
                self.add_references(&message.side.references);
                self.used_context
                    .extend(message.side.used_context.iter().cloned());
                self.has_ignored_files |= !message.side.ignored_files.is_empty();
                for child in &message.children {
                    self.visit(child);
                }
            }
            MaterializedNode::Text(text) => {
                self.metadata.extend(text.metadata.iter().cloned());
                self.add_references(&text.references);
            }
            _ => {}
        }
    }
}

/// Produce the final message list and collected side channels from the
/// pruned tree.
pub(crate) async fn emit(
    materialized: &Materialized,
    tokenizer: &Arc<dyn Tokenizer>,
    cancel: &CancellationToken,
) -> Result<EmittedPrompt> {
    let mut collector = Collector::default();
    collector
        .metadata
        .extend(materialized.root.side.metadata.iter().cloned());
    collector.add_references(&materialized.root.side.references);
    collector
        .used_context
        .extend(materialized.root.side.used_context.iter().cloned());
    collector.has_ignored_files |= !materialized.root.side.ignored_files.is_empty();
    for child in &materialized.root.children {
        collector.visit(child);
    }

    let overhead = tokenizer.overhead();
    let mut messages = Vec::new();
    let mut token_count = overhead.per_completion;
    for message in materialized.root.collect_messages() {
        let raw = assemble_message(message);
        if !raw.has_non_checkpoint_content() {
            continue;
        }
        token_count += tokenizer.count_message_tokens(&raw, cancel).await?;
        messages.push(raw);
    }

    let surviving: HashSet<&str> = collector
        .references
        .iter()
        .map(|reference| reference.variable_name.as_str())
        .collect();
    let mut omitted_references: Vec<Reference> = Vec::new();
    for reference in &materialized.all_references {
        if !surviving.contains(reference.variable_name.as_str())
            && omitted_references
                .iter()
                .all(|existing| existing.variable_name != reference.variable_name)
        {
            omitted_references.push(reference.clone());
        }
    }

    // Global metadata is immune to pruning; surviving local records follow.
    let mut metadata = materialized.global_metadata.clone();
    metadata.extend(collector.metadata);

    debug!(
        messages = messages.len(),
        token_count,
        omitted = omitted_references.len(),
        "emitted prompt"
    );

    Ok(EmittedPrompt {
        messages,
        token_count,
        metadata,
        used_context: collector.used_context,
        references: collector.references,
        omitted_references,
        has_ignored_files: collector.has_ignored_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::DEFAULT_PRIORITY;
    use crate::materialize::{MCheckpoint, MContainer, MText, SideChannel};
    use promptloom_protocol::{CacheType, Role};

    fn chunk(id: u64, text: &str, policy: LineBreakBefore) -> MaterializedNode {
        MaterializedNode::Text(MText {
            id,
            order: id,
            index: id as usize,
            priority: DEFAULT_PRIORITY,
            text: text.to_string(),
            tokens: 1,
            line_break_before: policy,
            metadata: Vec::new(),
            references: Vec::new(),
        })
    }

    fn message(children: Vec<MaterializedNode>) -> MMessage {
        MMessage {
            id: 999,
            order: 0,
            index: 0,
            priority: DEFAULT_PRIORITY,
            role: Role::User,
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
            side: SideChannel::default(),
            children,
        }
    }

    #[test]
    fn test_plain_literals_join_inline() {
        let msg = message(vec![
            chunk(1, "Hello ", LineBreakBefore::None),
            chunk(2, "world", LineBreakBefore::None),
        ]);
        let raw = assemble_message(&msg);
        assert_eq!(raw.text(), "Hello world");
        assert_eq!(raw.content.len(), 1);
    }

    #[test]
    fn test_explicit_break_inserts_newline() {
        let msg = message(vec![
            chunk(1, "first", LineBreakBefore::None),
            chunk(2, "second", LineBreakBefore::Always),
        ]);
        assert_eq!(assemble_message(&msg).text(), "first\nsecond");
    }

    #[test]
    fn test_block_chunks_break_once() {
        let msg = message(vec![
            chunk(1, "alpha", LineBreakBefore::IfNotTextSibling),
            chunk(2, "beta", LineBreakBefore::IfNotTextSibling),
        ]);
        assert_eq!(assemble_message(&msg).text(), "alpha\nbeta");
    }

    #[test]
    fn test_block_then_literal_runs_inline() {
        let msg = message(vec![
            chunk(1, "block", LineBreakBefore::IfNotTextSibling),
            chunk(2, " tail", LineBreakBefore::None),
        ]);
        assert_eq!(assemble_message(&msg).text(), "block tail");
    }

    #[test]
    fn test_literal_then_block_runs_inline() {
        let msg = message(vec![
            chunk(1, "lead", LineBreakBefore::None),
            chunk(2, "block", LineBreakBefore::IfNotTextSibling),
        ]);
        assert_eq!(assemble_message(&msg).text(), "leadblock");
    }

    #[test]
    fn test_checkpoint_splits_text_parts() {
        let msg = message(vec![
            chunk(1, "before", LineBreakBefore::None),
            MaterializedNode::Checkpoint(MCheckpoint {
                id: 2,
                order: 2,
                index: 2,
                cache_type: CacheType::Ephemeral,
            }),
            chunk(3, "after", LineBreakBefore::None),
        ]);
        let raw = assemble_message(&msg);
        assert_eq!(raw.content.len(), 3);
        assert!(matches!(
            raw.content[1],
            ContentPart::CacheCheckpoint { .. }
        ));
    }

    #[test]
    fn test_container_side_channels_survive_with_container() {
        let container = MaterializedNode::Container(MContainer {
            id: 5,
            order: 1,
            index: 0,
            priority: DEFAULT_PRIORITY,
            chunk: false,
            pass_priority: false,
            token_limit: None,
            keep_with: None,
            side: SideChannel {
                metadata: vec![Metadata::local("origin", serde_json::json!("disk"))],
                references: vec![Reference::new("selection")],
                used_context: Vec::new(),
                ignored_files: vec!["secret.env".into()],
            },
            children: vec![chunk(6, "content", LineBreakBefore::None)],
        });
        let mut collector = Collector::default();
        collector.visit(&container);
        assert_eq!(collector.references.len(), 1);
        assert_eq!(collector.metadata.len(), 1);
        assert!(collector.has_ignored_files);
    }

    #[test]
    fn test_references_dedup_by_variable_name() {
        let mut collector = Collector::default();
        collector.add_references(&[
            Reference::new("a"),
            Reference::new("a").with_value(serde_json::json!(2)),
            Reference::new("b"),
        ]);
        assert_eq!(collector.references.len(), 2);
    }
}
