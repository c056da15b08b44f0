//! Property-based tests for the composition engine
//!
//! Uses proptest to generate random trees, budgets, and priorities, and
//! verifies the invariants the engine promises: budgets are respected,
//! declaration order survives, renders are deterministic, and priority
//! rebasing keeps spliced content inside its parent's slot.

#[cfg(test)]
mod tests {
    use crate::json::{JSON_ELEMENT_VERSION, JsonElement, JsonNode};
    use crate::materialize::LineBreakBefore;
    use crate::node::Node;
    use crate::render::PromptRenderer;
    use crate::sizing::Endpoint;
    use futures::executor::block_on;
    use promptloom_protocol::HeuristicTokenizer;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn renderer(budget: usize) -> PromptRenderer {
        PromptRenderer::new(Endpoint::new(budget), Arc::new(HeuristicTokenizer::new()))
    }

    fn chunk_tree(chunks: &[(String, u64)]) -> Node {
        Node::user_message(
            chunks
                .iter()
                .map(|(text, priority)| Node::text_chunk(text.clone(), *priority))
                .collect(),
        )
    }

    fn arb_chunks() -> impl Strategy<Value = Vec<(String, u64)>> {
        proptest::collection::vec(("[a-z]{2,12}", 0u64..1_000u64), 1..12)
    }

    proptest! {
        /// Property: the emitted token count never exceeds the budget.
        /// Invariant: pruning continues until both counts fit.
        #[test]
        fn prop_token_count_within_budget(
            chunks in arb_chunks(),
            budget in 10usize..200usize,
        ) {
            let result = block_on(renderer(budget).render(chunk_tree(&chunks)))
                .expect("render succeeds");
            prop_assert!(
                result.token_count <= budget,
                "token count {} exceeds budget {}",
                result.token_count,
                budget
            );
        }

        /// Property: surviving chunks keep their declaration order.
        /// Invariant: pruning removes content but never reorders it.
        #[test]
        fn prop_declaration_order_preserved(
            chunks in arb_chunks(),
            budget in 10usize..200usize,
        ) {
            // Digit-bearing markers cannot collide with the letter-only
            // chunk texts, so each position is unambiguous.
            let marked: Vec<(String, u64)> = chunks
                .iter()
                .enumerate()
                .map(|(i, (text, priority))| (format!("m{i:02}x{text}"), *priority))
                .collect();

            let result = block_on(renderer(budget).render(chunk_tree(&marked)))
                .expect("render succeeds");
            let text: String = result
                .messages
                .iter()
                .map(|message| message.text())
                .collect();

            let mut last_position = None;
            for (i, _) in marked.iter().enumerate() {
                let marker = format!("m{i:02}x");
                if let Some(position) = text.find(&marker) {
                    if let Some(last) = last_position {
                        prop_assert!(
                            position > last,
                            "chunk {marker:?} appeared out of order"
                        );
                    }
                    last_position = Some(position);
                }
            }
        }

        /// Property: rendering identical inputs twice yields identical
        /// messages and token counts.
        #[test]
        fn prop_render_is_deterministic(
            chunks in arb_chunks(),
            budget in 10usize..200usize,
        ) {
            let tree = chunk_tree(&chunks);
            let first = block_on(renderer(budget).render(tree.clone()))
                .expect("first render succeeds");
            let second = block_on(renderer(budget).render(tree))
                .expect("second render succeeds");
            prop_assert_eq!(first.messages, second.messages);
            prop_assert_eq!(first.token_count, second.token_count);
        }

        /// Property: splice rebasing lands every priority in the parent's
        /// slot and preserves relative order.
        #[test]
        fn prop_rebased_priorities_stay_in_slot(
            priorities in proptest::collection::vec(0u32..10_000u32, 1..16),
            parent in 0u32..1_000u32,
        ) {
            let document = JsonElement {
                version: JSON_ELEMENT_VERSION,
                node: JsonNode::Container {
                    priority: 0.0,
                    chunk: false,
                    pass_priority: false,
                    token_limit: None,
                    keep_with: None,
                    metadata: Vec::new(),
                    references: Vec::new(),
                    used_context: Vec::new(),
                    ignored_files: Vec::new(),
                    children: priorities
                        .iter()
                        .map(|&p| JsonNode::Text {
                            text: "x".into(),
                            priority: p as f64,
                            tokens: 1,
                            line_break_before: LineBreakBefore::None,
                            metadata: Vec::new(),
                            references: Vec::new(),
                        })
                        .collect(),
                },
            };

            let counter = std::sync::atomic::AtomicU64::new(1);
            let outcome = crate::json::splice_into_tree(
                &document,
                parent as f64,
                0,
                &|| counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            )
            .expect("splice succeeds");

            let rebased: Vec<f64> = outcome
                .node
                .children
                .iter()
                .map(|child| match &child.kind {
                    crate::tree::TreeKind::Text(text) => text.priority,
                    _ => unreachable!("document holds only text children"),
                })
                .collect();

            for value in &rebased {
                prop_assert!(*value >= parent as f64 && *value < parent as f64 + 1.0);
            }
            for (a, b) in priorities.iter().zip(priorities.iter().skip(1)) {
                let (ra, rb) = (
                    rebased[priorities.iter().position(|p| p == a).unwrap()],
                    rebased[priorities.iter().position(|p| p == b).unwrap()],
                );
                if a < b {
                    prop_assert!(ra < rb);
                }
            }
        }
    }
}
