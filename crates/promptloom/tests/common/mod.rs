//! Shared fixtures for the integration suite
//!
//! The heuristic tokenizer makes sizes exact: a text of `4 * n - 1`
//! characters costs `n` tokens as a fragment, each message adds 3 tokens
//! of framing (plus 1 for a name), and the completion adds 3 more.

#![allow(dead_code)]

use promptloom::protocol::HeuristicTokenizer;
use promptloom::{
    Element, Endpoint, Node, PromptRenderer, Result, Sizing, State, async_trait,
};
use std::sync::{Arc, Mutex};

/// A renderer over the deterministic heuristic tokenizer.
pub fn renderer(budget: usize) -> PromptRenderer {
    PromptRenderer::new(Endpoint::new(budget), Arc::new(HeuristicTokenizer::new()))
}

/// Text that costs exactly `tokens` under the heuristic tokenizer.
pub fn text_of_tokens(tokens: usize) -> String {
    if tokens == 0 {
        return String::new();
    }
    "x".repeat(4 * tokens - 1)
}

/// Shared log of `(label, observed budget)` pairs.
pub type BudgetLog = Arc<Mutex<Vec<(&'static str, usize)>>>;

pub fn budget_log() -> BudgetLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries_for(log: &BudgetLog, label: &str) -> Vec<usize> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(l, _)| *l == label)
        .map(|(_, budget)| *budget)
        .collect()
}

/// Renders a fixed string.
pub struct FixedText(pub &'static str);

#[async_trait]
impl Element for FixedText {
    async fn render(&self, _state: &State, _sizing: &Sizing) -> Result<Node> {
        Ok(Node::text(self.0))
    }
}

/// Consumes an exact number of tokens regardless of its budget, recording
/// the budget it was offered.
pub struct FixedUse {
    pub label: &'static str,
    pub tokens: usize,
    pub log: BudgetLog,
}

#[async_trait]
impl Element for FixedUse {
    async fn render(&self, _state: &State, sizing: &Sizing) -> Result<Node> {
        self.log
            .lock()
            .unwrap()
            .push((self.label, sizing.token_budget()));
        if self.tokens == 0 {
            return Ok(Node::fragment(Vec::new()));
        }
        Ok(Node::text(text_of_tokens(self.tokens)))
    }
}

/// Fills its budget, leaving `headroom` tokens unused, and records every
/// budget it renders against.
pub struct Filler {
    pub label: &'static str,
    pub headroom: usize,
    pub log: BudgetLog,
}

#[async_trait]
impl Element for Filler {
    async fn render(&self, _state: &State, sizing: &Sizing) -> Result<Node> {
        self.log
            .lock()
            .unwrap()
            .push((self.label, sizing.token_budget()));
        let tokens = sizing.token_budget().saturating_sub(self.headroom);
        if tokens == 0 {
            return Ok(Node::fragment(Vec::new()));
        }
        Ok(Node::text(text_of_tokens(tokens)))
    }
}

/// An element whose `prepare` counts a phrase with the render tokenizer
/// and whose `render` reports what it measured.
pub struct MeasuredText {
    pub text: &'static str,
}

struct Measured {
    tokens: usize,
}

#[async_trait]
impl Element for MeasuredText {
    async fn prepare(&self, sizing: &Sizing) -> Result<State> {
        let tokens = sizing.count_tokens(self.text).await?;
        Ok(State::new(Measured { tokens }))
    }

    async fn render(&self, state: &State, _sizing: &Sizing) -> Result<Node> {
        let measured = state.get::<Measured>().expect("prepared state");
        Ok(Node::text(format!("{} [{}]", self.text, measured.tokens)))
    }
}
