//! Per-scope budget accounting
//!
//! A [`Sizing`] is the view an element receives of the budget assigned to
//! it: the token allowance for its subtree, the endpoint being targeted,
//! and a counting helper backed by the render's tokenizer. Each child of a
//! scope renders against its own sizing; the scheduler owns the mutable
//! consumption counters.

use crate::error::{Error, Result};
use promptloom_protocol::{ContentPart, Tokenizer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Description of the endpoint a prompt is being composed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Maximum prompt tokens the target model accepts.
    pub model_max_prompt_tokens: usize,
}

impl Endpoint {
    /// Create an endpoint descriptor.
    pub fn new(model_max_prompt_tokens: usize) -> Self {
        Self {
            model_max_prompt_tokens,
        }
    }
}

/// The budget view handed to `prepare` and `render`.
#[derive(Clone)]
pub struct Sizing {
    token_budget: usize,
    endpoint: Endpoint,
    tokenizer: Arc<dyn Tokenizer>,
    cancel: CancellationToken,
}

impl Sizing {
    pub(crate) fn new(
        token_budget: usize,
        endpoint: Endpoint,
        tokenizer: Arc<dyn Tokenizer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            token_budget,
            endpoint,
            tokenizer,
            cancel,
        }
    }

    /// Derive a sizing for a sub-scope with its own budget.
    pub(crate) fn with_budget(&self, token_budget: usize) -> Self {
        Self {
            token_budget,
            ..self.clone()
        }
    }

    /// Tokens this subtree is allowed to consume.
    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// The endpoint the prompt targets.
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// The render's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Count the tokens of a text fragment with the render's tokenizer.
    pub async fn count_tokens(&self, text: &str) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let part = ContentPart::text(text);
        Ok(self.tokenizer.token_length(&part, &self.cancel).await?)
    }

    /// Count the tokens of an arbitrary content fragment.
    pub async fn count_part_tokens(&self, part: &ContentPart) -> Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(self.tokenizer.token_length(part, &self.cancel).await?)
    }
}

impl std::fmt::Debug for Sizing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sizing")
            .field("token_budget", &self.token_budget)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_protocol::HeuristicTokenizer;

    fn sizing(budget: usize) -> Sizing {
        Sizing::new(
            budget,
            Endpoint::new(budget),
            Arc::new(HeuristicTokenizer::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_count_tokens() {
        let sizing = sizing(100);
        assert_eq!(sizing.token_budget(), 100);
        // 7 chars + separator allowance = 2 tokens under the heuristic
        assert_eq!(sizing.count_tokens("seven!!").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sub_budget_view() {
        let sizing = sizing(100);
        let narrowed = sizing.with_budget(25);
        assert_eq!(narrowed.token_budget(), 25);
        assert_eq!(narrowed.endpoint().model_max_prompt_tokens, 100);
    }

    #[tokio::test]
    async fn test_cancelled_sizing_refuses_counts() {
        let cancel = CancellationToken::new();
        let sizing = Sizing::new(
            10,
            Endpoint::new(10),
            Arc::new(HeuristicTokenizer::new()),
            cancel.clone(),
        );
        cancel.cancel();
        assert!(sizing.count_tokens("x").await.is_err());
    }
}
