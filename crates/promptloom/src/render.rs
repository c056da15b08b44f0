//! Render entry points
//!
//! [`PromptRenderer`] wires the pipeline together: scheduling, growable
//! expansion, materialization, pruning, and emission. A renderer is
//! configured once and renders a single tree; there is no state shared
//! between renders.

use crate::emit::emit;
use crate::error::{Error, Result};
use crate::json::JsonElement;
use crate::materialize::{materialize, materialize_document};
use crate::meta::{Metadata, Reference, UsedContext};
use crate::node::Node;
use crate::prune::prune;
use crate::scheduler::Scheduler;
use crate::sizing::Endpoint;
use promptloom_protocol::{RawMessage, Tokenizer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Rendering options beyond the endpoint budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Select the flat, scope-blind prioritization kept for backwards
    /// compatibility with old prompt declarations.
    pub legacy_prioritization: bool,
}

impl RenderOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable the legacy flat prioritization.
    pub fn with_legacy_prioritization(mut self, legacy: bool) -> Self {
        self.legacy_prioritization = legacy;
        self
    }
}

/// Phase notifications published while a render runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    /// The first render pass finished with this many tokens consumed.
    TreeRendered {
        /// Tokens consumed by the pass.
        consumed: usize,
    },

    /// Growable expansion finished with this many tokens consumed.
    GrowablesExpanded {
        /// Tokens consumed after expansion.
        consumed: usize,
    },

    /// Pruning finished after this many removal steps.
    Pruned {
        /// Number of nodes removed.
        removed: usize,
    },

    /// The render completed with this final token count.
    Complete {
        /// Precise token count of the emitted messages.
        token_count: usize,
    },
}

/// A sink for [`ProgressUpdate`] notifications.
pub trait Progress: Send + Sync {
    /// Receive one phase notification.
    fn report(&self, update: ProgressUpdate);
}

/// Everything a render produces.
#[derive(Debug, Clone)]
pub struct RenderResult {
    /// The ordered chat messages.
    pub messages: Vec<RawMessage>,

    /// Precise token count of `messages`, completion framing included.
    pub token_count: usize,

    /// Global metadata plus local metadata whose chunks survived.
    pub metadata: Vec<Metadata>,

    /// Used-context records that survived pruning.
    pub used_context: Vec<UsedContext>,

    /// References whose content survived pruning, unique by variable name.
    pub references: Vec<Reference>,

    /// References whose content was pruned away.
    pub omitted_references: Vec<Reference>,

    /// Whether any surviving node declared ignored files.
    pub has_ignored_files: bool,
}

/// Renders an authored prompt tree into a budgeted message list.
pub struct PromptRenderer {
    endpoint: Endpoint,
    tokenizer: Arc<dyn Tokenizer>,
    options: RenderOptions,
    progress: Option<Arc<dyn Progress>>,
    cancel: CancellationToken,
}

impl PromptRenderer {
    /// Create a renderer for an endpoint and tokenizer.
    pub fn new(endpoint: Endpoint, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            endpoint,
            tokenizer,
            options: RenderOptions::default(),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the rendering options.
    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a progress sink.
    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Attach a cancellation token observed at every suspension point.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn report(&self, update: ProgressUpdate) {
        if let Some(progress) = &self.progress {
            progress.report(update);
        }
    }

    /// Render the tree into the final message list.
    ///
    /// The endpoint budget is distributed over the tree, growables are
    /// expanded into the surplus, and the result is pruned until it fits.
    pub async fn render(&self, root: Node) -> Result<RenderResult> {
        let budget = self.endpoint.model_max_prompt_tokens;
        let scheduler = Scheduler::new(
            Arc::clone(&self.tokenizer),
            self.endpoint,
            self.cancel.clone(),
        );

        let mut scheduled = scheduler.run(root, budget).await?;
        self.report(ProgressUpdate::TreeRendered {
            consumed: scheduled.consumed,
        });

        scheduler
            .expand(&mut scheduled.root, &mut scheduled.consumed, budget)
            .await?;
        self.report(ProgressUpdate::GrowablesExpanded {
            consumed: scheduled.consumed,
        });

        let mut materialized = materialize(scheduled.root)?;
        let removed = prune(
            &mut materialized,
            Arc::clone(&self.tokenizer),
            budget,
            self.options.legacy_prioritization,
            self.cancel.clone(),
        )
        .await?;
        self.report(ProgressUpdate::Pruned { removed });

        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let emitted = emit(&materialized, &self.tokenizer, &self.cancel).await?;
        self.report(ProgressUpdate::Complete {
            token_count: emitted.token_count,
        });
        debug!(
            messages = emitted.messages.len(),
            token_count = emitted.token_count,
            removed,
            "render finished"
        );

        Ok(RenderResult {
            messages: emitted.messages,
            token_count: emitted.token_count,
            metadata: emitted.metadata,
            used_context: emitted.used_context,
            references: emitted.references,
            omitted_references: emitted.omitted_references,
            has_ignored_files: emitted.has_ignored_files,
        })
    }

    /// Render a subtree to a serialized document without pruning. The
    /// budget is advisory; the document can later be spliced into another
    /// tree, where its priorities are rebased into the splice parent's
    /// slot.
    pub async fn render_json(&self, root: Node) -> Result<JsonElement> {
        let budget = self.endpoint.model_max_prompt_tokens;
        let scheduler = Scheduler::new(
            Arc::clone(&self.tokenizer),
            self.endpoint,
            self.cancel.clone(),
        );

        let mut scheduled = scheduler.run(root, budget).await?;
        scheduler
            .expand(&mut scheduled.root, &mut scheduled.consumed, budget)
            .await?;
        let materialized = materialize_document(scheduled.root)?;
        Ok(JsonElement::from_root(&materialized.root))
    }
}
