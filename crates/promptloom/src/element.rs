//! User-defined prompt elements
//!
//! An [`Element`] is the unit of composition authors implement: an optional
//! asynchronous [`prepare`](Element::prepare) step that may inspect the
//! element's token budget, followed by a [`render`](Element::render) that
//! returns the element's children. Elements are invoked once per render;
//! an element wrapped as growable may be rendered a second time with the
//! leftover budget.

use crate::error::Result;
use crate::node::Node;
use crate::sizing::Sizing;
use async_trait::async_trait;
use std::any::Any;

/// Priority assigned to nodes that do not declare one: the largest integer
/// an `f64` mantissa represents exactly. Undeclared nodes are pruned last.
pub const DEFAULT_PRIORITY: f64 = 9_007_199_254_740_991.0;

/// Common layout and pruning hints carried by every non-literal node.
#[derive(Debug, Clone, PartialEq)]
pub struct Props {
    /// Pruning priority; lower values are removed first. `None` resolves to
    /// [`DEFAULT_PRIORITY`].
    pub priority: Option<u64>,

    /// Proportional weight when the enclosing budget is split between
    /// siblings of the same flex group.
    pub flex_basis: f64,

    /// Flex group key. Group 0 is budgeted and rendered first; higher
    /// groups render afterwards against whatever budget remains.
    pub flex_grow: u32,

    /// Budget withheld from earlier groups on behalf of this child.
    pub flex_reserve: FlexReserve,

    /// Make this container transparent to pruning: its children compete
    /// directly with the container's siblings.
    pub pass_priority: bool,
}

impl Default for Props {
    fn default() -> Self {
        Self {
            priority: None,
            flex_basis: 1.0,
            flex_grow: 0,
            flex_reserve: FlexReserve::None,
            pass_priority: false,
        }
    }
}

impl Props {
    /// Create props with all defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pruning priority.
    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the proportional budget weight.
    pub fn with_flex_basis(mut self, basis: f64) -> Self {
        self.flex_basis = basis;
        self
    }

    /// Set the flex group key.
    pub fn with_flex_grow(mut self, grow: u32) -> Self {
        self.flex_grow = grow;
        self
    }

    /// Set the reserved budget share.
    pub fn with_flex_reserve(mut self, reserve: FlexReserve) -> Self {
        self.flex_reserve = reserve;
        self
    }

    /// Mark the node as transparent to pruning.
    pub fn with_pass_priority(mut self, pass: bool) -> Self {
        self.pass_priority = pass;
        self
    }

    pub(crate) fn effective_priority(&self) -> f64 {
        self.priority.map(|p| p as f64).unwrap_or(DEFAULT_PRIORITY)
    }
}

/// Budget withheld for a later-rendered flex child while earlier groups are
/// being budgeted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlexReserve {
    /// Reserve nothing.
    #[default]
    None,

    /// Reserve a fixed number of tokens.
    Tokens(usize),

    /// Reserve one N-th of the budget remaining when the reservation is
    /// taken.
    Fraction(u32),
}

impl FlexReserve {
    pub(crate) fn resolve(&self, remaining: usize) -> usize {
        match *self {
            FlexReserve::None => 0,
            FlexReserve::Tokens(tokens) => tokens,
            FlexReserve::Fraction(denominator) => {
                if denominator == 0 {
                    0
                } else {
                    remaining / denominator as usize
                }
            }
        }
    }
}

/// Type-erased state produced by [`Element::prepare`] and handed back to
/// [`Element::render`].
#[derive(Default)]
pub struct State(Option<Box<dyn Any + Send + Sync>>);

impl State {
    /// Wrap a prepared value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    /// State for elements that prepare nothing.
    pub fn empty() -> Self {
        Self(None)
    }

    /// Borrow the prepared value, if it has the expected type.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|any| any.downcast_ref())
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("State")
            .field(&self.0.as_ref().map(|_| "..."))
            .finish()
    }
}

/// A user-defined unit of prompt composition.
#[async_trait]
pub trait Element: Send + Sync {
    /// Gather whatever the element needs before rendering. Runs in parallel
    /// with the `prepare` of every sibling in the same flex group and may
    /// inspect the budget through `sizing`.
    async fn prepare(&self, sizing: &Sizing) -> Result<State> {
        let _ = sizing;
        Ok(State::empty())
    }

    /// Produce the element's children. The returned node may be a
    /// [`Node::Fragment`] to yield several pieces.
    async fn render(&self, state: &State, sizing: &Sizing) -> Result<Node>;
}
