//! Bounded context assembly for planctx.
//!
//! | Part | Source | Trim strategy |
//! |------|--------|---------------|
//! | Messages | Conversation history | Oldest dropped first, long ones summarized |
//! | Memory | Vector store | Lowest similarity dropped |
//! | Plan | Plan metadata | Finished and stale entries dropped first |
//!
//! Each part gets a share of the overall ceiling from the
//! [`TokenBudgetAllocator`].

pub mod budget;
pub mod builder;
pub mod token;

pub use budget::{BudgetAllocation, TokenBudgetAllocator};
pub use builder::{
    ContextBuilder, ContextExcerpt, ContextPart, ContextRequest, ContextResult, SourceRequest,
};
pub use token::{HeuristicTokenizer, estimate_tokens};
