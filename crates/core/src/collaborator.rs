//! Collaborator traits: external services the core consumes.
//!
//! Only the input/output contracts live here; implementations are
//! supplied by the embedding application (or by test doubles).

use async_trait::async_trait;
use crate::error::UpstreamError;
use crate::message::Message;
use crate::plan::PlanEntry;

/// Measures text in tokenizer units. Used for all budget enforcement.
#[async_trait]
pub trait Tokenizer: Send + Sync {
    fn name(&self) -> &str;

    async fn count(&self, text: &str) -> Result<usize, UpstreamError>;
}

/// Shortens long text. Best-effort: callers fall back to the raw text.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(&self, text: &str) -> Result<String, UpstreamError>;
}

/// Turns text into an embedding vector.
#[async_trait]
pub trait EmbeddingGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Dimensionality of produced vectors.
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError>;
}

/// Read-only access to conversation history.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Messages of a conversation in chronological order.
    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<Message>, UpstreamError>;
}

/// Read-only access to plan metadata.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn fetch_plan(&self, plan_id: &str) -> Result<Vec<PlanEntry>, UpstreamError>;
}
