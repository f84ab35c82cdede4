//! # planctx core
//!
//! Domain types, traits, and error definitions for planctx: bounded
//! context assembly over conversation history, retrieved memory and plan
//! metadata, plus the lifecycle of the jobs that produce it.
//!
//! Every subsystem is defined as a trait here. Implementations live in
//! their respective crates (`planctx-memory`, `planctx-jobs`), and
//! collaborators (tokenizer, summarizer, embedding generator, data
//! sources) are supplied by the embedding application.

pub mod collaborator;
pub mod error;
pub mod job;
pub mod memory;
pub mod message;
pub mod plan;

// Re-export key types at crate root for ergonomics
pub use collaborator::{EmbeddingGenerator, MessageSource, PlanSource, Summarizer, Tokenizer};
pub use error::{Error, JobError, Result, StoreError, UpstreamError};
pub use job::{
    JobPayload, JobRecord, JobResult, JobResultMetadata, JobState, JobStore, StateChange,
    TransitionOutcome,
};
pub use memory::{
    EmbeddingRecord, NearestQuery, ReferenceKey, ScoredRecord, SoftDelete, UpsertRequest,
    VectorStore,
};
pub use message::{Conversation, ConversationId, Message, Role};
pub use plan::PlanEntry;
