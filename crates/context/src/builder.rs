//! Context builder: assembles conversation history, retrieved memory and
//! plan metadata into a context that fits a token ceiling.
//!
//! # Algorithm
//!
//! 1. Split `max_tokens` into per-part budgets with the allocator
//! 2. Messages: walk the most recent messages newest to oldest, offering
//!    long ones to the summarizer, and stop at the first that does not fit
//! 3. Memory: nearest-neighbour query against the vector store, included
//!    in similarity order until the memory budget runs out
//! 4. Plan: active entries first, then most recently updated
//!
//! Memory and plan sources degrade to an empty part when they fail. A
//! tokenizer failure aborts the build: without counts there is no budget.
//!
//! Builds can be interrupted. Parts finished before the interruption are
//! returned and the result is flagged `partial`.

use crate::budget::{BudgetAllocation, TokenBudgetAllocator};
use planctx_config::{BudgetConfig, ContextConfig};
use planctx_core::collaborator::{
    EmbeddingGenerator, MessageSource, PlanSource, Summarizer, Tokenizer,
};
use planctx_core::error::Result;
use planctx_core::memory::{NearestQuery, VectorStore};
use planctx_core::message::Message;
use planctx_core::plan::PlanEntry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const MESSAGES_PART: &str = "messages";
pub const MEMORY_PART: &str = "memory";
pub const PLAN_PART: &str = "plan";

// ── Types ─────────────────────────────────────────────────────────────────

/// Inputs for one build.
#[derive(Debug, Clone, Default)]
pub struct ContextRequest {
    pub plan_id: String,
    /// Conversation history, oldest first.
    pub messages: Vec<Message>,
    pub plan_entries: Vec<PlanEntry>,
    /// Query embedding for memory retrieval; no vector means no memory part.
    pub query_vector: Option<Vec<f32>>,
    /// Overrides the configured ceiling.
    pub max_tokens: Option<usize>,
}

/// Inputs for [`ContextBuilder::build_from_sources`].
#[derive(Debug, Clone, Default)]
pub struct SourceRequest {
    pub plan_id: String,
    pub conversation_id: String,
    /// Embedded when no `query_vector` is given.
    pub query_text: Option<String>,
    pub query_vector: Option<Vec<f32>>,
    pub max_tokens: Option<usize>,
}

/// One included item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextExcerpt {
    /// Message, embedding or plan entry id
    pub source_id: String,
    /// Role, ref type or entry title
    pub label: String,
    pub text: String,
    pub tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(default)]
    pub summarized: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextPart {
    pub items: Vec<ContextExcerpt>,
    pub tokens: usize,
    /// Candidates left out for lack of budget
    pub dropped: usize,
}

impl ContextPart {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextResult {
    pub messages: ContextPart,
    pub memory: ContextPart,
    pub plan: ContextPart,
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub budget: BudgetAllocation,
    /// The build was interrupted before every part was assembled.
    pub partial: bool,
    /// Parts whose source failed and were left empty.
    pub degraded: Vec<String>,
}

impl ContextResult {
    fn empty(max_tokens: usize, budget: BudgetAllocation) -> Self {
        Self {
            messages: ContextPart::default(),
            memory: ContextPart::default(),
            plan: ContextPart::default(),
            total_tokens: 0,
            max_tokens,
            budget,
            partial: false,
            degraded: Vec::new(),
        }
    }
}

// ── Builder ───────────────────────────────────────────────────────────────

/// Assembles contexts. Holds no per-build state; share it freely.
pub struct ContextBuilder {
    allocator: TokenBudgetAllocator,
    config: ContextConfig,
    tokenizer: Arc<dyn Tokenizer>,
    store: Arc<dyn VectorStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
}

impl ContextBuilder {
    pub fn new(
        budget: &BudgetConfig,
        config: ContextConfig,
        tokenizer: Arc<dyn Tokenizer>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            allocator: TokenBudgetAllocator::new(budget),
            config,
            tokenizer,
            store,
            summarizer: None,
            embedder: None,
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn allocator(&self) -> &TokenBudgetAllocator {
        &self.allocator
    }

    /// Build under the configured deadline (`build_timeout_ms`, 0 = none).
    pub async fn build(&self, request: ContextRequest) -> Result<ContextResult> {
        match self.config.build_timeout_ms {
            0 => self.build_until(request, std::future::pending()).await,
            ms => {
                self.build_until(request, tokio::time::sleep(Duration::from_millis(ms)))
                    .await
            }
        }
    }

    /// Build until done or until `cancel` resolves, whichever comes first.
    pub async fn build_until<C>(&self, request: ContextRequest, cancel: C) -> Result<ContextResult>
    where
        C: Future<Output = ()>,
    {
        let max_tokens = request.max_tokens.unwrap_or(self.config.max_tokens);
        let budget = self.allocator.allocate(max_tokens);
        let mut result = ContextResult::empty(max_tokens, budget);

        let finished = {
            let assemble = self.assemble(&request, &mut result);
            tokio::select! {
                outcome = assemble => {
                    outcome?;
                    true
                }
                _ = cancel => false,
            }
        };

        result.total_tokens = result.messages.tokens + result.memory.tokens + result.plan.tokens;
        if !finished {
            result.partial = true;
            warn!(
                plan_id = %request.plan_id,
                tokens = result.total_tokens,
                "Context build interrupted; returning partial result"
            );
        }

        debug!(
            plan_id = %request.plan_id,
            messages = result.messages.items.len(),
            memory = result.memory.items.len(),
            plan = result.plan.items.len(),
            tokens = result.total_tokens,
            max_tokens,
            "Context built"
        );
        Ok(result)
    }

    /// Fetch history and plan metadata, embed the query text if needed,
    /// then [`build`](Self::build).
    pub async fn build_from_sources(
        &self,
        request: SourceRequest,
        messages: &dyn MessageSource,
        plans: &dyn PlanSource,
    ) -> Result<ContextResult> {
        let mut degraded: Vec<String> = Vec::new();

        let history = match messages.fetch_messages(&request.conversation_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation_id = %request.conversation_id, error = %e, "Message source failed");
                degraded.push(MESSAGES_PART.into());
                Vec::new()
            }
        };

        let plan_entries = match plans.fetch_plan(&request.plan_id).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(plan_id = %request.plan_id, error = %e, "Plan source failed");
                degraded.push(PLAN_PART.into());
                Vec::new()
            }
        };

        let query_vector = match (request.query_vector, request.query_text.as_deref(), &self.embedder) {
            (Some(vector), _, _) => Some(vector),
            (None, Some(text), Some(embedder)) => match embedder.embed(text).await {
                Ok(vector) => Some(vector),
                Err(e) => {
                    warn!(embedder = embedder.name(), error = %e, "Query embedding failed");
                    degraded.push(MEMORY_PART.into());
                    None
                }
            },
            _ => None,
        };

        let mut result = self
            .build(ContextRequest {
                plan_id: request.plan_id,
                messages: history,
                plan_entries,
                query_vector,
                max_tokens: request.max_tokens,
            })
            .await?;

        for part in std::mem::take(&mut result.degraded) {
            if !degraded.contains(&part) {
                degraded.push(part);
            }
        }
        result.degraded = degraded;
        Ok(result)
    }

    async fn assemble(&self, request: &ContextRequest, result: &mut ContextResult) -> Result<()> {
        result.messages = self
            .message_part(&request.messages, result.budget.messages)
            .await?;
        result.memory = self
            .memory_part(
                &request.plan_id,
                request.query_vector.as_deref(),
                result.budget.memory,
                &mut result.degraded,
            )
            .await?;
        result.plan = self
            .plan_part(&request.plan_entries, result.budget.plan)
            .await?;
        Ok(())
    }

    async fn message_part(&self, messages: &[Message], budget: usize) -> Result<ContextPart> {
        let start = messages.len().saturating_sub(self.config.message_limit);
        let recent = &messages[start..];

        let mut part = ContextPart::default();
        let mut kept = Vec::new();
        for (pos, message) in recent.iter().enumerate().rev() {
            let (text, tokens, summarized) = self.condense(message).await?;
            if part.tokens + tokens > budget {
                part.dropped = pos + 1;
                debug!(kept = kept.len(), dropped = part.dropped, budget, "Message budget exhausted");
                break;
            }
            part.tokens += tokens;
            kept.push(ContextExcerpt {
                source_id: message.id.clone(),
                label: message.role.as_str().into(),
                text,
                tokens,
                similarity: None,
                summarized,
            });
        }

        kept.reverse();
        part.items = kept;
        Ok(part)
    }

    /// Text, token count and whether the text is a summary.
    async fn condense(&self, message: &Message) -> Result<(String, usize, bool)> {
        let tokens = self.tokenizer.count(&message.content).await?;
        if tokens <= self.config.long_message_threshold {
            return Ok((message.content.clone(), tokens, false));
        }
        let Some(summarizer) = &self.summarizer else {
            return Ok((message.content.clone(), tokens, false));
        };

        match summarizer.summarize(&message.content).await {
            Ok(summary) => {
                let summary_tokens = self.tokenizer.count(&summary).await?;
                Ok((summary, summary_tokens, true))
            }
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Summarizer failed; keeping original message");
                Ok((message.content.clone(), tokens, false))
            }
        }
    }

    async fn memory_part(
        &self,
        plan_id: &str,
        vector: Option<&[f32]>,
        budget: usize,
        degraded: &mut Vec<String>,
    ) -> Result<ContextPart> {
        let mut part = ContextPart::default();
        let Some(vector) = vector else {
            return Ok(part);
        };

        let query = NearestQuery {
            plan_id: plan_id.to_string(),
            vector: vector.to_vec(),
            top_k: self.config.memory_top_k,
            threshold: self.config.memory_threshold,
        };
        let results = match self.store.query_nearest(query).await {
            Ok(results) => results,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "Memory retrieval failed; continuing without memory");
                degraded.push(MEMORY_PART.into());
                return Ok(part);
            }
        };

        for (pos, scored) in results.iter().enumerate() {
            let tokens = self.tokenizer.count(&scored.record.content).await?;
            if part.tokens + tokens > budget {
                part.dropped = results.len() - pos;
                break;
            }
            part.tokens += tokens;
            part.items.push(ContextExcerpt {
                source_id: scored.record.id.clone(),
                label: scored.record.ref_type.clone(),
                text: scored.record.content.clone(),
                tokens,
                similarity: Some(scored.similarity),
                summarized: false,
            });
        }
        Ok(part)
    }

    async fn plan_part(&self, entries: &[PlanEntry], budget: usize) -> Result<ContextPart> {
        let mut ordered: Vec<&PlanEntry> = entries.iter().collect();
        ordered.sort_by(|a, b| {
            b.active
                .cmp(&a.active)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        ordered.truncate(self.config.plan_entry_limit);

        let mut part = ContextPart::default();
        for (pos, entry) in ordered.iter().enumerate() {
            let text = entry.render();
            let tokens = self.tokenizer.count(&text).await?;
            if part.tokens + tokens > budget {
                part.dropped = ordered.len() - pos;
                break;
            }
            part.tokens += tokens;
            part.items.push(ContextExcerpt {
                source_id: entry.id.clone(),
                label: entry.title.clone(),
                text,
                tokens,
                similarity: None,
                summarized: false,
            });
        }
        Ok(part)
    }
}
