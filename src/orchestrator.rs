//! Request orchestration: query → retrieval → prompt → streamed answer.
//!
//! A [`Pipeline`] holds the shared collaborators and is built once per
//! process. Each chat request gets its own [`GenerationOrchestrator`],
//! which walks the [`Stage`] machine:
//!
//! ```text
//! Idle → Embedding → Retrieving → ReRanking → AssemblingContext
//!      → Generating → ExtractingCitations → Done
//!
//! any non-terminal stage → Error
//! ```
//!
//! Embedding, retrieval and generation run under their own deadlines. A
//! generation deadline is not an error: the partial answer is returned
//! with `truncated = true`. The deadline also bounds how long a token waits
//! on a full event channel; a receiver that stalls past it gets no further
//! events. Cancellation (the token, or the event receiver
//! going away) drops the token stream at once and ends in
//! [`OrchestratorError::Cancelled`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vault_rag_core::assemble::ContextAssembler;
use vault_rag_core::citation;
use vault_rag_core::embedding::Embedder;
use vault_rag_core::error::{EmbeddingError, GenerationError, RagError};
use vault_rag_core::generation::Generator;
use vault_rag_core::index::ChunkStore;
use vault_rag_core::models::{Citation, Query, RetrievedChunk, SearchFilter, Turn};
use vault_rag_core::prompt::{PromptBuilder, DEFAULT_SYSTEM_PROMPT};
use vault_rag_core::rerank::ReRanker;
use vault_rag_core::retrieve::{HybridRetriever, RetrievalWarning};

use crate::config::{Config, GenerationConfig};
use crate::embedding::create_embedder;
use crate::llm::{create_generator, PROVIDERS};
use crate::sqlite_index::SqliteIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Embedding,
    Retrieving,
    ReRanking,
    AssemblingContext,
    Generating,
    ExtractingCitations,
    Done,
    Error,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Error)
    }

    pub fn can_transition_to(self, next: Stage) -> bool {
        use Stage::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Error)
                | (Idle, Embedding)
                | (Embedding, Retrieving)
                | (Retrieving, ReRanking)
                | (ReRanking, AssemblingContext)
                | (AssemblingContext, Generating)
                | (Generating, ExtractingCitations)
                | (ExtractingCitations, Done)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Embedding => "embedding",
            Stage::Retrieving => "retrieving",
            Stage::ReRanking => "re_ranking",
            Stage::AssemblingContext => "assembling_context",
            Stage::Generating => "generating",
            Stage::ExtractingCitations => "extracting_citations",
            Stage::Done => "done",
            Stage::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("query embedding timed out after {0:?}")]
    EmbeddingTimeout(Duration),

    #[error(transparent)]
    Embedding(EmbeddingError),

    #[error("retrieval timed out after {0:?}")]
    RetrievalTimeout(Duration),

    #[error(transparent)]
    Retrieval(RagError),

    /// Nothing could be retrieved and at least one index was unavailable.
    #[error("no context available: {0}")]
    NoContext(String),

    #[error(transparent)]
    Generation(GenerationError),

    /// The request asked for a provider or model that cannot be served.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled")]
    Cancelled,
}

impl OrchestratorError {
    /// Stable machine-readable code for API error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::EmbeddingTimeout(_) => "embedding_timeout",
            OrchestratorError::Embedding(_) => "embedding_failed",
            OrchestratorError::RetrievalTimeout(_) => "retrieval_timeout",
            OrchestratorError::Retrieval(_) => "retrieval_failed",
            OrchestratorError::NoContext(_) => "no_context",
            OrchestratorError::Generation(_) => "generation_failed",
            OrchestratorError::InvalidRequest(_) => "invalid_request",
            OrchestratorError::Cancelled => "cancelled",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::EmbeddingTimeout(_) | OrchestratorError::RetrievalTimeout(_) => true,
            OrchestratorError::Embedding(e) => e.is_retryable(),
            OrchestratorError::Retrieval(e) => e.is_retryable(),
            OrchestratorError::NoContext(_) => true,
            OrchestratorError::Generation(GenerationError::Disabled) => false,
            OrchestratorError::Generation(_) => true,
            OrchestratorError::InvalidRequest(_) | OrchestratorError::Cancelled => false,
        }
    }
}

/// Per-stage deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub embed: Duration,
    pub retrieve: Duration,
    pub generate: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            embed: Duration::from_secs(10),
            retrieve: Duration::from_secs(10),
            generate: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Vec<Turn>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub book: Option<String>,
    /// Generation provider for this request only.
    #[serde(default)]
    pub provider: Option<String>,
    /// Generation model for this request only.
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    fn filter(&self) -> SearchFilter {
        SearchFilter {
            category: self.category.clone(),
            book: self.book.clone(),
        }
    }
}

/// A chunk that went into the answer's context, or a search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub category: String,
    pub book: Option<String>,
    pub chapter: Option<String>,
    pub source_path: String,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub combined_score: f64,
    pub final_score: f64,
    pub text: String,
}

impl From<&RetrievedChunk> for Source {
    fn from(rc: &RetrievedChunk) -> Self {
        let meta = &rc.chunk.metadata;
        Self {
            chunk_id: rc.chunk.id.clone(),
            document_id: rc.chunk.document_id.clone(),
            title: meta.title.clone(),
            category: meta.category.clone(),
            book: meta.book.clone(),
            chapter: meta.chapter.clone(),
            source_path: meta.source_path.clone(),
            semantic_score: rc.semantic_score,
            keyword_score: rc.keyword_score,
            combined_score: rc.combined_score,
            final_score: rc.final_score,
            text: rc.chunk.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub message: String,
    pub citations: Vec<Citation>,
    pub sources: Vec<Source>,
    /// The answer was cut short by the generation deadline or a broken
    /// stream.
    pub truncated: bool,
    pub warnings: Vec<RetrievalWarning>,
    pub model: String,
    pub stage_timings: Vec<StageTiming>,
    pub processing_time_ms: u64,
}

/// Ranked results without generation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub hits: Vec<Source>,
    pub warnings: Vec<RetrievalWarning>,
}

/// Progress events for streaming callers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Stage { stage: Stage },
    Token { text: String },
    Done { response: Box<ChatResponse> },
}

/// Shared, immutable collaborators for every request.
pub struct Pipeline {
    retriever: HybridRetriever,
    reranker: ReRanker,
    assembler: ContextAssembler,
    prompt: PromptBuilder,
    generator: Arc<dyn Generator>,
    /// Source of per-request generators; `None` pins every request to
    /// `generator`.
    generation: Option<GenerationConfig>,
    top_k: usize,
    timeouts: Timeouts,
}

impl Pipeline {
    pub fn new(
        retriever: HybridRetriever,
        reranker: ReRanker,
        assembler: ContextAssembler,
        prompt: PromptBuilder,
        generator: Arc<dyn Generator>,
        top_k: usize,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            retriever,
            reranker,
            assembler,
            prompt,
            generator,
            generation: None,
            top_k,
            timeouts,
        }
    }

    /// Allow requests to pick their own provider and model, built from
    /// `config` with the request's choices applied.
    pub fn with_generation_config(mut self, config: GenerationConfig) -> Self {
        self.generation = Some(config);
        self
    }

    /// Wire providers and the SQLite index from configuration.
    pub fn from_config(config: &Config, index: Arc<SqliteIndex>) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = create_embedder(&config.embedding)?;
        let retriever = HybridRetriever::new(
            embedder,
            index.clone(),
            index.clone(),
            index,
            config.retrieval.params(),
        )?;
        let system_prompt = config
            .context
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let o = &config.orchestrator;
        Ok(Self::new(
            retriever,
            ReRanker::new(config.rerank.params(), config.rerank.intent_table()),
            ContextAssembler::new(config.context.token_budget),
            PromptBuilder::new(system_prompt, config.context.history_turns),
            create_generator(&config.generation)?,
            config.retrieval.top_k,
            Timeouts {
                embed: Duration::from_millis(o.embed_timeout_ms),
                retrieve: Duration::from_millis(o.retrieve_timeout_ms),
                generate: Duration::from_secs(o.generate_timeout_secs),
            },
        )
        .with_generation_config(config.generation.clone()))
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        self.retriever.store()
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    pub fn generation_config(&self) -> Option<&GenerationConfig> {
        self.generation.as_ref()
    }

    /// The generator serving `request`: the configured one unless the
    /// request names a provider or model.
    pub fn generator_for(&self, request: &ChatRequest) -> Result<Arc<dyn Generator>, OrchestratorError> {
        if request.provider.is_none() && request.model.is_none() {
            return Ok(self.generator.clone());
        }
        let Some(base) = &self.generation else {
            return Err(OrchestratorError::InvalidRequest(
                "this server does not accept a per-request provider or model".into(),
            ));
        };
        if let Some(provider) = request.provider.as_deref() {
            if !PROVIDERS.contains(&provider) {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "unknown provider '{}' (expected one of: {})",
                    provider,
                    PROVIDERS.join(", ")
                )));
            }
        }
        if let Some(model) = request.model.as_deref() {
            if !base.allows_model(model) {
                return Err(OrchestratorError::InvalidRequest(format!(
                    "model '{}' is not offered (see /api/models)",
                    model
                )));
            }
        }
        let config = base.with_override(request.provider.as_deref(), request.model.as_deref());
        create_generator(&config).map_err(|e| OrchestratorError::InvalidRequest(e.to_string()))
    }

    pub fn orchestrator(
        &self,
        events: Option<mpsc::Sender<StreamEvent>>,
        cancel: CancellationToken,
    ) -> GenerationOrchestrator<'_> {
        GenerationOrchestrator::new(self, events, cancel)
    }

    /// Retrieve and re-rank without generating.
    pub async fn search(&self, query: Query, top_k: usize) -> Result<SearchResults, OrchestratorError> {
        let mut orch = self.orchestrator(None, CancellationToken::new());
        let (ranked, warnings) = orch.retrieve_ranked(query, top_k).await?;
        Ok(SearchResults {
            hits: ranked.iter().map(Source::from).collect(),
            warnings,
        })
    }

    /// Answer one chat request without streaming.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, OrchestratorError> {
        self.orchestrator(None, CancellationToken::new())
            .run(request)
            .await
    }
}

enum Step {
    Cancelled,
    Deadline,
    Item(Option<Result<String, GenerationError>>),
}

struct Generated {
    message: String,
    /// Cut short by the deadline or a broken stream.
    truncated: bool,
    /// The event receiver stopped draining tokens until the deadline.
    receiver_stalled: bool,
}

impl Generated {
    fn new(message: String, truncated: bool) -> Self {
        Self {
            message,
            truncated,
            receiver_stalled: false,
        }
    }
}

/// Drives one request through the stage machine.
pub struct GenerationOrchestrator<'a> {
    pipeline: &'a Pipeline,
    events: Option<mpsc::Sender<StreamEvent>>,
    cancel: CancellationToken,
    stage: Stage,
    stage_started: Instant,
    timings: Vec<StageTiming>,
}

async fn receiver_gone(events: &Option<mpsc::Sender<StreamEvent>>) {
    match events {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

impl<'a> GenerationOrchestrator<'a> {
    fn new(
        pipeline: &'a Pipeline,
        events: Option<mpsc::Sender<StreamEvent>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pipeline,
            events,
            cancel,
            stage: Stage::Idle,
            stage_started: Instant::now(),
            timings: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stage_timings(&self) -> &[StageTiming] {
        &self.timings
    }

    /// Move to `next`, recording how long the current stage took. Illegal
    /// transitions are refused and leave the stage unchanged.
    fn advance(&mut self, next: Stage) -> bool {
        if !self.stage.can_transition_to(next) {
            tracing::error!(from = self.stage.as_str(), to = next.as_str(), "illegal stage transition");
            return false;
        }
        if self.stage != Stage::Idle {
            self.timings.push(StageTiming {
                stage: self.stage,
                elapsed_ms: elapsed_ms(self.stage_started),
            });
        }
        tracing::debug!(from = self.stage.as_str(), to = next.as_str(), "stage");
        self.stage = next;
        self.stage_started = Instant::now();
        true
    }

    async fn enter(&mut self, next: Stage) -> Result<(), OrchestratorError> {
        self.advance(next);
        match self.emit(StreamEvent::Stage { stage: next }).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, err: OrchestratorError) -> OrchestratorError {
        tracing::warn!(stage = self.stage.as_str(), error = %err, "request failed");
        self.advance(Stage::Error);
        err
    }

    /// Send an event, giving up if the request is cancelled meanwhile.
    async fn emit(&self, event: StreamEvent) -> Result<(), OrchestratorError> {
        let Some(tx) = &self.events else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            sent = tx.send(event) => sent.map_err(|_| OrchestratorError::Cancelled),
        }
    }

    /// Like [`emit`](Self::emit), but stop waiting for channel capacity at
    /// `deadline`. Returns `false` if the event was not sent in time.
    async fn emit_until(
        &self,
        event: StreamEvent,
        deadline: tokio::time::Instant,
    ) -> Result<bool, OrchestratorError> {
        let Some(tx) = &self.events else {
            return Ok(true);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            sent = tx.send(event) => sent.map(|()| true).map_err(|_| OrchestratorError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Ok(false),
        }
    }

    /// Await `fut` unless the request is cancelled first.
    async fn guarded<T>(&self, fut: impl std::future::Future<Output = T>) -> Result<T, OrchestratorError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            _ = receiver_gone(&self.events) => Err(OrchestratorError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Embedding, Retrieving and ReRanking.
    pub async fn retrieve_ranked(
        &mut self,
        mut query: Query,
        top_k: usize,
    ) -> Result<(Vec<RetrievedChunk>, Vec<RetrievalWarning>), OrchestratorError> {
        let pipeline = self.pipeline;
        let timeouts = pipeline.timeouts;

        self.enter(Stage::Embedding).await?;
        let embedded = self
            .guarded(tokio::time::timeout(timeouts.embed, pipeline.retriever.embed_query(&query)))
            .await;
        match embedded {
            Ok(Ok(Ok(Some(v)))) => query = query.with_embedding(v),
            Ok(Ok(Ok(None))) => {}
            Ok(Ok(Err(e))) => return Err(self.fail(OrchestratorError::Embedding(e))),
            Ok(Err(_)) => return Err(self.fail(OrchestratorError::EmbeddingTimeout(timeouts.embed))),
            Err(e) => return Err(self.fail(e)),
        }

        self.enter(Stage::Retrieving).await?;
        let retrieved = self
            .guarded(tokio::time::timeout(
                timeouts.retrieve,
                pipeline.retriever.retrieve(&query, top_k),
            ))
            .await;
        let retrieval = match retrieved {
            Ok(Ok(Ok(r))) => r,
            Ok(Ok(Err(e))) => return Err(self.fail(OrchestratorError::Retrieval(e))),
            Ok(Err(_)) => return Err(self.fail(OrchestratorError::RetrievalTimeout(timeouts.retrieve))),
            Err(e) => return Err(self.fail(e)),
        };
        if retrieval.chunks.is_empty() && !retrieval.warnings.is_empty() {
            let reasons: Vec<String> = retrieval.warnings.iter().map(ToString::to_string).collect();
            return Err(self.fail(OrchestratorError::NoContext(reasons.join("; "))));
        }

        self.enter(Stage::ReRanking).await?;
        let ranked = pipeline.reranker.rerank(retrieval.chunks, &query, top_k);
        tracing::debug!(
            semantic = retrieval.semantic_candidates,
            keyword = retrieval.keyword_candidates,
            ranked = ranked.len(),
            "retrieval complete"
        );
        Ok((ranked, retrieval.warnings))
    }

    /// Run the whole request.
    pub async fn run(mut self, request: ChatRequest) -> Result<ChatResponse, OrchestratorError> {
        let started = Instant::now();
        let pipeline = self.pipeline;
        let generator = match pipeline.generator_for(&request) {
            Ok(g) => g,
            Err(e) => return Err(self.fail(e)),
        };
        let conversation_id = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let query = Query::new(request.message.clone())
            .with_filter(request.filter())
            .with_history(request.history.clone());
        let (ranked, warnings) = self.retrieve_ranked(query, pipeline.top_k).await?;

        self.enter(Stage::AssemblingContext).await?;
        let context = pipeline.assembler.assemble(&ranked);
        let prompt = pipeline
            .prompt
            .build(&context, &request.history, &request.message);
        tracing::debug!(
            chunks = context.chunks.len(),
            tokens = context.token_count,
            "context assembled"
        );

        self.enter(Stage::Generating).await?;
        let generated = match self.generate(generator.as_ref(), &prompt).await {
            Ok(out) => out,
            Err(e) => return Err(self.fail(e)),
        };
        if generated.receiver_stalled {
            self.events = None;
        }
        let Generated { message, truncated, .. } = generated;

        self.enter(Stage::ExtractingCitations).await?;
        let citations = citation::extract(&message, &context.chunks);
        let citations = match self
            .guarded(citation::verify_citations(citations, pipeline.store().as_ref()))
            .await
        {
            Ok(c) => c,
            Err(e) => return Err(self.fail(e)),
        };

        self.advance(Stage::Done);
        let response = ChatResponse {
            conversation_id,
            message,
            citations,
            sources: context.chunks.iter().map(Source::from).collect(),
            truncated,
            warnings,
            model: generator.model_name().to_string(),
            stage_timings: self.timings.clone(),
            processing_time_ms: elapsed_ms(started),
        };
        tracing::info!(
            conversation_id = %response.conversation_id,
            citations = response.citations.len(),
            truncated = response.truncated,
            elapsed_ms = response.processing_time_ms,
            "chat complete"
        );
        let done = StreamEvent::Done {
            response: Box::new(response.clone()),
        };
        if self.emit(done).await.is_err() {
            tracing::debug!("receiver gone before the final event");
        }
        Ok(response)
    }

    /// Consume the token stream until it ends, the deadline passes, or the
    /// request is cancelled.
    async fn generate(&self, generator: &dyn Generator, prompt: &str) -> Result<Generated, OrchestratorError> {
        let timeout = self.pipeline.timeouts.generate;
        let deadline = tokio::time::Instant::now() + timeout;

        let started = self
            .guarded(tokio::time::timeout_at(deadline, generator.generate(prompt)))
            .await?;
        let mut stream = match started {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(OrchestratorError::Generation(e)),
            Err(_) => {
                tracing::warn!(?timeout, "generation timed out before the first token");
                return Ok(Generated::new(String::new(), true));
            }
        };

        let mut message = String::new();
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = receiver_gone(&self.events) => Step::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Step::Deadline,
                item = stream.next() => Step::Item(item),
            };
            match step {
                Step::Cancelled => return Err(OrchestratorError::Cancelled),
                Step::Deadline => {
                    tracing::warn!(?timeout, chars = message.len(), "generation timed out; returning partial answer");
                    return Ok(Generated::new(message, true));
                }
                Step::Item(None) => return Ok(Generated::new(message, false)),
                Step::Item(Some(Ok(token))) => {
                    message.push_str(&token);
                    if !self.emit_until(StreamEvent::Token { text: token }, deadline).await? {
                        tracing::warn!(?timeout, chars = message.len(), "event receiver stalled past the generation deadline");
                        return Ok(Generated {
                            message,
                            truncated: true,
                            receiver_stalled: true,
                        });
                    }
                }
                Step::Item(Some(Err(e))) if !message.is_empty() => {
                    tracing::warn!(error = %e, "generation stream broke; returning partial answer");
                    return Ok(Generated::new(message, true));
                }
                Step::Item(Some(Err(e))) => return Err(OrchestratorError::Generation(e)),
            }
        }
    }
}
