//! HTTP API server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/api/stats` | Index counts by category and book |
//! | `GET`  | `/api/models` | Configured generation provider and the choices a chat may make |
//! | `POST` | `/api/search` | Retrieve and re-rank without generation |
//! | `POST` | `/api/chat` | Full answer with citations |
//! | `POST` | `/api/chat/stream` | Server-Sent Events: `stage`, `token`, `done`, `error` |
//!
//! Chat requests may carry `provider` and `model` to override the
//! configured generator for that request only.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Disconnecting from `/api/chat/stream` cancels the request and closes the
//! upstream generation connection.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use vault_rag_core::error::GenerationError;
use vault_rag_core::index::IndexStats;
use vault_rag_core::models::{Query, SearchFilter};

use crate::config::Config;
use crate::db;
use crate::llm::PROVIDERS;
use crate::orchestrator::{
    ChatRequest, ChatResponse, OrchestratorError, Pipeline, SearchResults, StreamEvent,
};
use crate::sqlite_index::SqliteIndex;

const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

/// Bind to `[server].bind` and serve until the process is stopped.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let index = Arc::new(SqliteIndex::new(pool));
    let pipeline = Arc::new(Pipeline::from_config(config, index)?);

    let app = router(AppState::new(pipeline));
    let bind_addr = &config.server.bind;
    tracing::info!(%bind_addr, "server listening");
    println!("vault-rag listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/stats", get(handle_stats))
        .route("/api/models", get(handle_models))
        .route("/api/search", post(handle_search))
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::EmbeddingTimeout(_) | OrchestratorError::RetrievalTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            OrchestratorError::Generation(GenerationError::Disabled)
            | OrchestratorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::Generation(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::Embedding(_)
            | OrchestratorError::Retrieval(_)
            | OrchestratorError::NoContext(_)
            | OrchestratorError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<IndexStats>, AppError> {
    let stats = state
        .pipeline
        .store()
        .stats()
        .await
        .map_err(|e| internal(e.to_string()))?;
    Ok(Json(stats))
}

// ============ GET /api/models ============

#[derive(Debug, Serialize)]
struct ModelsResponse {
    /// `None` when the generator was not built from configuration.
    provider: Option<String>,
    model: String,
    providers: Vec<String>,
    /// Extra models a request may name; empty means any.
    models: Vec<String>,
}

async fn handle_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let pipeline = &state.pipeline;
    let config = pipeline.generation_config();
    let providers = match config {
        Some(_) => PROVIDERS.iter().map(|p| p.to_string()).collect(),
        None => Vec::new(),
    };
    Json(ModelsResponse {
        provider: config.map(|c| c.provider.clone()),
        model: pipeline.generator().model_name().to_string(),
        providers,
        models: config.map(|c| c.models.clone()).unwrap_or_default(),
    })
}

// ============ POST /api/search ============

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    book: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResults>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let limit = req.limit.unwrap_or(state.pipeline.top_k());
    if limit == 0 {
        return Err(bad_request("limit must be >= 1"));
    }
    let query = Query::new(req.query).with_filter(SearchFilter {
        category: req.category,
        book: req.book,
    });
    Ok(Json(state.pipeline.search(query, limit).await?))
}

// ============ POST /api/chat ============

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    Ok(Json(state.pipeline.chat(req).await?))
}

// ============ POST /api/chat/stream ============

#[derive(Serialize)]
struct StreamError {
    code: String,
    message: String,
}

fn sse_event(event: &StreamEvent) -> Event {
    let (name, built) = match event {
        StreamEvent::Stage { stage } => ("stage", Event::default().json_data(serde_json::json!({ "stage": stage }))),
        StreamEvent::Token { text } => ("token", Event::default().json_data(serde_json::json!({ "text": text }))),
        StreamEvent::Done { response } => ("done", Event::default().json_data(response)),
    };
    match built {
        Ok(e) => e.event(name),
        Err(e) => error_event("internal", &e.to_string()),
    }
}

fn error_event(code: &str, message: &str) -> Event {
    let body = StreamError {
        code: code.to_string(),
        message: message.to_string(),
    };
    Event::default()
        .event("error")
        .json_data(body)
        .unwrap_or_else(|_| Event::default().event("error").data(message))
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    if req.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    state.pipeline.generator_for(&req)?;

    let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(EVENT_BUFFER);
    let (error_tx, error_rx) = mpsc::channel::<Event>(1);
    let pipeline = state.pipeline.clone();

    tokio::spawn(async move {
        let result = pipeline
            .orchestrator(Some(event_tx), CancellationToken::new())
            .run(req)
            .await;
        match result {
            Ok(_) => {}
            Err(OrchestratorError::Cancelled) => tracing::debug!("stream client disconnected"),
            Err(e) => {
                let _ = error_tx.send(error_event(e.code(), &e.to_string())).await;
            }
        }
    });

    let events = ReceiverStream::new(event_rx)
        .map(|ev| sse_event(&ev))
        .chain(ReceiverStream::new(error_rx))
        .map(Ok::<_, Infallible>);
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream;
    use std::path::Path;
    use std::time::Duration;

    use vault_rag_core::assemble::ContextAssembler;
    use vault_rag_core::chunk::{chunk_document, ChunkerConfig};
    use vault_rag_core::generation::{Generator, TokenStream};
    use vault_rag_core::index::{IndexWriter, InMemoryIndex};
    use vault_rag_core::prompt::PromptBuilder;
    use vault_rag_core::rerank::ReRanker;
    use vault_rag_core::retrieve::{HybridRetriever, RetrievalParams};

    use crate::config::GenerationConfig;
    use crate::embedding::DisabledEmbedder;
    use crate::llm::DisabledGenerator;
    use crate::orchestrator::Timeouts;
    use crate::vault::parse_note;

    struct Echo;

    #[async_trait]
    impl Generator for Echo {
        fn model_name(&self) -> &str {
            "echo"
        }
        async fn generate(&self, _prompt: &str) -> Result<TokenStream, GenerationError> {
            Ok(Box::pin(stream::iter(vec![
                Ok("See ".to_string()),
                Ok("[Source: Presence]".to_string()),
            ])))
        }
    }

    async fn pipeline(generator: Arc<dyn Generator>) -> Pipeline {
        let index = Arc::new(InMemoryIndex::new());
        let doc = parse_note(
            Path::new("Spiritual/Notes - Presence.md"),
            "Presence and mindfulness in daily life.",
            None,
        )
        .unwrap();
        let chunks = chunk_document(&doc, &ChunkerConfig::default());
        index.replace_document(&doc, &chunks, None).await.unwrap();

        let retriever = HybridRetriever::new(
            Arc::new(DisabledEmbedder),
            index.clone(),
            index.clone(),
            index,
            RetrievalParams::default(),
        )
        .unwrap();
        Pipeline::new(
            retriever,
            ReRanker::default(),
            ContextAssembler::new(500),
            PromptBuilder::default(),
            generator,
            5,
            Timeouts {
                generate: Duration::from_secs(5),
                ..Timeouts::default()
            },
        )
    }

    async fn state(generator: Arc<dyn Generator>) -> AppState {
        AppState::new(Arc::new(pipeline(generator).await))
    }

    fn ollama_config() -> GenerationConfig {
        GenerationConfig {
            provider: "ollama".into(),
            model: Some("llama3.1".into()),
            models: vec!["mistral".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chat_returns_citations() {
        let st = state(Arc::new(Echo)).await;
        let Json(resp) = handle_chat(State(st), Json(ChatRequest::new("mindfulness")))
            .await
            .unwrap();
        assert_eq!(resp.message, "See [Source: Presence]");
        assert_eq!(resp.citations.len(), 1);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_message() {
        let st = state(Arc::new(Echo)).await;
        let err = handle_chat(State(st), Json(ChatRequest::new("   ")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn test_disabled_generation_maps_to_bad_request() {
        let st = state(Arc::new(DisabledGenerator)).await;
        let err = handle_chat(State(st), Json(ChatRequest::new("mindfulness")))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "generation_failed");
    }

    #[tokio::test]
    async fn test_search_and_stats() {
        let st = state(Arc::new(Echo)).await;
        let req = SearchRequest {
            query: "mindfulness".into(),
            category: Some("Spiritual".into()),
            book: None,
            limit: Some(3),
        };
        let Json(results) = handle_search(State(st.clone()), Json(req)).await.unwrap();
        assert_eq!(results.hits.len(), 1);
        assert_eq!(results.hits[0].title, "Presence");

        let Json(stats) = handle_stats(State(st)).await.unwrap();
        assert_eq!(stats.documents, 1);
    }

    #[tokio::test]
    async fn test_models_lists_configured_choices() {
        let st = AppState::new(Arc::new(
            pipeline(Arc::new(Echo)).await.with_generation_config(ollama_config()),
        ));
        let Json(models) = handle_models(State(st)).await;
        assert_eq!(models.provider.as_deref(), Some("ollama"));
        assert_eq!(models.model, "echo");
        assert_eq!(models.providers, vec!["disabled", "openai", "ollama"]);
        assert_eq!(models.models, vec!["mistral"]);

        let Json(fixed) = handle_models(State(state(Arc::new(Echo)).await)).await;
        assert_eq!(fixed.provider, None);
        assert!(fixed.providers.is_empty());
    }

    #[tokio::test]
    async fn test_chat_with_unknown_provider_is_bad_request() {
        let st = AppState::new(Arc::new(
            pipeline(Arc::new(Echo)).await.with_generation_config(ollama_config()),
        ));
        let req = ChatRequest {
            provider: Some("cohere".into()),
            ..ChatRequest::new("mindfulness")
        };
        let err = handle_chat(State(st.clone()), Json(req.clone())).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "invalid_request");

        let err = handle_chat_stream(State(st), Json(req)).await.err().unwrap();
        assert_eq!(err.code, "invalid_request");
    }

    #[test]
    fn test_orchestrator_errors_map_to_statuses() {
        let timeout: AppError = OrchestratorError::RetrievalTimeout(Duration::from_secs(1)).into();
        assert_eq!(timeout.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.code, "retrieval_timeout");
        let no_ctx: AppError = OrchestratorError::NoContext("both down".into()).into();
        assert_eq!(no_ctx.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
