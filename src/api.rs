//! REST surface over [`AppContext`].

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::context::{AppContext, Status};
use crate::error::{RagError, RagResult};
use crate::index::{ScoredSegment, StoreInfo};
use crate::rag::{ConversationTurn, DEFAULT_TOP_K};

/// Characters of segment text returned with `/query` and `/chat` sources.
pub const SOURCE_EXCERPT_CHARS: usize = 200;
/// Characters of segment text returned by `/similar`.
pub const SIMILAR_EXCERPT_CHARS: usize = 300;

const MULTIPART_OVERHEAD: usize = 1024 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

/// JSON error payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable failure description.
    pub message: String,
}

#[derive(Debug, Serialize)]
struct RootResponse {
    message: &'static str,
    version: &'static str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: String,
    filename: String,
    chunk_count: usize,
    byte_size: usize,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SourceItem {
    content: String,
    metadata: Map<String, Value>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    answer: String,
    sources: Vec<SourceItem>,
    question: String,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    chat_history: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    answer: String,
    sources: Vec<SourceItem>,
    chat_history: Vec<ConversationTurn>,
}

#[derive(Debug, Serialize)]
struct DocumentsResponse {
    document_count: usize,
    store_info: StoreInfo,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SimilarParams {
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Serialize)]
struct SimilarItem {
    content: String,
    metadata: Map<String, Value>,
    distance_score: f32,
}

#[derive(Debug, Serialize)]
struct SimilarResponse {
    query: String,
    results: Vec<SimilarItem>,
}

/// Builds the router with CORS, request tracing and an upload-sized body limit.
pub fn router(context: Arc<AppContext>) -> Router {
    let body_limit = context.max_file_size().saturating_add(MULTIPART_OVERHEAD);
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/upload", post(upload))
        .route("/query", post(query))
        .route("/chat", post(chat))
        .route("/status", get(status))
        .route("/documents", get(documents).delete(clear_documents))
        .route("/similar", get(similar))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(context)
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "PDF question answering API",
        version: env!("CARGO_PKG_VERSION"),
        status: "running",
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn upload(
    State(context): State<Arc<AppContext>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<UploadResponse> {
    let mut multipart = multipart.map_err(|err| bad_request(err.body_text()))?;
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| bad_request("uploaded file has no name"))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|err| bad_request(format!("failed to read upload: {err}")))?;
        upload = Some((filename, bytes));
        break;
    }
    let (filename, bytes) = upload.ok_or_else(|| bad_request("missing multipart field `file`"))?;

    let report = run_blocking(&context, move |context| context.ingest(&filename, &bytes)).await?;
    Ok(Json(UploadResponse {
        message: format!("Successfully processed {}", report.filename),
        filename: report.filename,
        chunk_count: report.chunk_count,
        byte_size: report.byte_size,
    }))
}

async fn query(
    State(context): State<Arc<AppContext>>,
    request: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<QueryResponse> {
    let Json(request) = request.map_err(|err| bad_request(err.body_text()))?;
    if request.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let k = request.k.unwrap_or(DEFAULT_TOP_K);
    let question = request.question.clone();
    let answer = run_blocking(&context, move |context| context.ask(&question, k)).await?;
    Ok(Json(QueryResponse {
        answer: answer.answer,
        sources: sources(&answer.cited_segments),
        question: request.question,
    }))
}

async fn chat(
    State(context): State<Arc<AppContext>>,
    request: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<ChatResponse> {
    let Json(request) = request.map_err(|err| bad_request(err.body_text()))?;
    if request.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let answer = run_blocking(&context, move |context| {
        context.chat(&request.question, &request.chat_history)
    })
    .await?;
    Ok(Json(ChatResponse {
        answer: answer.answer,
        sources: sources(&answer.cited_segments),
        chat_history: answer.updated_turns,
    }))
}

async fn status(State(context): State<Arc<AppContext>>) -> ApiResult<Status> {
    run_blocking(&context, |context| context.status())
        .await
        .map(Json)
}

async fn documents(State(context): State<Arc<AppContext>>) -> ApiResult<DocumentsResponse> {
    let store_info = run_blocking(&context, |context| context.store_info()).await?;
    Ok(Json(DocumentsResponse {
        document_count: store_info.document_count,
        store_info,
    }))
}

async fn clear_documents(State(context): State<Arc<AppContext>>) -> ApiResult<MessageResponse> {
    run_blocking(&context, |context| context.clear()).await?;
    Ok(Json(MessageResponse {
        message: "All documents cleared".to_string(),
    }))
}

async fn similar(
    State(context): State<Arc<AppContext>>,
    params: Result<Query<SimilarParams>, QueryRejection>,
) -> ApiResult<SimilarResponse> {
    let Query(params) = params.map_err(|err| bad_request(err.body_text()))?;
    let k = params.k.unwrap_or(DEFAULT_TOP_K);
    let query = params.query.clone();
    let hits = run_blocking(&context, move |context| context.similar(&query, k)).await?;
    Ok(Json(SimilarResponse {
        query: params.query,
        results: hits
            .into_iter()
            .map(|hit| SimilarItem {
                content: excerpt(&hit.segment.text, SIMILAR_EXCERPT_CHARS),
                metadata: hit.segment.metadata(),
                distance_score: hit.distance,
            })
            .collect(),
    }))
}

/// Runs a synchronous pipeline call on the blocking pool.
async fn run_blocking<T, F>(
    context: &Arc<AppContext>,
    call: F,
) -> Result<T, (StatusCode, Json<ErrorBody>)>
where
    F: FnOnce(&AppContext) -> RagResult<T> + Send + 'static,
    T: Send + 'static,
{
    let context = Arc::clone(context);
    tokio::task::spawn_blocking(move || call(&context))
        .await
        .map_err(|err| internal_error(format!("pipeline task failed: {err}")))?
        .map_err(error_response)
}

fn sources(hits: &[ScoredSegment]) -> Vec<SourceItem> {
    hits.iter()
        .map(|hit| SourceItem {
            content: excerpt(&hit.segment.text, SOURCE_EXCERPT_CHARS),
            metadata: hit.segment.metadata(),
        })
        .collect()
}

/// First `limit` characters of `text`, with `...` appended when truncated.
pub fn excerpt(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn error_response(err: RagError) -> (StatusCode, Json<ErrorBody>) {
    if err.is_client_error() {
        bad_request(err.to_string())
    } else {
        internal_error(err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

fn internal_error(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}
