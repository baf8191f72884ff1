use std::net::SocketAddr;
use std::path::Path as FsPath;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::context::{heard_so_far, preview_text};
use crate::error::BardError;
use crate::models::{
    AgentConfigResponse, AgentContextQuery, AgentContextResponse, AgentSystemPrompt, AskRequest,
    AskResponse, Chapter, ChapterInfo, ContextPreview, TextAnswerResponse,
};
use crate::narrator::{agent_system_prompt, AGENT_SETUP_INSTRUCTIONS};
use crate::pipeline::AnswerPipeline;
use crate::store::SentenceStore;
use crate::tts::answer_audio_path;

const MAX_QUESTION_CHARS: usize = 2_000;
const PREVIEW_CHARS: usize = 2_000;

#[derive(Clone)]
struct AppState {
    config: Arc<AppConfig>,
    store: Arc<dyn SentenceStore>,
    pipeline: AnswerPipeline,
}

pub async fn run_server(
    config: AppConfig,
    store: Arc<dyn SentenceStore>,
    pipeline: AnswerPipeline,
) -> Result<()> {
    tokio::fs::create_dir_all(config.answers_dir()).await?;

    let addr: SocketAddr = config.bind_addr.parse()?;
    let app = router(config, store, pipeline);

    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(config: AppConfig, store: Arc<dyn SentenceStore>, pipeline: AnswerPipeline) -> Router {
    let cors = cors_layer(&config.cors_origins);
    let state = AppState {
        config: Arc::new(config),
        store,
        pipeline,
    };

    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/chapters", get(list_chapters))
        .route("/chapters/:chapter_id", get(get_chapter))
        .route("/chapters/:chapter_id/audio", get(chapter_audio))
        .route("/chapters/:chapter_id/alignment", get(chapter_alignment))
        .route("/ask", post(ask))
        .route("/ask/text-only", post(ask_text_only))
        .route("/answers/:answer_id/audio", get(answer_audio))
        .route("/context/:chapter_id/:audio_time", get(context_preview))
        .route("/agent/context", get(agent_context))
        .route("/agent/config", get(agent_config))
        .route("/agent/system-prompt", get(agent_prompt))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn index() -> Json<Value> {
    Json(json!({
        "service": "bard",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "GET /chapters",
            "GET /chapters/{chapter_id}",
            "GET /chapters/{chapter_id}/audio",
            "GET /chapters/{chapter_id}/alignment",
            "POST /ask",
            "POST /ask/text-only",
            "GET /answers/{answer_id}/audio",
            "GET /context/{chapter_id}/{audio_time}",
            "GET /agent/context",
            "GET /agent/config",
            "GET /agent/system-prompt",
        ],
    }))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "service": "bard" }))
}

async fn list_chapters(State(state): State<AppState>) -> Result<Json<Vec<ChapterInfo>>, ApiError> {
    Ok(Json(state.store.list_chapters().await?))
}

async fn get_chapter(
    State(state): State<AppState>,
    Path(chapter_id): Path<i64>,
) -> Result<Json<Chapter>, ApiError> {
    Ok(Json(require_chapter(&state, chapter_id).await?))
}

async fn chapter_audio(
    State(state): State<AppState>,
    Path(chapter_id): Path<i64>,
) -> Result<Response, ApiError> {
    let chapter = require_chapter(&state, chapter_id).await?;
    let Some(audio_path) = chapter.audio_path else {
        return Err(ApiError::not_found(format!(
            "no audio recorded for chapter {chapter_id}"
        )));
    };

    serve_mp3(&state.config.resolve_data_path(audio_path), "public, max-age=86400").await
}

async fn chapter_alignment(
    State(state): State<AppState>,
    Path(chapter_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    require_chapter(&state, chapter_id).await?;

    let sentences = state.store.chapter_alignment(chapter_id).await?;
    if sentences.is_empty() {
        return Err(ApiError::not_found(format!(
            "no alignment data for chapter {chapter_id}"
        )));
    }

    Ok(Json(json!({
        "chapter_id": chapter_id,
        "sentences": sentences,
    })))
}

async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, ApiError> {
    let question = validate_ask_request(&request)?;
    let answer = state
        .pipeline
        .answer(request.chapter_id, request.audio_time, question, true)
        .await?;

    Ok(Json(AskResponse {
        answer: answer.answer_text,
        audio_url: answer.audio_url,
        current_sentence_id: answer.position.sentence_id,
        context_sentence_count: answer.stats.sentence_count,
    }))
}

async fn ask_text_only(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<TextAnswerResponse>, ApiError> {
    let question = validate_ask_request(&request)?;
    let answer = state
        .pipeline
        .answer(request.chapter_id, request.audio_time, question, false)
        .await?;

    Ok(Json(TextAnswerResponse {
        answer: answer.answer_text,
        current_sentence_id: answer.position.sentence_id,
        current_sentence_text: answer.position.sentence.text,
        context_sentence_count: answer.stats.sentence_count,
        context_chapter_count: answer.stats.chapter_count,
        context_tokens: answer.stats.estimated_tokens,
    }))
}

async fn answer_audio(
    State(state): State<AppState>,
    Path(answer_id): Path<String>,
) -> Result<Response, ApiError> {
    let answers_dir = state.config.answers_dir();
    let Some(path) = answer_audio_path(&answers_dir, &answer_id) else {
        return Err(ApiError::not_found(format!("answer audio not found: {answer_id}")));
    };

    serve_mp3(&path, "no-cache").await
}

async fn context_preview(
    State(state): State<AppState>,
    Path((chapter_id, audio_time)): Path<(i64, f64)>,
) -> Result<Json<ContextPreview>, ApiError> {
    validate_audio_time(audio_time)?;

    let position = state.pipeline.resolver().resolve(chapter_id, audio_time).await?;
    let context = state
        .pipeline
        .assembler()
        .assemble(position.sentence_id, state.pipeline.token_budget())
        .await?;

    Ok(Json(ContextPreview {
        current_sentence_id: position.sentence_id,
        current_sentence_text: position.sentence.text,
        current_chapter_id: position.sentence.chapter_id,
        context_preview: preview_text(&context.text, PREVIEW_CHARS),
        stats: context.stats(),
    }))
}

async fn agent_context(
    State(state): State<AppState>,
    Query(query): Query<AgentContextQuery>,
) -> Result<Json<AgentContextResponse>, ApiError> {
    validate_audio_time(query.audio_time)?;

    let chapter = require_chapter(&state, query.chapter_id).await?;
    let sentences = state.store.chapter_sentences(query.chapter_id).await?;
    if !sentences.iter().any(|s| s.is_aligned()) {
        return Err(ApiError::not_found(format!(
            "no alignment data for chapter {}",
            query.chapter_id
        )));
    }

    let heard = heard_so_far(
        &sentences,
        query.audio_time,
        state.config.tokens.max_context_words,
    );

    Ok(Json(AgentContextResponse {
        chapter_id: chapter.chapter_id,
        chapter_title: chapter.title,
        sentence_id: heard.current.as_ref().map(|s| s.sentence_id),
        current_sentence: heard.current.map(|s| s.text),
        text_heard_so_far: heard.text,
        word_count: heard.word_count,
    }))
}

async fn agent_config(State(state): State<AppState>) -> Result<Json<AgentConfigResponse>, ApiError> {
    let config = &state.config;
    if config.agent.agent_id.is_empty() {
        return Err(ApiError::unavailable(
            "conversational agent not configured; set ELEVENLABS_AGENT_ID".to_string(),
        ));
    }

    Ok(Json(AgentConfigResponse {
        agent_id: config.agent.agent_id.clone(),
        voice_id: config.speech.voice_id.clone(),
        use_agent: config.agent.use_agent,
        conversation_timeout_ms: config.agent.conversation_timeout_ms,
        max_context_words: config.tokens.max_context_words,
    }))
}

async fn agent_prompt() -> Json<AgentSystemPrompt> {
    Json(AgentSystemPrompt {
        prompt: agent_system_prompt(),
        instructions: AGENT_SETUP_INSTRUCTIONS.to_string(),
    })
}

async fn require_chapter(state: &AppState, chapter_id: i64) -> Result<Chapter, ApiError> {
    state
        .store
        .chapter(chapter_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("chapter not found: {chapter_id}")))
}

async fn serve_mp3(path: &FsPath, cache_control: &'static str) -> Result<Response, ApiError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found(format!(
                "audio file not found: {}",
                path.display()
            )));
        }
        Err(err) => return Err(anyhow::Error::from(err).into()),
    };

    Ok((
        [(CONTENT_TYPE, "audio/mpeg"), (CACHE_CONTROL, cache_control)],
        bytes,
    )
        .into_response())
}

/// Returns the trimmed question.
fn validate_ask_request(request: &AskRequest) -> Result<&str, ApiError> {
    let question = request.question.trim();
    if question.is_empty() {
        return Err(ApiError::bad_request("question must not be empty".to_string()));
    }
    if question.chars().count() > MAX_QUESTION_CHARS {
        return Err(ApiError::bad_request(format!(
            "question must be at most {MAX_QUESTION_CHARS} characters"
        )));
    }
    validate_audio_time(request.audio_time)?;
    Ok(question)
}

fn validate_audio_time(audio_time: f64) -> Result<(), ApiError> {
    if !audio_time.is_finite() || audio_time < 0.0 {
        return Err(ApiError::bad_request(format!(
            "audio_time must be a non-negative number of seconds, got {audio_time}"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn unavailable(message: String) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message,
        }
    }
}

impl From<BardError> for ApiError {
    fn from(value: BardError) -> Self {
        let status = match &value {
            BardError::ChapterNotFound(_)
            | BardError::EmptyChapter(_)
            | BardError::EmptyContext(_) => StatusCode::BAD_REQUEST,
            BardError::Generation(_) | BardError::Synthesis(_) => StatusCode::BAD_GATEWAY,
            BardError::InvalidSentenceRow { .. }
            | BardError::InvalidAlignment { .. }
            | BardError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{value:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "request failed: {}", self.message);
        }
        let body = json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
