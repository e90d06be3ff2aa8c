//! REST surface: thin handlers over the service adapters.
//!
//! The streaming core lives on `/v1/chat/stream`; everything here is plain
//! request/response glue for TTS synthesis, vision analysis, and the memory
//! stores, plus the aggregate health endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};

use crate::services::{LtmClient, ManagedService, MemoryHit, StmClient, StoredMessage, TtsClient, VlmClient};

/// Shared handles to all external service adapters.
#[derive(Clone)]
pub struct AppServices {
    pub tts: Arc<TtsClient>,
    pub vlm: Arc<VlmClient>,
    pub stm: Arc<StmClient>,
    pub ltm: Arc<LtmClient>,
}

impl AppServices {
    fn managed(&self) -> Vec<Arc<dyn ManagedService>> {
        vec![
            self.tts.clone(),
            self.vlm.clone(),
            self.stm.clone(),
            self.ltm.clone(),
        ]
    }
}

/// Build the REST router; merge with the gateway's streaming router.
pub fn router(services: AppServices) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/tts/synthesize", post(tts_synthesize))
        .route("/v1/vlm/analyze", post(vlm_analyze))
        .route(
            "/v1/stm/sessions/{session_id}",
            get(stm_session).delete(stm_delete_session),
        )
        .route("/v1/stm/sessions/{session_id}/messages", post(stm_add_message))
        .route("/v1/ltm/memories", post(ltm_add_memory))
        .route("/v1/ltm/memories/{memory_id}", axum::routing::delete(ltm_delete_memory))
        .route("/v1/ltm/search", post(ltm_search))
        .with_state(services)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn upstream_error(error: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::BAD_GATEWAY,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ServiceHealth {
    healthy: bool,
    detail: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    services: BTreeMap<&'static str, ServiceHealth>,
}

async fn health(State(services): State<AppServices>) -> impl IntoResponse {
    let mut report = BTreeMap::new();
    let mut all_healthy = true;
    for service in services.managed() {
        let (healthy, detail) = service.is_healthy().await;
        all_healthy &= healthy;
        report.insert(service.name(), ServiceHealth { healthy, detail });
    }

    Json(HealthResponse {
        status: if all_healthy { "ok" } else { "degraded" },
        services: report,
    })
}

// ---------------------------------------------------------------------------
// TTS
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TtsSynthesizeRequest {
    text: String,
    #[serde(default)]
    voice: Option<String>,
}

#[derive(Debug, Serialize)]
struct TtsSynthesizeResponse {
    audio: String,
}

async fn tts_synthesize(
    State(services): State<AppServices>,
    Json(body): Json<TtsSynthesizeRequest>,
) -> Result<Json<TtsSynthesizeResponse>, (StatusCode, Json<ErrorBody>)> {
    let audio = services
        .tts
        .synthesize(&body.text, body.voice.as_deref())
        .await
        .map_err(upstream_error)?;
    Ok(Json(TtsSynthesizeResponse { audio }))
}

// ---------------------------------------------------------------------------
// VLM
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct VlmAnalyzeRequest {
    image: String,
    #[serde(default)]
    prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct VlmAnalyzeResponse {
    description: String,
}

async fn vlm_analyze(
    State(services): State<AppServices>,
    Json(body): Json<VlmAnalyzeRequest>,
) -> Result<Json<VlmAnalyzeResponse>, (StatusCode, Json<ErrorBody>)> {
    let description = services
        .vlm
        .analyze(&body.image, body.prompt.as_deref())
        .await
        .map_err(upstream_error)?;
    Ok(Json(VlmAnalyzeResponse { description }))
}

// ---------------------------------------------------------------------------
// Short-term memory
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct SessionMessagesBody {
    messages: Vec<StoredMessage>,
}

async fn stm_add_message(
    State(services): State<AppServices>,
    Path(session_id): Path<String>,
    Json(message): Json<StoredMessage>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    services
        .stm
        .add_message(&session_id, &message)
        .await
        .map_err(upstream_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stm_session(
    State(services): State<AppServices>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionMessagesBody>, (StatusCode, Json<ErrorBody>)> {
    let messages = services
        .stm
        .session_messages(&session_id)
        .await
        .map_err(upstream_error)?;
    Ok(Json(SessionMessagesBody { messages }))
}

async fn stm_delete_session(
    State(services): State<AppServices>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    services
        .stm
        .delete_session(&session_id)
        .await
        .map_err(upstream_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Long-term memory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AddMemoryBody {
    user_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    user_id: String,
    query: String,
    #[serde(default = "default_search_limit")]
    limit: usize,
}

fn default_search_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SearchResponseBody {
    memories: Vec<MemoryHit>,
}

async fn ltm_add_memory(
    State(services): State<AppServices>,
    Json(body): Json<AddMemoryBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    services
        .ltm
        .add_memory(&body.user_id, &body.text)
        .await
        .map_err(upstream_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn ltm_search(
    State(services): State<AppServices>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponseBody>, (StatusCode, Json<ErrorBody>)> {
    let memories = services
        .ltm
        .search(&body.user_id, &body.query, body.limit)
        .await
        .map_err(upstream_error)?;
    Ok(Json(SearchResponseBody { memories }))
}

async fn ltm_delete_memory(
    State(services): State<AppServices>,
    Path(memory_id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    services
        .ltm
        .delete_memory(&memory_id)
        .await
        .map_err(upstream_error)?;
    Ok(StatusCode::NO_CONTENT)
}
