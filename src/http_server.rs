//! HTTP server implementation using Axum.

use crate::error::AppError;
use crate::inference::Prompt;
use crate::state::AppState;
use crate::{relay, sandbox, share};
use axum::{
    extract::{FromRequest, Path, State},
    http::header,
    response::sse::{KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

/// `Json` whose rejections come back as `{ "error": ... }` with status 400.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
struct JsonBody<T>(T);

// Request/Response types. Missing fields default to empty so they are
// rejected with 400 by the handlers rather than 422 by the extractor.
#[derive(Deserialize)]
struct ChatRequest {
    #[serde(default)]
    message: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct CodeRequest {
    #[serde(default)]
    code: String,
}

#[derive(Serialize)]
struct RunResponse {
    output: String,
}

#[derive(Serialize)]
struct ShareResponse {
    url: String,
}

/// Build the router: API routes, snippet retrieval, optional front-end.
pub fn router(state: AppState) -> Router {
    let route_prefix = state.config.share.route_prefix();
    let static_dir = state.config.static_dir.clone();

    let mut app = Router::new()
        .route("/chat", post(chat))
        .route("/run", post(run))
        .route("/share", post(share_snippet))
        .route("/health", get(health));

    // Without a routable prefix the locators point elsewhere; `run_server`
    // refuses to start in that case.
    if let Some(prefix) = route_prefix {
        app = app.route(&format!("{}/:file", prefix), get(fetch_snippet));
    }

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir));
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server with the provided state.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    if state.config.share.route_prefix().is_none() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "SHARE_URL_PREFIX {:?} has no path to serve snippets under",
                state.config.share.url_prefix
            ),
        ));
    }
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port)
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let app = router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health() -> &'static str {
    "OK"
}

async fn chat(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.message.trim().is_empty() {
        return Err(AppError::Validation("No message provided"));
    }
    info!(
        message_len = req.message.len(),
        language = ?req.language,
        "POST /chat"
    );

    let prompt = Prompt::for_request(&state.config.inference, &req.message, req.language.as_deref());
    let chunks = state.completions.stream_completion(prompt).await?;

    Ok(Sse::new(relay::relay_events(chunks)).keep_alive(KeepAlive::default()))
}

async fn run(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CodeRequest>,
) -> Result<Json<RunResponse>, AppError> {
    if req.code.is_empty() {
        return Err(AppError::Validation("No code provided"));
    }
    info!(code_len = req.code.len(), "POST /run");

    let config = &state.config.executor;
    let result = sandbox::run_source(config, &req.code).await?;
    let output = result.into_output(config).map_err(AppError::Execution)?;
    Ok(Json(RunResponse { output }))
}

async fn share_snippet(
    State(state): State<AppState>,
    JsonBody(req): JsonBody<CodeRequest>,
) -> Result<Json<ShareResponse>, AppError> {
    if req.code.is_empty() {
        return Err(AppError::Validation("No code provided"));
    }

    let published = share::publish(&state.config.share, &req.code).await?;
    info!(id = %published.id, url = %published.url, "POST /share");
    Ok(Json(ShareResponse { url: published.url }))
}

async fn fetch_snippet(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let text = share::load(&state.config.share, &file)
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => AppError::NotFound,
            _ => AppError::Persistence(e),
        })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}
