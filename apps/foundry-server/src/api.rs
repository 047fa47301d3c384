use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use foundry_protocol::{headers, RunRequest, TokenRequest, TokenTicket};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::app_state::AppState;
use crate::archive::{ArchiveError, Download, CHUNK_SIZE};
use crate::auth::AuthContext;
use crate::builtins::version::AGENT_VERSION;
use crate::error::FoundryError;
use crate::events::{sse_response, EventSink};
use crate::validate;

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, FoundryError> {
    serde_json::from_slice(body).map_err(|e| FoundryError::BadRequest(format!("invalid JSON body: {e}")))
}

/// Validate the command, start it detached and stream its events.
pub(crate) async fn run(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, FoundryError> {
    let req: RunRequest = parse_json(&body)?;
    let normalized = validate::validate(&req.command)?;
    info!(
        request_id = %ctx.request_id,
        actor = ctx.actor.as_deref().unwrap_or("-"),
        command = %normalized,
        "command accepted"
    );
    let (sink, rx) = EventSink::channel();
    state
        .dispatcher()
        .spawn(normalized, ctx.request_id.clone(), sink);
    Ok(sse_response(rx))
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadQuery {
    token: Option<String>,
}

/// Single-use archive retrieval; the staged file is gone once the body is dropped.
pub(crate) async fn download(
    State(state): State<AppState>,
    Query(q): Query<DownloadQuery>,
) -> Result<Response, FoundryError> {
    let token = q.token.ok_or(ArchiveError::InvalidToken)?;
    let Download {
        filename,
        size,
        file,
        cleanup,
    } = state.archives().consume(token.trim()).await?;
    let stream = ReaderStream::with_capacity(file, CHUNK_SIZE).map(move |chunk| {
        let _held = &cleanup;
        chunk
    });
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|e| FoundryError::Internal(e.to_string()))?;
    let mut response = Body::from_stream(stream).into_response();
    let h = response.headers_mut();
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    h.insert(header::CONTENT_DISPOSITION, disposition);
    h.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    h.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

pub(crate) async fn upload(
    State(state): State<AppState>,
    req_headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<TokenTicket>), FoundryError> {
    let filename = req_headers
        .get(headers::FILENAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("upload.zip");
    let ticket = state.archives().store_upload(filename, &body).await?;
    Ok((StatusCode::CREATED, Json(ticket)))
}

pub(crate) async fn upload_delete(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, FoundryError> {
    let req: TokenRequest = parse_json(&body)?;
    state.archives().delete_upload(req.token.trim()).await?;
    Ok(Json(json!({"deleted": true, "token": req.token})))
}

pub(crate) async fn rotate_secret(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, FoundryError> {
    let fingerprint = state
        .secrets()
        .rotate()
        .await
        .map_err(|e| FoundryError::Internal(format!("persisting shared secret: {e}")))?;
    info!(request_id = %ctx.request_id, fingerprint = %fingerprint, "secret rotated on request");
    Ok(Json(json!({"rotated": true, "fingerprint": fingerprint})))
}

pub(crate) async fn healthz() -> Json<Value> {
    Json(json!({"ok": true, "version": AGENT_VERSION}))
}
