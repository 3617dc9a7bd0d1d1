//! HTTP surface: submit, poll, download, and the push socket.
//!
//! Routes stay deliberately small; the heavy lifting happens in
//! [`crate::runner`]. Every error leaves as `{"error": "..."}` with the
//! matching status code.

use std::{
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, State,
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, Stream, StreamExt};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, sync::broadcast};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    job::{Job, JobId},
    notifier::ProgressFrame,
    runner::JobRunner,
    validation::{ValidationError, validate_submission},
};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    runner: JobRunner,
    www_root: Option<Arc<PathBuf>>,
    archive_delete_delay: Duration,
}

impl AppState {
    pub fn new(runner: JobRunner, www_root: Option<PathBuf>, archive_delete_delay: Duration) -> Self {
        Self {
            runner,
            www_root: www_root.map(Arc::new),
            archive_delete_delay,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize, Default)]
#[serde(default)]
struct CreateJobRequest {
    url: String,
    format: String,
    quality: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateJobResponse {
    job_id: JobId,
    status: &'static str,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/archive", get(download_archive))
        .route("/ws", get(push_channel))
        .fallback(static_fallback)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> ApiResult<Json<CreateJobResponse>> {
    let Json(payload) = payload.map_err(|err| ApiError::bad_request(err.body_text()))?;
    let submission = validate_submission(&payload.url, &payload.format, &payload.quality)?;
    let job = state.runner.submit(submission);
    Ok(Json(CreateJobResponse {
        job_id: job.id,
        status: "started",
    }))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.runner.store().list())
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<Job>> {
    let id = parse_job_id(&id)?;
    let job = state
        .runner
        .store()
        .get(id)
        .ok_or_else(|| ApiError::not_found("job not found"))?;
    Ok(Json(job))
}

/// Streams a finished archive once. The file is removed a short while after
/// the body has been sent or dropped.
async fn download_archive(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let id = parse_job_id(&id)?;
    let handle = state
        .runner
        .store()
        .take_archive(id)
        .ok_or_else(|| ApiError::not_found("archive not available"))?;

    let cleanup = ArchiveCleanup {
        path: handle.path.clone(),
        delay: state.archive_delete_delay,
    };
    let file = File::open(&handle.path).await.map_err(|err| {
        warn!(job_id = id, error = %err, "archive missing on disk");
        ApiError::not_found("archive not available")
    })?;
    let size = file.metadata().await.ok().map(|meta| meta.len());

    let stream = CleanupStream {
        inner: ReaderStream::new(file),
        _cleanup: cleanup,
    };
    let mut response = Body::from_stream(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&handle.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Some(size) = size {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    }

    info!(job_id = id, file = %handle.file_name, "serving archive");
    Ok(response)
}

async fn push_channel(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    // subscribe before the upgrade so no frame slips through the handshake
    let rx = state.runner.notifier().subscribe();
    debug!(
        listeners = state.runner.notifier().listener_count(),
        "push listener connected"
    );
    ws.on_upgrade(move |socket| forward_frames(socket, rx))
}

async fn forward_frames(socket: WebSocket, mut rx: broadcast::Receiver<ProgressFrame>) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Ok(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(error = %err, "could not encode progress frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "push listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("push listener disconnected");
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    let is_api = path == "/ws" || path == "/jobs" || path.starts_with("/jobs/");
    let Some(root) = state.www_root.as_deref().filter(|_| !is_api) else {
        return ApiError::not_found("endpoint not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    raw.parse::<JobId>()
        .map_err(|_| ApiError::not_found("job not found"))
}

/// Deletes an archive once the response body that carries it goes away.
struct ArchiveCleanup {
    path: PathBuf,
    delay: Duration,
}

impl Drop for ArchiveCleanup {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        let delay = self.delay;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => debug!(path = %path.display(), "archive deleted"),
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "could not delete archive")
                        }
                    }
                });
            }
            Err(_) => {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "could not delete archive");
                }
            }
        }
    }
}

/// Body stream that owns an [`ArchiveCleanup`] so deletion is scheduled when
/// the body finishes or the client goes away.
struct CleanupStream<S> {
    inner: S,
    _cleanup: ArchiveCleanup,
}

impl<S: Stream + Unpin> Stream for CleanupStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// `attachment` header with an ASCII fallback plus the RFC 5987 UTF-8 form.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut encoded = String::new();
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut headers = HeaderMap::new();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}
