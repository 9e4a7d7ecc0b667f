use crate::file_system::{build_tree, check_access, read_file, FileError};
use crate::hub::{BroadcastHub, ObserverId};
use crate::models::{ExecuteBody, ExecutionRequest, FailureKind, FileQuery, PushMessage};
use crate::sandbox::Sandbox;
use actix_web::http::StatusCode;
use actix_web::web::Bytes;
use actix_web::{get, post, web, HttpRequest, HttpResponse};
use futures::Stream;
use log::{debug, info, warn};
use serde_json::json;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

pub struct AppState {
    pub root: PathBuf,
    pub hub: Arc<BroadcastHub>,
    pub sandbox: Arc<Sandbox>,
    pub allowed_extensions: Vec<String>,
}

#[get("/api/connect")]
pub async fn connect() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "success": true, "message": "Connection successful" }))
}

#[get("/api/tree")]
pub async fn get_tree(state: web::Data<AppState>) -> HttpResponse {
    if let Some(tree) = state.hub.latest_snapshot() {
        return HttpResponse::Ok().json(json!({ "success": true, "tree": tree }));
    }
    let root = state.root.clone();
    let start_time = Instant::now();
    match web::block(move || build_tree(&root)).await {
        Ok(tree) => {
            debug!("Built snapshot on demand in {:.2?}", start_time.elapsed());
            HttpResponse::Ok().json(json!({ "success": true, "tree": tree }))
        }
        Err(e) => {
            warn!("Snapshot build failed: {}", e);
            HttpResponse::InternalServerError()
                .json(json!({ "success": false, "error": e.to_string() }))
        }
    }
}

#[get("/api/file")]
pub async fn get_file_content(
    state: web::Data<AppState>,
    query: web::Query<FileQuery>,
) -> HttpResponse {
    let path_str = match &query.path {
        Some(p) => p,
        None => {
            warn!("Received file content request with no path.");
            return HttpResponse::BadRequest()
                .json(json!({"success": false, "error": "Path is required"}));
        }
    };
    let result = match check_access(path_str, &state.allowed_extensions) {
        Ok(()) => read_file(&state.root, path_str).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(file) => {
            debug!("Successfully read file: {}", path_str);
            HttpResponse::Ok().json(json!({
                "success": true,
                "content": file.content,
                "extension": file.extension,
            }))
        }
        Err(e) => {
            warn!("Failed to read file '{}': {}", path_str, e);
            let status = match e {
                FileError::NotFound(_) => StatusCode::NOT_FOUND,
                FileError::AccessDenied(_) => StatusCode::FORBIDDEN,
                FileError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
            HttpResponse::build(status).json(json!({"success": false, "error": e.to_string()}))
        }
    }
}

/// Rate accounting identity: the peer's IP, without the port.
fn requester_id(req: &HttpRequest) -> String {
    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[post("/api/execute")]
pub async fn execute(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<ExecuteBody>,
) -> HttpResponse {
    let body = body.into_inner();
    let source_text = body.code.as_str().map(str::to_string);
    let request = ExecutionRequest {
        requester_id: requester_id(&req),
        size_bytes: source_text.as_ref().map_or(0, |s| s.len()),
        source_text,
        label: body.label.unwrap_or_else(|| "script".to_string()),
    };
    let result = state.sandbox.execute(request).await;
    let status = match result.failure_kind {
        Some(FailureKind::RateLimited) => StatusCode::TOO_MANY_REQUESTS,
        Some(FailureKind::TooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
        Some(FailureKind::InvalidInput) => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    };
    HttpResponse::build(status).json(result)
}

fn sse_frame(message: &PushMessage) -> Bytes {
    match serde_json::to_string(message) {
        Ok(data) => Bytes::from(format!("event: {}\ndata: {}\n\n", message.event_name(), data)),
        Err(e) => {
            warn!("Failed to serialize {} message: {}", message.event_name(), e);
            Bytes::from_static(b": serialization error\n\n")
        }
    }
}

/// One observer's push stream. Dropping it, which actix does when the client
/// goes away, unregisters the observer.
pub struct ObserverStream {
    id: ObserverId,
    inner: ReceiverStream<PushMessage>,
    hub: Arc<BroadcastHub>,
}

impl ObserverStream {
    pub fn connect(hub: Arc<BroadcastHub>) -> Self {
        let observer = hub.connect();
        ObserverStream {
            id: observer.id,
            inner: ReceiverStream::new(observer.receiver),
            hub,
        }
    }
}

impl Stream for ObserverStream {
    type Item = Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|message| message.map(|m| Ok(sse_frame(&m))))
    }
}

impl Drop for ObserverStream {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

#[get("/api/events")]
pub async fn events(state: web::Data<AppState>) -> HttpResponse {
    let stream = ObserverStream::connect(state.hub.clone());
    info!(
        "Push channel opened for observer {} ({} connected)",
        stream.id,
        state.hub.observer_count()
    );
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}
