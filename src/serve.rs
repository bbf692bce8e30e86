//! Purpose: Provide the HTTP/JSON gateway for port storage and bulk upload.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum-based loopback server over a `PortStore`.
//! Invariants: JSON envelopes are `{"port"}`, `{"ports"}`, `{"ok"}`, or `{"error":{"kind",..}}`.
//! Invariants: Loopback-only unless explicitly allowed.
//! Invariants: Upload failures are logged in full but reported as a generic 500.
//! Notes: Uploads stream the multipart field into the pipeline on a blocking thread.

use axum::extract::multipart::Field;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::{Buf, Bytes};
use serde::Serialize;
use serde_json::json;
use std::future::IntoFuture;
use std::io::{self, Read};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use portload::api::{
    Error, ErrorKind, FileStore, MemoryStore, PipelineConfig, Port, PortId, PortPatch, PortStore,
    upload_ports,
};

pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    /// Snapshot file; `None` keeps ports in memory only.
    pub store_path: Option<PathBuf>,
    pub chunk_size: usize,
    pub batch_size: usize,
    pub max_upload_bytes: u64,
    pub allow_non_loopback: bool,
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn PortStore>,
    pipeline: PipelineConfig,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    validate_config(&config)?;

    init_tracing();

    let max_upload_bytes: usize = config
        .max_upload_bytes
        .try_into()
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("--max-upload-bytes is too large"))?;

    let store: Arc<dyn PortStore> = match &config.store_path {
        Some(path) => Arc::new(FileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let state = Arc::new(AppState {
        store,
        pipeline: PipelineConfig::default()
            .with_chunk_size(config.chunk_size)
            .with_batch_size(config.batch_size),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ports", get(list_ports).post(create_port))
        .route(
            "/ports/:id_or_slug",
            get(fetch_port).put(update_port).delete(delete_port),
        )
        .route("/upload-ports", post(upload_ports_route))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to bind server")
                .with_source(err)
        })?;
    info!(
        bind = %config.bind,
        store = config
            .store_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "memory".to_string()),
        "portload gateway listening"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(addr) => addr.is_loopback(),
        IpAddr::V6(addr) => addr.is_loopback(),
    }
}

fn validate_config(config: &ServeConfig) -> Result<(), Error> {
    if !is_loopback(config.bind.ip()) && !config.allow_non_loopback {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("non-loopback bind requires explicit opt-in")
            .with_hint("Re-run with --allow-non-loopback or use a loopback address."));
    }

    if config.max_upload_bytes == 0 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-upload-bytes must be greater than zero")
            .with_hint("Use a positive value like 10485760."));
    }

    if config.max_upload_bytes > usize::MAX as u64 {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("--max-upload-bytes exceeds platform limits")
            .with_hint("Use a smaller value that fits in memory."));
    }

    PipelineConfig::default()
        .with_chunk_size(config.chunk_size)
        .with_batch_size(config.batch_size)
        .validate()
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u64>,
}

async fn list_ports(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list() {
        Ok(ports) => json_response(json!({ "ports": ports })),
        Err(err) => error_response(err),
    }
}

async fn create_port(State(state): State<Arc<AppState>>, Json(port): Json<Port>) -> Response {
    match state.store.create(port) {
        Ok(port) => json_response_with_status(StatusCode::CREATED, json!({ "port": port })),
        Err(err) => error_response(err),
    }
}

async fn fetch_port(
    State(state): State<Arc<AppState>>,
    AxumPath(id_or_slug): AxumPath<String>,
) -> Response {
    match PortId::parse(&id_or_slug).and_then(|id| state.store.fetch(&id)) {
        Ok(port) => json_response(json!({ "port": port })),
        Err(err) => error_response(err),
    }
}

async fn update_port(
    State(state): State<Arc<AppState>>,
    AxumPath(id_or_slug): AxumPath<String>,
    Json(patch): Json<PortPatch>,
) -> Response {
    if patch.is_empty() {
        return error_response(
            Error::new(ErrorKind::Usage)
                .with_message("update must set at least one field")
                .with_hint("Send a JSON object such as {\"name\": \"Ajman\"}."),
        );
    }
    match PortId::parse(&id_or_slug).and_then(|id| state.store.update(&id, patch)) {
        Ok(port) => json_response(json!({ "port": port })),
        Err(err) => error_response(err),
    }
}

async fn delete_port(
    State(state): State<Arc<AppState>>,
    AxumPath(id_or_slug): AxumPath<String>,
) -> Response {
    match PortId::parse(&id_or_slug).and_then(|id| state.store.delete(&id)) {
        Ok(_) => json_response(json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

async fn upload_ports_route(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Response {
    let field = loop {
        match multipart.next_field().await {
            Ok(Some(field)) if field.name() == Some("file") => break field,
            Ok(Some(_)) => continue,
            Ok(None) => {
                return error_response(
                    Error::new(ErrorKind::Usage)
                        .with_message("multipart field 'file' is required")
                        .with_hint("Send the ports document as form field 'file'."),
                );
            }
            Err(err) if err.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return upload_too_large_response();
            }
            Err(err) => {
                let status = err.status();
                return error_response_with_status(
                    Error::new(ErrorKind::Usage).with_message(err.body_text()),
                    status,
                );
            }
        }
    };

    // Depth 1 keeps at most one body chunk queued ahead of the pipeline.
    let (tx, rx) = mpsc::channel(1);
    let store = Arc::clone(&state.store);
    let pipeline = state.pipeline;
    let ingest = tokio::task::spawn_blocking(move || {
        upload_ports(ChannelReader::new(rx), pipeline, store.as_ref())
    });

    let (fed, ingested) = tokio::join!(feed_field(field, tx), ingest);

    if fed == Err(StatusCode::PAYLOAD_TOO_LARGE) {
        return upload_too_large_response();
    }

    match ingested {
        Ok(Ok(outcome)) => json_response(json!({
            "ok": true,
            "batches": outcome.batches,
            "ports": outcome.ports,
        })),
        Ok(Err(err)) => {
            error!(kind = ?err.kind(), error = %err, "port upload failed");
            internal_error_response()
        }
        Err(err) => {
            error!(error = %err, "port upload task failed");
            internal_error_response()
        }
    }
}

/// Forwards multipart chunks to the pipeline reader until the field ends or the reader hangs up.
/// The body limit can trip while parsing part headers or while streaming the field.
fn upload_too_large_response() -> Response {
    error_response_with_status(
        Error::new(ErrorKind::Usage)
            .with_message("upload exceeds maximum size")
            .with_hint("Raise --max-upload-bytes or split the document."),
        StatusCode::PAYLOAD_TOO_LARGE,
    )
}

async fn feed_field(
    mut field: Field<'_>,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) -> Result<(), StatusCode> {
    loop {
        match field.chunk().await {
            Ok(Some(bytes)) => {
                if tx.send(Ok(bytes)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => {
                let status = err.status();
                let _ = tx.send(Err(io::Error::other(err.body_text()))).await;
                return Err(status);
            }
        }
    }
}

/// Blocking `Read` over chunks delivered by the async side.
struct ChannelReader {
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
    current: Bytes,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(Ok(bytes)) => self.current = bytes,
                Some(Err(err)) => return Err(err),
                None => return Ok(0),
            }
        }
        let len = buf.len().min(self.current.len());
        buf[..len].copy_from_slice(&self.current[..len]);
        self.current.advance(len);
        Ok(len)
    }
}

fn json_response(payload: serde_json::Value) -> Response {
    Json(payload).into_response()
}

fn json_response_with_status(status: StatusCode, payload: serde_json::Value) -> Response {
    (status, Json(payload)).into_response()
}

fn internal_error_response() -> Response {
    error_response_with_status(
        Error::new(ErrorKind::Internal).with_message("internal error occurred"),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
}

fn error_response(err: Error) -> Response {
    let status = match err.kind() {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::Invalid => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::Permission => StatusCode::FORBIDDEN,
        ErrorKind::Internal
        | ErrorKind::Io
        | ErrorKind::Storage
        | ErrorKind::ReadFailure
        | ErrorKind::MalformedTopLevel
        | ErrorKind::NonStringKey
        | ErrorKind::ValueDecodeFailure => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response_with_status(err, status)
}

fn error_response_with_status(err: Error, status: StatusCode) -> Response {
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: format!("{:?}", err.kind()),
            message: err.message().unwrap_or("error").to_string(),
            hint: err.hint().map(str::to_string),
            path: err.path().map(|path| path.to_string_lossy().to_string()),
            key: err.key().map(str::to_string),
            offset: err.offset(),
        },
    };
    (status, Json(body)).into_response()
}
