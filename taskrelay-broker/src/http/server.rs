//! HTTP gateway in front of a broker: task submission, result lookup and
//! file transfer.

use std::{
    io,
    net::SocketAddr,
    path::{Path as FsPath, PathBuf},
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskrelay_models::{
    core::Task,
    web::{ErrorResponse, ResultResponse, SubmitTaskRequest, SubmitTaskResponse, UploadResponse},
};
use taskrelay_utilities::retry::FixedBackoff;
use tokio::{fs::File, io::AsyncWriteExt, net::TcpListener};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::{Broker, BrokerError};

#[derive(Clone)]
pub struct GatewaySettings {
    pub upload_dir: PathBuf,
    pub submit_retries: u32,
    pub submit_backoff: FixedBackoff,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            submit_retries: 3,
            submit_backoff: FixedBackoff::new(Duration::from_secs(1)),
        }
    }
}

#[derive(Clone)]
struct AppState {
    broker: Arc<dyn Broker>,
    settings: Arc<GatewaySettings>,
}

pub fn router(broker: Arc<dyn Broker>, settings: GatewaySettings) -> Router {
    let state = AppState {
        broker,
        settings: Arc::new(settings),
    };

    Router::new()
        .route("/submit_task", post(submit_task))
        .route("/get_result/:task_id", get(get_result))
        .route("/upload_file", post(upload_file))
        .route("/get_file", get(get_file))
        .with_state(state)
}

/// Serve the gateway on `listener`, running the broker's result collector
/// for as long as the server runs.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<dyn Broker>,
    settings: GatewaySettings,
) -> Result<(), io::Error> {
    let collector = broker.spawn_result_collector();
    let served = axum::serve(listener, router(broker, settings)).await;
    if let Some(collector) = collector {
        collector.abort();
    }
    served
}

pub async fn run_server(
    addr: SocketAddr,
    broker: Arc<dyn Broker>,
    settings: GatewaySettings,
) -> Result<(), io::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", listener.local_addr()?);
    serve(listener, broker, settings).await
}

async fn submit_task(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    let Some(request) = SubmitTaskRequest::from_body(body) else {
        warn!("Rejected submit body without a task object");
        return json_response(
            StatusCode::BAD_REQUEST,
            ErrorResponse::new("Request body must contain a task object"),
        );
    };
    let task = Task::new(Uuid::new_v4().to_string(), request.payload, request.queue);
    let broker = Arc::clone(&state.broker);
    let task_ref = &task;

    let published = state
        .settings
        .submit_backoff
        .retry_bounded(
            "Publishing task",
            state.settings.submit_retries,
            move || {
                let broker = Arc::clone(&broker);
                async move { broker.enqueue(task_ref).await }
            },
        )
        .await;

    match published {
        Ok(()) => {
            info!("Task {} queued on {}", task.task_id, task.queue_name);
            json_response(
                StatusCode::ACCEPTED,
                SubmitTaskResponse {
                    task_id: task.task_id,
                },
            )
        }
        Err(err) => {
            error!("Failed to publish task {}: {}", task.task_id, err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("Failed to publish message after retries"),
            )
        }
    }
}

async fn get_result(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.broker.fetch_result(&task_id).await {
        Ok(Some(result)) => json_response(
            StatusCode::OK,
            ResultResponse {
                task_id,
                result: result.value,
            },
        ),
        Ok(None) => json_response(
            StatusCode::NOT_FOUND,
            ErrorResponse::new("Result not ready or task not found"),
        ),
        Err(err) => broker_error_response(err),
    }
}

async fn upload_file(State(state): State<AppState>, body: Body) -> Response {
    let file_name = Uuid::new_v4().simple().to_string();

    match store_upload(&state.settings.upload_dir, &file_name, body).await {
        Ok(size) => {
            info!("Stored upload {} ({} bytes)", file_name, size);
            json_response(
                StatusCode::CREATED,
                UploadResponse {
                    file_url: file_name,
                },
            )
        }
        Err(err) => {
            error!("Failed to store upload: {}", err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("File upload failed"),
            )
        }
    }
}

/// Stream a request body into `dir/file_name`. A partial file is removed.
async fn store_upload(dir: &FsPath, file_name: &str, body: Body) -> io::Result<u64> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    let file = File::create(&path).await?;

    let written = write_body(file, body).await;
    if written.is_err() {
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!("Could not remove partial upload {}: {}", path.display(), err);
        }
    }
    written
}

async fn write_body(mut file: File, body: Body) -> io::Result<u64> {
    let mut chunks = body.into_data_stream();
    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

#[derive(Debug, Deserialize)]
struct FileQuery {
    #[serde(rename = "fileUrl")]
    file_url: String,
}

async fn get_file(State(state): State<AppState>, Query(query): Query<FileQuery>) -> Response {
    let Some(path) = resolve_upload(&state.settings.upload_dir, &query.file_url) else {
        return json_response(StatusCode::BAD_REQUEST, ErrorResponse::new("Invalid file url"));
    };

    match File::open(&path).await {
        Ok(file) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            Body::from_stream(ReaderStream::new(file)),
        )
            .into_response(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            json_response(StatusCode::NOT_FOUND, ErrorResponse::new("File not found"))
        }
        Err(err) => {
            error!("Failed to read {}: {}", path.display(), err);
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("File download failed"),
            )
        }
    }
}

/// Map a file url to a path inside the upload directory. Names that could
/// leave the directory are rejected.
fn resolve_upload(upload_dir: &FsPath, file_url: &str) -> Option<PathBuf> {
    let name = file_url.trim();
    let escapes = name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\');
    if escapes {
        warn!("Rejected file url '{}'", file_url);
        return None;
    }
    Some(upload_dir.join(name))
}

fn broker_error_response(err: BrokerError) -> Response {
    let status = if err.is_connection_fault() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error!("Broker error while serving request: {}", err);
    json_response(status, ErrorResponse::new(err.to_string()))
}

fn json_response<T>(status: StatusCode, payload: T) -> Response
where
    T: Serialize,
{
    (status, Json(payload)).into_response()
}
