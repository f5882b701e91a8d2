use std::{path::Path, time::Duration};

use futures_util::StreamExt;
use log::{info, warn};
use reqwest::{Body, Client, Response, StatusCode, Url};
use serde_json::Value;
use taskrelay_models::web::{ResultResponse, SubmitTaskRequest, SubmitTaskResponse, UploadResponse};
use taskrelay_utilities::retry::FixedBackoff;
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::error::{ApiError, Result};

const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the task gateway: submits tasks, reads results and moves files.
#[derive(Clone)]
pub struct TaskClient {
    client: Client,
    base_url: Url,
    submit_backoff: FixedBackoff,
    poll_backoff: FixedBackoff,
}

impl TaskClient {
    /// Construct a client with a default `reqwest::Client` (10 second request timeout).
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Self::with_client(base_url, client)
    }

    /// Construct a client using a preconfigured HTTP client instance.
    pub fn with_client(base_url: &str, client: Client) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|source| ApiError::InvalidBaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        Ok(Self {
            client,
            base_url,
            submit_backoff: FixedBackoff::new(RETRY_INTERVAL),
            poll_backoff: FixedBackoff::new(RETRY_INTERVAL),
        })
    }

    /// Replace the pause used between submit retries and between result polls.
    pub fn with_backoff(mut self, backoff: FixedBackoff) -> Self {
        self.submit_backoff = backoff.clone();
        self.poll_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Submit `payload` to `queue_name` and return the assigned task id.
    ///
    /// Retries every second until the gateway accepts the task. There is no
    /// attempt limit: the call only returns once the submission succeeded.
    pub async fn submit_task(&self, payload: &Value, queue_name: &str) -> String {
        let task_id = self
            .submit_backoff
            .retry_forever("Submitting task", || {
                self.try_submit_task(payload, queue_name)
            })
            .await;
        info!("Task submitted with ID: {}", task_id);
        task_id
    }

    /// Single submission attempt.
    pub async fn try_submit_task(&self, payload: &Value, queue_name: &str) -> Result<String> {
        let url = self.build_url("/submit_task")?;
        let request = SubmitTaskRequest {
            queue: queue_name.to_string(),
            payload: payload.clone(),
        };
        let response = self.client.post(url.clone()).json(&request).send().await?;
        let response = Self::handle_response(url, response).await?;
        let accepted = response.json::<SubmitTaskResponse>().await?;
        if accepted.task_id.is_empty() {
            return Err(ApiError::MissingTaskId);
        }
        Ok(accepted.task_id)
    }

    /// Read the result of `task_id`.
    ///
    /// With `wait` the gateway is polled every second until it answers with a
    /// result; a task that failed looks the same as one still running, so this
    /// can wait forever. Without `wait` a single lookup is made and any
    /// non-success answer, including "not ready yet", yields `None`.
    pub async fn get_result(&self, task_id: &str, wait: bool) -> Result<Option<Value>> {
        if !wait {
            return self.poll_result(task_id).await;
        }

        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.poll_result(task_id).await {
                Ok(Some(result)) => return Ok(Some(result)),
                Ok(None) => {}
                Err(err) => warn!(
                    "Polling result of {} failed (attempt {}): {}",
                    task_id, attempt, err
                ),
            }
            self.poll_backoff.wait().await;
        }
    }

    async fn poll_result(&self, task_id: &str) -> Result<Option<Value>> {
        let url = self.build_url(&format!("/get_result/{task_id}"))?;
        let response = self.client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            info!("Task {} result not found or not ready yet", task_id);
            return Ok(None);
        }
        let body = response.json::<ResultResponse>().await?;
        info!("Result for task {}: {}", task_id, body.result);
        Ok(Some(body.result))
    }

    /// Upload the file at `path` and return the name the gateway stored it under.
    ///
    /// The file is streamed from disk, never read into memory whole.
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<String> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|source| io_error(path, source))?;

        let url = self.build_url("/upload_file")?;
        let response = self
            .client
            .post(url.clone())
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let message = read_message(response).await;
            return Err(ApiError::Http {
                status,
                url,
                message,
            });
        }
        Ok(response.json::<UploadResponse>().await?.file_url)
    }

    /// Download `file_url` into `path`, returning the downloaded bytes.
    ///
    /// The body is written to `path` chunk by chunk as it arrives; nothing is
    /// created when the gateway answers with an error.
    pub async fn get_file(&self, file_url: &str, path: impl AsRef<Path>) -> Result<Vec<u8>> {
        let path = path.as_ref();
        let url = self.build_url("/get_file")?;
        let response = self
            .client
            .get(url.clone())
            .query(&[("fileUrl", file_url)])
            .send()
            .await?;
        let response = Self::handle_response(url, response).await?;

        let mut file = File::create(path)
            .await
            .map_err(|source| io_error(path, source))?;
        let mut downloaded = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .map_err(|source| io_error(path, source))?;
            downloaded.extend_from_slice(&chunk);
        }
        file.flush().await.map_err(|source| io_error(path, source))?;
        Ok(downloaded)
    }

    fn build_url(&self, path: &str) -> Result<Url> {
        let trimmed_path = path.trim_start_matches('/');
        self.base_url
            .join(trimmed_path)
            .map_err(|source| ApiError::InvalidPath {
                base: self.base_url.clone(),
                path: trimmed_path.to_string(),
                source,
            })
    }

    async fn handle_response(url: Url, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let message = read_message(response).await;
            Err(ApiError::Http {
                status,
                url,
                message,
            })
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ApiError {
    ApiError::Io {
        path: path.display().to_string(),
        source,
    }
}

async fn read_message(response: Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|_| "<unable to read body>".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_join_onto_the_base_url() {
        let client = TaskClient::new("http://localhost:5000").unwrap();
        assert_eq!(
            client.build_url("/get_result/abc").unwrap().as_str(),
            "http://localhost:5000/get_result/abc"
        );
    }

    #[test]
    fn malformed_base_url_is_rejected() {
        assert!(matches!(
            TaskClient::new("not a url"),
            Err(ApiError::InvalidBaseUrl { .. })
        ));
    }
}
