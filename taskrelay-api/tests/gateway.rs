//! Client against a real gateway bound on a loopback port.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use taskrelay_api::{ApiError, TaskClient};
use taskrelay_broker::{
    http::server::{serve, GatewaySettings},
    in_memory::InMemoryBroker,
    in_memory_list::InMemoryListBroker,
    Broker, BrokerConnection,
};
use taskrelay_utilities::retry::{FixedBackoff, RecordingSleeper};
use taskrelay_worker::{demo, TaskProcessor, Worker, WorkerSettings};
use tempfile::TempDir;
use tokio::net::TcpListener;

const PATIENCE: Duration = Duration::from_secs(5);

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    (listener, base_url)
}

async fn start_gateway(broker: Arc<dyn Broker>, settings: GatewaySettings) -> String {
    let (listener, base_url) = bind().await;
    tokio::spawn(serve(listener, broker, settings));
    base_url
}

fn gateway_settings(upload_dir: &TempDir) -> GatewaySettings {
    GatewaySettings {
        upload_dir: upload_dir.path().to_path_buf(),
        ..GatewaySettings::default()
    }
}

fn client(base_url: &str) -> TaskClient {
    TaskClient::new(base_url)
        .unwrap()
        .with_backoff(FixedBackoff::new(Duration::from_millis(50)))
}

fn start_worker(
    broker: Arc<dyn Broker>,
    processor: Arc<dyn TaskProcessor>,
    queue: &str,
) -> taskrelay_worker::WorkerHandle {
    let settings = WorkerSettings::new(queue).with_poll_interval(Duration::from_millis(20));
    let worker = Worker::new(broker, processor, settings);
    let handle = worker.handle();
    tokio::spawn(async move { worker.run().await });
    handle
}

#[tokio::test]
async fn submitted_text_comes_back_upper_cased() {
    let dir = tempfile::tempdir().unwrap();
    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let base_url = start_gateway(Arc::clone(&broker), gateway_settings(&dir)).await;
    let worker = start_worker(
        Arc::clone(&broker),
        Arc::new(demo::uppercase_text),
        "string_queue",
    );

    let client = client(&base_url);
    let task_id = client
        .submit_task(&json!({"text": "some text"}), "string_queue")
        .await;
    let result = tokio::time::timeout(PATIENCE, client.get_result(&task_id, true))
        .await
        .expect("result never arrived")
        .unwrap();

    assert_eq!(
        result,
        Some(json!({"text": "SOME TEXT", "task_id": task_id}))
    );
    worker.stop();
}

#[tokio::test]
async fn submitted_value_comes_back_doubled_on_the_list_backend() {
    let dir = tempfile::tempdir().unwrap();
    let broker: Arc<dyn Broker> = Arc::new(InMemoryListBroker::default());
    let base_url = start_gateway(Arc::clone(&broker), gateway_settings(&dir)).await;
    let worker = start_worker(
        Arc::clone(&broker),
        Arc::new(demo::double_value),
        "math_queue",
    );

    let client = client(&base_url);
    let task_id = client.submit_task(&json!({"value": 5}), "math_queue").await;
    let result = tokio::time::timeout(PATIENCE, client.get_result(&task_id, true))
        .await
        .expect("result never arrived")
        .unwrap()
        .unwrap();

    assert_eq!(result["value"], json!(10));
    worker.stop();
}

#[tokio::test]
async fn result_is_absent_until_a_worker_has_run() {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let base_url = start_gateway(Arc::new(broker.clone()), gateway_settings(&dir)).await;

    let client = client(&base_url);
    let task_id = client
        .submit_task(&json!({"text": "pending"}), "string_queue")
        .await;

    assert_eq!(client.get_result(&task_id, false).await.unwrap(), None);
    assert_eq!(broker.pending("string_queue"), 1);

    let response = reqwest::get(format!("{base_url}/get_result/{task_id}"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Result not ready or task not found");
}

#[tokio::test]
async fn submit_retries_until_the_gateway_accepts() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().route(
        "/submit_task",
        post(move || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({"error": "down"})),
                    )
                } else {
                    (StatusCode::ACCEPTED, Json(json!({"task_id": "abc"})))
                }
            }
        }),
    );
    let (listener, base_url) = bind().await;
    tokio::spawn(async move { axum::serve(listener, app).await });

    let sleeper = Arc::new(RecordingSleeper::new());
    let client = TaskClient::new(&base_url)
        .unwrap()
        .with_backoff(FixedBackoff::with_sleeper(
            Duration::from_secs(1),
            sleeper.clone(),
        ));

    let task_id = client.submit_task(&json!({"text": "x"}), "string_queue").await;
    assert_eq!(task_id, "abc");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(sleeper.delays(), vec![Duration::from_secs(1); 2]);
}

#[tokio::test]
async fn gateway_answers_500_once_its_enqueue_retries_run_out() {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    broker.set_available(false);
    let sleeper = Arc::new(RecordingSleeper::new());
    let settings = GatewaySettings {
        submit_backoff: FixedBackoff::with_sleeper(Duration::from_secs(1), sleeper.clone()),
        ..gateway_settings(&dir)
    };
    let base_url = start_gateway(Arc::new(broker.clone()), settings).await;

    let outcome = client(&base_url)
        .try_submit_task(&json!({"text": "x"}), "string_queue")
        .await;
    match outcome {
        Err(ApiError::Http { status, .. }) => {
            assert_eq!(status, reqwest::StatusCode::INTERNAL_SERVER_ERROR)
        }
        other => panic!("expected an HTTP 500, got {other:?}"),
    }
    assert_eq!(sleeper.count(), 2);
    assert_eq!(broker.pending("string_queue"), 0);
}

#[tokio::test]
async fn uploaded_file_can_be_downloaded_again() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let base_url = start_gateway(Arc::new(InMemoryBroker::new()), gateway_settings(&dir)).await;
    let client = client(&base_url);

    let source = scratch.path().join("clip.bin");
    let content: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    tokio::fs::write(&source, &content).await.unwrap();

    let file_url = client.upload_file(&source).await.unwrap();
    assert!(dir.path().join(&file_url).exists());

    let target = scratch.path().join("clip_result.bin");
    let downloaded = client.get_file(&file_url, &target).await.unwrap();
    assert_eq!(downloaded, content);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), content);
}

#[tokio::test]
async fn file_errors_propagate_to_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let base_url = start_gateway(Arc::new(InMemoryBroker::new()), gateway_settings(&dir)).await;
    let client = client(&base_url);
    let target = scratch.path().join("out.bin");

    match client.get_file("does-not-exist", &target).await {
        Err(ApiError::Http { status, .. }) => assert_eq!(status, reqwest::StatusCode::NOT_FOUND),
        other => panic!("expected 404, got {other:?}"),
    }
    match client.get_file("../secret", &target).await {
        Err(ApiError::Http { status, .. }) => {
            assert_eq!(status, reqwest::StatusCode::BAD_REQUEST)
        }
        other => panic!("expected 400, got {other:?}"),
    }
    assert!(matches!(
        client.upload_file(scratch.path().join("missing.bin")).await,
        Err(ApiError::Io { .. })
    ));
    assert!(!target.exists());
}

#[tokio::test]
async fn flat_submit_body_queues_the_task_without_its_queue_field() {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let base_url = start_gateway(Arc::new(broker.clone()), gateway_settings(&dir)).await;

    let response = reqwest::Client::new()
        .post(format!("{base_url}/submit_task"))
        .json(&json!({"text": "hello", "queue": "string_queue"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);
    let accepted: Value = response.json().await.unwrap();
    let task_id = accepted["task_id"].as_str().unwrap().to_string();

    let mut connection = broker.connect("string_queue").await.unwrap();
    let delivery = connection
        .next_delivery(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("task was not queued");
    let queued: Value = serde_json::from_slice(&delivery.body).unwrap();
    assert_eq!(queued, json!({"text": "hello", "task_id": task_id}));
    connection.ack(&delivery).await.unwrap();
}

#[tokio::test]
async fn submit_body_without_a_task_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let base_url = start_gateway(Arc::new(broker.clone()), gateway_settings(&dir)).await;
    let http = reqwest::Client::new();

    for body in [json!({"queue": "string_queue"}), json!({"payload": null}), json!("text")] {
        let response = http
            .post(format!("{base_url}/submit_task"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{body}");
    }
    assert_eq!(broker.pending("string_queue"), 0);
}

#[tokio::test]
async fn submit_waits_out_a_gateway_that_is_not_listening_yet() {
    let dir = tempfile::tempdir().unwrap();
    let (listener, base_url) = bind().await;
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sleeper = Arc::new(RecordingSleeper::new());
    let client = TaskClient::new(&base_url)
        .unwrap()
        .with_backoff(FixedBackoff::with_sleeper(
            Duration::from_secs(1),
            sleeper.clone(),
        ));
    let submit = tokio::spawn(async move {
        client
            .submit_task(&json!({"text": "late"}), "string_queue")
            .await
    });

    tokio::time::timeout(PATIENCE, async {
        while sleeper.count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("submit never retried");

    let broker = InMemoryBroker::new();
    let listener = TcpListener::bind(addr).await.unwrap();
    tokio::spawn(serve(listener, Arc::new(broker.clone()), gateway_settings(&dir)));

    let task_id = tokio::time::timeout(PATIENCE, submit)
        .await
        .expect("submit never finished")
        .unwrap();
    assert!(!task_id.is_empty());
    assert_eq!(broker.pending("string_queue"), 1);
}

#[tokio::test]
async fn large_files_stream_through_the_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let base_url = start_gateway(Arc::new(InMemoryBroker::new()), gateway_settings(&dir)).await;
    let client = client(&base_url);

    let source = scratch.path().join("video.bin");
    let content: Vec<u8> = (0..3 * 1024 * 1024).map(|n: u32| (n % 251) as u8).collect();
    tokio::fs::write(&source, &content).await.unwrap();

    let file_url = client.upload_file(&source).await.unwrap();
    let stored = tokio::fs::read(dir.path().join(&file_url)).await.unwrap();
    assert_eq!(stored.len(), content.len());
    assert!(stored == content);

    let target = scratch.path().join("video_result.bin");
    let downloaded = client.get_file(&file_url, &target).await.unwrap();
    assert!(downloaded == content);
    assert!(tokio::fs::read(&target).await.unwrap() == content);
}
