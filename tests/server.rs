//! HTTP surface against a live axum server on an ephemeral port.

use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sift::dispatch::ollama::{OllamaClient, OllamaSettings};
use sift::dispatch::{CompletionBackend, StopReason};
use sift::extract::ExtractLimits;
use sift::form::FormDefaults;
use sift::server::{self, AppState};
use sift::summarize::{Pipeline, PipelineSettings};
use sift::testing::ScriptedBackend;

const SOURCE: &str = "Acme Corp reported results on Tuesday. Revenue grew 10% to $2.1 billion. \
Operating costs fell 3%. The company hired 400 engineers. Shares rose 5%.";

const FIVE_BULLETS: &str = "- Revenue grew 10% to $2.1 billion.\n- Operating costs fell 3%.\n\
- The company hired 400 engineers.\n- Results came out on Tuesday.\n- Shares rose 5%.";

struct TestServer {
    base: String,
    shutdown: CancellationToken,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn spawn_with<B: CompletionBackend + 'static>(
    backend: Arc<B>,
    limits: ExtractLimits,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(
        Pipeline::new(backend, PipelineSettings::default()),
        FormDefaults::default(),
        limits,
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(server::serve(listener, state, shutdown.clone()));
    TestServer {
        base: format!("http://{addr}"),
        shutdown,
    }
}

async fn spawn(backend: Arc<ScriptedBackend>) -> TestServer {
    spawn_with(backend, ExtractLimits::default()).await
}

fn upload(name: &str, bytes: Vec<u8>) -> Form {
    Form::new().part("file", Part::bytes(bytes).file_name(name.to_string()))
}

async fn post(url: String, form: Form) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(url)
        .multipart(form)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

// ---------------------------------------------------------------------------
// /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_ok() {
    let server = spawn(Arc::new(ScriptedBackend::new())).await;
    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "sift");
}

// ---------------------------------------------------------------------------
// /summaries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn summary_response_shape() {
    let backend = Arc::new(ScriptedBackend::new().reply(FIVE_BULLETS, StopReason::NaturalEnd));
    let server = spawn(backend.clone()).await;

    let form = upload("news.txt", SOURCE.as_bytes().to_vec())
        .text("mode", "news")
        .text("include_source_text", "true");
    let (status, body) = post(format!("{}/summaries", server.base), form).await;

    assert_eq!(status, 200, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["filename"], "news.txt");
    assert_eq!(body["model"], "phi3");
    assert_eq!(body["mode"], "bulleted");
    assert_eq!(body["bullets_returned"], 5);
    assert_eq!(body["degraded"], false);
    assert_eq!(body["extract"]["encoding"], "utf-8");
    assert_eq!(body["extract"]["bytes"], SOURCE.len());
    assert_eq!(body["extract"]["lines"], 1);
    assert_eq!(body["extract"]["sent_chars"], SOURCE.chars().count());
    assert_eq!(body["text"], SOURCE);
    assert_eq!(body["metrics"]["path"], "short");
    assert_eq!(body["metrics"]["first_stop_reason"], "natural_end");
    assert_eq!(body["metrics"]["calls"][0]["stage"], "draft");
    assert!(body["summary"].as_str().unwrap().starts_with("- Revenue grew 10%"));
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn source_text_omitted_by_default() {
    let backend = Arc::new(ScriptedBackend::new().reply(FIVE_BULLETS, StopReason::NaturalEnd));
    let server = spawn(backend).await;

    let (status, body) = post(
        format!("{}/summaries", server.base),
        upload("news.txt", SOURCE.as_bytes().to_vec()),
    )
    .await;
    assert_eq!(status, 200);
    assert!(body.get("text").is_none());
}

#[tokio::test]
async fn non_txt_upload_rejected() {
    let backend = Arc::new(ScriptedBackend::new());
    let server = spawn(backend.clone()).await;

    let (status, body) = post(
        format!("{}/summaries", server.base),
        upload("report.pdf", b"%PDF-1.7".to_vec()),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn missing_file_rejected() {
    let server = spawn(Arc::new(ScriptedBackend::new())).await;
    let (status, body) = post(
        format!("{}/summaries", server.base),
        Form::new().text("mode", "plain"),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["detail"].as_str().unwrap().contains("file is required"));
}

#[tokio::test]
async fn bad_temperature_rejected() {
    let backend = Arc::new(ScriptedBackend::new());
    let server = spawn(backend.clone()).await;

    let form = upload("news.txt", SOURCE.as_bytes().to_vec()).text("temperature", "3.5");
    let (status, body) = post(format!("{}/summaries", server.base), form).await;
    assert_eq!(status, 400);
    assert!(body["detail"].as_str().unwrap().contains("temperature"));
    assert_eq!(backend.call_count(), 0);
}

#[tokio::test]
async fn binary_upload_rejected() {
    let server = spawn(Arc::new(ScriptedBackend::new())).await;
    let (status, body) = post(
        format!("{}/summaries", server.base),
        upload("data.txt", vec![0x41, 0x00, 0x42, 0x43]),
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"], "binary_content");
}

#[tokio::test]
async fn unreachable_backend_is_503() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = OllamaClient::new(&OllamaSettings {
        base_url: format!("http://127.0.0.1:{port}"),
        ..OllamaSettings::default()
    })
    .unwrap();
    let server = spawn_with(Arc::new(client), ExtractLimits::default()).await;

    let (status, body) = post(
        format!("{}/summaries", server.base),
        upload("news.txt", SOURCE.as_bytes().to_vec()),
    )
    .await;
    assert_eq!(status, 503);
    assert_eq!(body["ok"], false);
    assert_eq!(body["error"], "backend_unavailable");
}

#[tokio::test]
async fn summaries_honour_truncate_flag() {
    let limits = ExtractLimits {
        max_text_chars: 40,
        ..ExtractLimits::default()
    };
    let backend = Arc::new(ScriptedBackend::new().reply(FIVE_BULLETS, StopReason::NaturalEnd));
    let server = spawn_with(backend.clone(), limits).await;

    let form = upload("news.txt", SOURCE.as_bytes().to_vec()).text("truncate", "false");
    let (status, body) = post(format!("{}/summaries", server.base), form).await;
    assert_eq!(status, 413);
    assert_eq!(body["error"], "text_too_long");
    assert_eq!(backend.call_count(), 0);

    let (status, body) = post(
        format!("{}/summaries", server.base),
        upload("news.txt", SOURCE.as_bytes().to_vec()),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["extract"]["sent_chars"], 40);
}

// ---------------------------------------------------------------------------
// /api/summarize
// ---------------------------------------------------------------------------

#[tokio::test]
async fn json_text_endpoint_runs_the_pipeline() {
    let backend = Arc::new(ScriptedBackend::new().reply(FIVE_BULLETS, StopReason::NaturalEnd));
    let server = spawn(backend.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/summarize", server.base))
        .json(&serde_json::json!({ "text": SOURCE, "mode": "news", "max_chars": 50 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(body["mode"], "bulleted");
    assert_eq!(body["bullets_returned"], 5);
    assert_eq!(body["input_chars"], SOURCE.chars().count());
    assert_eq!(body["sent_chars"], 50);
    assert_eq!(backend.call_count(), 1);
}

#[tokio::test]
async fn json_text_endpoint_validates_body() {
    let backend = Arc::new(ScriptedBackend::new());
    let server = spawn(backend.clone()).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/summarize", server.base);

    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "text": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .post(&url)
        .json(&serde_json::json!({ "mode": "plain" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");
    assert_eq!(backend.call_count(), 0);
}

// ---------------------------------------------------------------------------
// /extract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn extract_decodes_cp949() {
    let server = spawn(Arc::new(ScriptedBackend::new())).await;
    let (encoded, _, _) = encoding_rs::EUC_KR.encode("정부는 예산을 늘렸다.\n둘째 줄");

    let (status, body) = post(
        format!("{}/extract", server.base),
        upload("korean.txt", encoded.into_owned()),
    )
    .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["type"], "txt");
    assert_eq!(body["encoding"], "cp949");
    assert_eq!(body["text"], "정부는 예산을 늘렸다.\n둘째 줄");
    assert_eq!(body["lines"], 2);
}

#[tokio::test]
async fn extract_truncate_flag_controls_overflow() {
    let limits = ExtractLimits {
        max_text_chars: 10,
        ..ExtractLimits::default()
    };
    let server = spawn_with(Arc::new(ScriptedBackend::new()), limits).await;
    let text = "abcdefghijklmnopqrstuvwxyz".as_bytes().to_vec();

    let (status, body) = post(
        format!("{}/extract", server.base),
        upload("a.txt", text.clone()),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["text"], "abcdefghij");

    let form = upload("a.txt", text).text("truncate", "false");
    let (status, body) = post(format!("{}/extract", server.base), form).await;
    assert_eq!(status, 413);
    assert_eq!(body["error"], "text_too_long");
}
