use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::dispatch::{
    CompletionBackend, GenerationRequest, GenerationResult, MIN_CALL_BUDGET, StopReason, Usage,
};
use crate::error::SiftError;

pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Transport settings for the Ollama HTTP API.
#[derive(Debug, Clone)]
pub struct OllamaSettings {
    /// Server root, e.g. `http://localhost:11434`.
    pub base_url: String,
    pub keep_alive: String,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    /// Pool size and in-flight cap. Calls beyond it queue on a semaphore.
    pub max_connections: usize,
    pub num_batch: u32,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            keep_alive: "30m".to_string(),
            call_timeout: Duration::from_secs(180),
            connect_timeout: Duration::from_secs(10),
            max_connections: 20,
            num_batch: 256,
        }
    }
}

/// Pooled client for `POST /api/generate`. Built once at startup and shared
/// by reference across requests.
pub struct OllamaClient {
    client: Client,
    endpoint: String,
    keep_alive: String,
    call_timeout: Duration,
    num_batch: u32,
    permits: Semaphore,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    keep_alive: &'a str,
    options: WireOptions<'a>,
}

#[derive(Serialize)]
struct WireOptions<'a> {
    temperature: f64,
    top_p: f64,
    num_predict: u32,
    num_ctx: u32,
    stop: &'a [String],
    num_batch: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    done_reason: Option<String>,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
    prompt_eval_duration: Option<u64>,
    eval_duration: Option<u64>,
}

impl OllamaClient {
    pub fn new(settings: &OllamaSettings) -> Result<Self, SiftError> {
        let max_connections = settings.max_connections.max(1);
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(max_connections)
            .build()
            .map_err(|e| SiftError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", settings.base_url.trim_end_matches('/')),
            keep_alive: settings.keep_alive.clone(),
            call_timeout: settings.call_timeout,
            num_batch: settings.num_batch,
            permits: Semaphore::new(max_connections),
        })
    }

    /// Returns the number of free transport permits (for testing).
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Time left for a call: the per-call timeout clamped to the deadline.
    fn call_budget(&self, deadline: Instant) -> Result<Duration, SiftError> {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|d| *d > MIN_CALL_BUDGET)
            .map(|d| d.min(self.call_timeout))
            .ok_or(SiftError::Timeout(0))
    }

    /// Acquire a transport permit, giving up when the deadline passes first.
    async fn acquire_with_deadline(
        &self,
        deadline: Instant,
    ) -> Result<tokio::sync::SemaphorePermit<'_>, SiftError> {
        let timeout = deadline
            .checked_duration_since(Instant::now())
            .ok_or(SiftError::Timeout(0))?;

        tokio::time::timeout(timeout, self.permits.acquire())
            .await
            .map_err(|_| SiftError::Timeout(timeout.as_millis() as u64))?
            .map_err(|_| SiftError::Other("semaphore closed".to_string()))
    }

    async fn send(&self, req: &GenerationRequest) -> Result<GenerationResult, SiftError> {
        let _permit = self.acquire_with_deadline(req.deadline).await?;
        let timeout = self.call_budget(req.deadline)?;
        let start = Instant::now();

        let body = GenerateBody {
            model: &req.model,
            prompt: &req.prompt,
            stream: false,
            keep_alive: &self.keep_alive,
            options: WireOptions {
                temperature: req.options.temperature,
                top_p: req.options.top_p,
                num_predict: req.options.max_output_tokens,
                num_ctx: req.options.context_window,
                stop: &req.options.stop_sequences,
                num_batch: self.num_batch,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();

        // Cap error body reads to MAX_RESPONSE_BYTES
        if !status.is_success() {
            let error_bytes = response.bytes().await.unwrap_or_default();
            let truncated = &error_bytes[..error_bytes.len().min(MAX_RESPONSE_BYTES)];
            return Err(SiftError::BackendProtocol {
                status: status.as_u16(),
                body: String::from_utf8_lossy(truncated).trim().to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(SiftError::SchemaParse(format!(
                "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                bytes.len()
            )));
        }

        let parsed: GenerateResponse = serde_json::from_slice(&bytes)
            .map_err(|e| SiftError::SchemaParse(format!("failed to parse response: {e}")))?;

        let latency_ms = start.elapsed().as_millis() as u64;
        let stop_reason = StopReason::from_done_reason(parsed.done_reason.as_deref(), parsed.done);

        tracing::debug!(
            model = %req.model,
            latency_ms,
            stop_reason = stop_reason.as_str(),
            output_tokens = ?parsed.eval_count,
            "generation finished"
        );

        Ok(GenerationResult {
            text: parsed.response,
            stop_reason,
            usage: Usage {
                prompt_tokens: parsed.prompt_eval_count,
                output_tokens: parsed.eval_count,
                prompt_duration_ns: parsed.prompt_eval_duration,
                output_duration_ns: parsed.eval_duration,
            },
            latency_ms,
        })
    }
}

fn transport_error(e: reqwest::Error, timeout: Duration) -> SiftError {
    if e.is_timeout() {
        SiftError::Timeout(timeout.as_millis() as u64)
    } else {
        SiftError::from(e)
    }
}

impl CompletionBackend for OllamaClient {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResult, SiftError> {
        self.send(req).await
    }
}
