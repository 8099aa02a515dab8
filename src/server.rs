use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::dispatch::CompletionBackend;
use crate::error::SiftError;
use crate::extract::{Document, ExtractLimits, OverflowPolicy, extract_text};
use crate::form::{FormDefaults, FormParts, TextRequest};
use crate::response::{ExtractResponse, HealthResponse, SummaryResponse, TextSummaryResponse};
use crate::summarize::pipeline::Pipeline;

/// Multipart framing and text fields on top of the file itself.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Shared per-process state. The backend inside the pipeline is built once
/// and reused by every request.
pub struct AppState<B> {
    pub pipeline: Arc<Pipeline<B>>,
    pub defaults: Arc<FormDefaults>,
    pub limits: ExtractLimits,
}

// Manual impl: `B` itself does not need to be Clone.
impl<B> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            defaults: self.defaults.clone(),
            limits: self.limits,
        }
    }
}

impl<B: CompletionBackend + 'static> AppState<B> {
    pub fn new(pipeline: Pipeline<B>, defaults: FormDefaults, limits: ExtractLimits) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            defaults: Arc::new(defaults),
            limits,
        }
    }
}

pub fn router<B: CompletionBackend + 'static>(state: AppState<B>) -> Router {
    let body_limit = state.limits.max_bytes.saturating_add(BODY_LIMIT_SLACK);
    Router::new()
        .route("/health", get(health))
        .route("/extract", post(extract::<B>))
        .route("/summaries", post(summarize::<B>))
        .route("/api/summarize", post(summarize_text::<B>))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled; in-flight requests finish first.
pub async fn serve<B: CompletionBackend + 'static>(
    listener: TcpListener,
    state: AppState<B>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "sift",
    })
}

async fn extract<B: CompletionBackend + 'static>(
    State(state): State<AppState<B>>,
    multipart: Multipart,
) -> Result<Json<ExtractResponse>, SiftError> {
    let mut parts = FormParts::read(multipart).await?;
    let upload = parts.take_upload()?;
    let policy = overflow_policy(&parts)?;

    let document = extract_text(&upload.bytes, &state.limits, policy)?;
    tracing::info!(
        filename = %upload.filename,
        encoding = document.encoding,
        bytes = document.byte_count,
        truncated = document.truncated,
        "extracted upload"
    );
    Ok(Json(ExtractResponse::new(upload.filename, document)))
}

async fn summarize<B: CompletionBackend + 'static>(
    State(state): State<AppState<B>>,
    multipart: Multipart,
) -> Result<Json<SummaryResponse>, SiftError> {
    let mut parts = FormParts::read(multipart).await?;
    let upload = parts.take_upload()?;
    let opts = parts.summarize_options(&state.defaults)?;
    let include_source_text = parts.flag("include_source_text", false)?;
    let policy = overflow_policy(&parts)?;

    let document = extract_text(&upload.bytes, &state.limits, policy)?;
    if document.text.trim().is_empty() {
        return Err(SiftError::Validation("file contains no text".to_string()));
    }

    let outcome = state.pipeline.run(&document, &opts).await?;
    let source_text = include_source_text.then(|| document.clip(opts.max_input_chars).to_string());
    Ok(Json(SummaryResponse::new(
        upload.filename,
        opts.model,
        opts.mode,
        &document,
        outcome,
        source_text,
    )))
}

/// JSON variant of `/summaries` for callers that already hold the text.
async fn summarize_text<B: CompletionBackend + 'static>(
    State(state): State<AppState<B>>,
    body: Result<Json<TextRequest>, JsonRejection>,
) -> Result<Json<TextSummaryResponse>, SiftError> {
    let Json(req) =
        body.map_err(|e| SiftError::Validation(format!("invalid JSON body: {}", e.body_text())))?;
    let (text, fields) = req.into_parts();
    let opts = fields.resolve(&state.defaults)?;
    if text.trim().is_empty() {
        return Err(SiftError::Validation("text must not be empty".to_string()));
    }

    let document = Document::from_text(text, &state.limits);
    let outcome = state.pipeline.run(&document, &opts).await?;
    Ok(Json(TextSummaryResponse::new(opts.model, opts.mode, &document, outcome)))
}

/// `truncate` form field: clip oversized text (default) or reject it.
fn overflow_policy(parts: &FormParts) -> Result<OverflowPolicy, SiftError> {
    Ok(if parts.flag("truncate", true)? {
        OverflowPolicy::Truncate
    } else {
        OverflowPolicy::Reject
    })
}
