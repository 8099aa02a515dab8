use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::error::SiftError;
use crate::extract::Document;
use crate::summarize::metrics::PipelineMetrics;
use crate::summarize::pipeline::{Mode, SummaryOutcome};

/// Body of a successful `POST /summaries`.
#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub ok: bool,
    pub filename: String,
    pub model: String,
    pub mode: Mode,
    pub summary: String,
    pub bullets_returned: usize,
    pub degraded: bool,
    pub extract: ExtractInfo,
    /// Clipped source text, only when the client asked for it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub metrics: PipelineMetrics,
}

#[derive(Debug, Serialize)]
pub struct ExtractInfo {
    pub encoding: &'static str,
    pub bytes: usize,
    pub lines: usize,
    pub input_chars: usize,
    pub sent_chars: usize,
}

impl SummaryResponse {
    pub fn new(
        filename: String,
        model: String,
        mode: Mode,
        doc: &Document,
        outcome: SummaryOutcome,
        source_text: Option<String>,
    ) -> Self {
        Self {
            ok: true,
            filename,
            model,
            mode,
            summary: outcome.summary,
            bullets_returned: outcome.bullets_returned,
            degraded: outcome.degraded,
            extract: ExtractInfo {
                encoding: doc.encoding,
                bytes: doc.byte_count,
                lines: doc.line_count,
                input_chars: doc.char_count(),
                sent_chars: outcome.sent_chars,
            },
            text: source_text,
            metrics: outcome.metrics,
        }
    }
}

/// Body of `POST /api/summarize`. No upload, so no filename or encoding.
#[derive(Debug, Serialize)]
pub struct TextSummaryResponse {
    pub ok: bool,
    pub model: String,
    pub mode: Mode,
    pub summary: String,
    pub bullets_returned: usize,
    pub degraded: bool,
    pub input_chars: usize,
    pub sent_chars: usize,
    pub metrics: PipelineMetrics,
}

impl TextSummaryResponse {
    pub fn new(model: String, mode: Mode, doc: &Document, outcome: SummaryOutcome) -> Self {
        Self {
            ok: true,
            model,
            mode,
            summary: outcome.summary,
            bullets_returned: outcome.bullets_returned,
            degraded: outcome.degraded,
            input_chars: doc.char_count(),
            sent_chars: outcome.sent_chars,
            metrics: outcome.metrics,
        }
    }
}

/// Body of `POST /extract`.
#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub filename: String,
    #[serde(flatten)]
    pub document: Document,
}

impl ExtractResponse {
    pub fn new(filename: String, document: Document) -> Self {
        Self {
            ok: true,
            kind: "txt",
            filename,
            document,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: &'static str,
    pub detail: String,
}

impl IntoResponse for SiftError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(code = self.code(), "request failed: {self}");
        } else {
            tracing::warn!(code = self.code(), "request rejected: {self}");
        }
        let body = ErrorBody {
            ok: false,
            error: self.code(),
            detail: self.user_message(),
        };
        (status, Json(body)).into_response()
    }
}
