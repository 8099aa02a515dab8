pub mod ollama;

use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::SiftError;

/// Calls with less than this left before their deadline are not started.
pub const MIN_CALL_BUDGET: Duration = Duration::from_millis(100);

/// Sampling and budget knobs sent with every generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub top_p: f64,
    /// Output token budget (`num_predict` on the wire).
    pub max_output_tokens: u32,
    /// Context window size in tokens (`num_ctx` on the wire).
    pub context_window: u32,
    pub stop_sequences: Vec<String>,
}

/// One generation call. Built per call, never mutated.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub options: GenerationOptions,
    /// Absolute deadline; the call's timeout is clamped to what is left.
    pub deadline: Instant,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NaturalEnd,
    LengthLimit,
    StopSequence,
    Error,
}

impl StopReason {
    /// Map an Ollama `done_reason`. Ollama reports stop-sequence hits as
    /// `"stop"` too, so `StopSequence` only comes from servers that say so.
    pub fn from_done_reason(reason: Option<&str>, done: bool) -> Self {
        match reason {
            Some("length") => Self::LengthLimit,
            Some("stop") => Self::NaturalEnd,
            Some("stop_sequence") => Self::StopSequence,
            None if done => Self::NaturalEnd,
            _ => Self::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NaturalEnd => "natural_end",
            Self::LengthLimit => "length_limit",
            Self::StopSequence => "stop_sequence",
            Self::Error => "error",
        }
    }
}

/// Token counters reported by the backend, all optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_duration_ns: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_duration_ns: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub latency_ms: u64,
}

/// The completion service seam. Implementations own transport only: they do
/// not interpret truncation, that is the assessor's job.
pub trait CompletionBackend: Send + Sync {
    fn generate(
        &self,
        req: &GenerationRequest,
    ) -> impl Future<Output = Result<GenerationResult, SiftError>> + Send;
}
