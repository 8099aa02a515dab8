use std::time::Instant;

use serde::Serialize;

use crate::dispatch::{GenerationResult, StopReason, Usage};
use crate::error::SiftError;
use crate::summarize::assess::RepairCause;
use crate::summarize::repair::RepairStep;

/// Which pipeline step issued a backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Plain/structured single call.
    Single,
    /// Short-document bulleted call on the full text.
    Draft,
    Map,
    Reduce,
    Repair,
    Add,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Draft => "draft",
            Self::Map => "map",
            Self::Reduce => "reduce",
            Self::Repair => "repair",
            Self::Add => "add",
        }
    }
}

/// One backend call as seen by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct CallMetrics {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(flatten)]
    pub usage: Usage,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallMetrics {
    pub fn success(stage: Stage, chunk: Option<usize>, result: &GenerationResult) -> Self {
        Self {
            stage,
            chunk,
            ok: true,
            stop_reason: Some(result.stop_reason),
            usage: result.usage,
            latency_ms: result.latency_ms,
            error: None,
        }
    }

    pub fn failure(stage: Stage, chunk: Option<usize>, error: &SiftError, latency_ms: u64) -> Self {
        Self {
            stage,
            chunk,
            ok: false,
            stop_reason: None,
            usage: Usage::default(),
            latency_ms,
            error: Some(error.code().to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: &'static str,
    pub elapsed_ms: u64,
}

/// Fan-out bookkeeping for the map stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MapMetrics {
    pub chunks: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Calls that ran out of time, aborted at the cutoff or timed out.
    pub timed_out: usize,
}

impl MapMetrics {
    /// The map cutoff cost at least one chunk. Plain chunk failures do not
    /// count; they only show up in `failed`.
    pub fn hit_deadline(&self) -> bool {
        self.timed_out > 0
    }
}

/// Everything measured during one run. Frozen once the response is built.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub elapsed_ms: u64,
    /// `single`, `short` or `map_reduce`.
    pub path: &'static str,
    pub stages: Vec<StageTiming>,
    pub calls: Vec<CallMetrics>,
    pub backend_calls: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub map: Option<MapMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bullets: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assessment: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_cause: Option<RepairCause>,
    pub repair_steps: Vec<RepairStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

impl PipelineMetrics {
    /// Calls issued after the first bulleted result (repair and add).
    pub fn repair_calls(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c.stage, Stage::Repair | Stage::Add))
            .count()
    }
}

/// Mutable accumulator owned by the controller task for the span of a run.
pub struct MetricsRecorder {
    start: Instant,
    path: &'static str,
    stages: Vec<StageTiming>,
    calls: Vec<CallMetrics>,
    map: Option<MapMetrics>,
    first_stop_reason: Option<StopReason>,
    first_bullets: Option<usize>,
    assessment: Option<&'static str>,
    repair_cause: Option<RepairCause>,
    repair_steps: Vec<RepairStep>,
}

impl MetricsRecorder {
    pub fn new(path: &'static str) -> Self {
        Self {
            start: Instant::now(),
            path,
            stages: Vec::new(),
            calls: Vec::new(),
            map: None,
            first_stop_reason: None,
            first_bullets: None,
            assessment: None,
            repair_cause: None,
            repair_steps: Vec::new(),
        }
    }

    pub fn stage(&mut self, stage: &'static str, started: Instant) {
        self.stages.push(StageTiming {
            stage,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    pub fn call(&mut self, call: CallMetrics) {
        self.calls.push(call);
    }

    pub fn calls(&mut self, calls: impl IntoIterator<Item = CallMetrics>) {
        self.calls.extend(calls);
    }

    pub fn map(&mut self, map: MapMetrics) {
        self.map = Some(map);
    }

    pub fn first_result(&mut self, stop_reason: StopReason, bullets: usize) {
        self.first_stop_reason = Some(stop_reason);
        self.first_bullets = Some(bullets);
    }

    pub fn assessment(&mut self, assessment: &'static str, cause: Option<RepairCause>) {
        self.assessment = Some(assessment);
        self.repair_cause = cause;
    }

    pub fn repair_steps(&mut self, steps: Vec<RepairStep>) {
        self.repair_steps = steps;
    }

    pub fn finish(self) -> PipelineMetrics {
        let sum = |f: fn(&Usage) -> Option<u64>| {
            self.calls
                .iter()
                .filter_map(|c| f(&c.usage))
                .reduce(|a, b| a + b)
        };
        let prompt_tokens = sum(|u| u.prompt_tokens);
        let output_tokens = sum(|u| u.output_tokens);

        PipelineMetrics {
            elapsed_ms: self.start.elapsed().as_millis() as u64,
            path: self.path,
            backend_calls: self.calls.len(),
            stages: self.stages,
            calls: self.calls,
            map: self.map,
            first_stop_reason: self.first_stop_reason,
            first_bullets: self.first_bullets,
            assessment: self.assessment,
            repair_cause: self.repair_cause,
            repair_steps: self.repair_steps,
            prompt_tokens,
            output_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(prompt: u64, output: u64) -> GenerationResult {
        GenerationResult {
            text: String::new(),
            stop_reason: StopReason::NaturalEnd,
            usage: Usage {
                prompt_tokens: Some(prompt),
                output_tokens: Some(output),
                ..Usage::default()
            },
            latency_ms: 5,
        }
    }

    #[test]
    fn finish_totals_token_usage() {
        let mut rec = MetricsRecorder::new("short");
        rec.call(CallMetrics::success(Stage::Draft, None, &result(100, 40)));
        rec.call(CallMetrics::success(Stage::Add, None, &result(50, 10)));
        let metrics = rec.finish();
        assert_eq!(metrics.prompt_tokens, Some(150));
        assert_eq!(metrics.output_tokens, Some(50));
        assert_eq!(metrics.backend_calls, 2);
        assert_eq!(metrics.repair_calls(), 1);
    }

    #[test]
    fn failed_call_serializes_error_code() {
        let call = CallMetrics::failure(
            Stage::Map,
            Some(2),
            &SiftError::BackendUnavailable("refused".into()),
            12,
        );
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["stage"], "map");
        assert_eq!(json["chunk"], 2);
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "backend_unavailable");
        assert!(json.get("stop_reason").is_none());
    }
}
