//! Request-level controller: clip, pick a path, run it, assemble.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::dispatch::{CompletionBackend, GenerationOptions, GenerationRequest, GenerationResult};
use crate::error::SiftError;
use crate::extract::Document;
use crate::summarize::assess::{Assessment, assess};
use crate::summarize::bullets::{self, Bullet, NormalizerConfig, parse_bullets};
use crate::summarize::chunker::chunks;
use crate::summarize::map::map_chunks;
use crate::summarize::metrics::{CallMetrics, MetricsRecorder, PipelineMetrics, Stage};
use crate::summarize::prompts;
use crate::summarize::repair::{RepairBudget, RepairContext, orchestrate};
use crate::summarize::state::SummaryState;

/// Stop sequences sent with every call.
pub const STOP_SEQUENCES: [&str; 3] = ["\n\n\n", "\n###", "\n---"];

const BULLETED_CONTEXT_WINDOW: u32 = 2048;
const SINGLE_CONTEXT_WINDOW: u32 = 4096;
const BULLETED_MIN_OUTPUT: u32 = 120;
const BULLETED_MAX_OUTPUT: u32 = 260;
const BULLETED_MAX_TEMPERATURE: f64 = 0.2;
/// Line cap requested from plain mode.
const PLAIN_MAX_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[serde(alias = "news")]
    Bulleted,
    #[serde(alias = "default")]
    Plain,
    #[serde(alias = "report")]
    Structured,
}

impl Mode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bulleted" | "news" => Some(Self::Bulleted),
            "plain" | "default" => Some(Self::Plain),
            "structured" | "report" => Some(Self::Structured),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bulleted => "bulleted",
            Self::Plain => "plain",
            Self::Structured => "structured",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_bullets: usize,
    /// Chunk size, and the length above which the map/reduce path is taken.
    pub chunk_max_chars: usize,
    pub map_concurrency: usize,
    pub max_chunks: usize,
    pub chunk_output_tokens: u32,
    pub short_tail_chars: usize,
    pub long_tail_chars: usize,
    pub request_timeout: Duration,
    /// Share of `request_timeout` the map stage may use. The rest is kept
    /// for reduce and the repair pass.
    pub map_time_share: f64,
    pub normalizer: NormalizerConfig,
}

impl PipelineSettings {
    /// Wall-clock allowance for the map stage.
    pub fn map_budget(&self) -> Duration {
        let share = if self.map_time_share.is_finite() {
            self.map_time_share.clamp(0.0, 1.0)
        } else {
            1.0
        };
        self.request_timeout.mul_f64(share)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_bullets: 5,
            chunk_max_chars: 2000,
            map_concurrency: 4,
            max_chunks: 32,
            chunk_output_tokens: 160,
            short_tail_chars: 1200,
            long_tail_chars: 800,
            request_timeout: Duration::from_secs(300),
            map_time_share: 0.6,
            normalizer: NormalizerConfig::default(),
        }
    }
}

/// Caller-chosen knobs for one request, already validated.
#[derive(Debug, Clone)]
pub struct SummarizeOptions {
    pub model: String,
    pub mode: Mode,
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
    pub max_input_chars: usize,
}

#[derive(Debug, Clone)]
pub struct SummaryOutcome {
    /// Rendered summary text.
    pub summary: String,
    /// Accepted bullets for bulleted mode, empty otherwise.
    pub bullets: Vec<Bullet>,
    /// Bullets (or lines, outside bulleted mode) returned.
    pub bullets_returned: usize,
    pub degraded: bool,
    /// Characters actually sent after clipping.
    pub sent_chars: usize,
    pub metrics: PipelineMetrics,
}

pub struct Pipeline<B> {
    backend: Arc<B>,
    settings: PipelineSettings,
}

impl<B: CompletionBackend + 'static> Pipeline<B> {
    pub fn new(backend: Arc<B>, settings: PipelineSettings) -> Self {
        Self { backend, settings }
    }

    pub async fn run(
        &self,
        doc: &Document,
        opts: &SummarizeOptions,
    ) -> Result<SummaryOutcome, SiftError> {
        let deadline = Instant::now() + self.settings.request_timeout;
        let text = doc.clip(opts.max_input_chars);
        let sent_chars = text.chars().count();

        let long = sent_chars > self.settings.chunk_max_chars;
        tracing::info!(
            mode = opts.mode.as_str(),
            model = %opts.model,
            input_chars = doc.char_count(),
            sent_chars,
            long,
            "summarizing"
        );

        let mut outcome = match opts.mode {
            Mode::Bulleted if long => self.run_long(text, opts, deadline).await?,
            Mode::Bulleted => self.run_short(text, opts, deadline).await?,
            Mode::Plain | Mode::Structured => self.run_single(text, opts, deadline).await?,
        };
        outcome.sent_chars = sent_chars;

        tracing::info!(
            bullets = outcome.bullets_returned,
            degraded = outcome.degraded,
            calls = outcome.metrics.backend_calls,
            elapsed_ms = outcome.metrics.elapsed_ms,
            "summary ready"
        );
        Ok(outcome)
    }

    async fn run_short(
        &self,
        text: &str,
        opts: &SummarizeOptions,
        deadline: Instant,
    ) -> Result<SummaryOutcome, SiftError> {
        let mut rec = MetricsRecorder::new("short");
        let target = self.settings.target_bullets;
        let options = bulleted_options(opts);

        let started = Instant::now();
        let prompt = prompts::bulleted(text, target);
        let draft = self
            .call(&mut rec, Stage::Draft, &opts.model, prompt, &options, deadline)
            .await?;
        rec.stage("draft", started);

        let normalizer = self.settings.normalizer.for_source(text);
        let tail = tail_chars(text, self.settings.short_tail_chars);
        self.finish_bulleted(
            rec,
            draft,
            &opts.model,
            &options,
            &normalizer,
            tail,
            RepairBudget::SHORT,
            deadline,
            false,
        )
        .await
    }

    async fn run_long(
        &self,
        text: &str,
        opts: &SummarizeOptions,
        deadline: Instant,
    ) -> Result<SummaryOutcome, SiftError> {
        let mut rec = MetricsRecorder::new("map_reduce");
        let target = self.settings.target_bullets;

        let mut pieces: Vec<String> = chunks(text, self.settings.chunk_max_chars)
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .collect();
        if pieces.len() > self.settings.max_chunks {
            tracing::warn!(
                chunks = pieces.len(),
                max = self.settings.max_chunks,
                "too many chunks, dropping the tail of the document"
            );
            pieces.truncate(self.settings.max_chunks);
        }

        let started = Instant::now();
        let map_deadline = (started + self.settings.map_budget()).min(deadline);
        let chunk_options = GenerationOptions {
            max_output_tokens: self.settings.chunk_output_tokens,
            ..bulleted_options(opts)
        };
        let map = map_chunks(
            self.backend.clone(),
            pieces,
            &opts.model,
            &chunk_options,
            self.settings.map_concurrency,
            map_deadline,
        )
        .await;
        rec.stage("map", started);
        let combined = map.combined();
        let hit_deadline = map.metrics.hit_deadline();
        rec.calls(map.calls);
        rec.map(map.metrics);
        tracing::info!(
            chunks = map.metrics.chunks,
            succeeded = map.metrics.succeeded,
            failed = map.metrics.failed,
            timed_out = map.metrics.timed_out,
            "map stage done"
        );

        if map.digests.is_empty() {
            if hit_deadline {
                return Err(SiftError::Timeout(
                    self.settings.request_timeout.as_millis() as u64,
                ));
            }
            return Err(map
                .first_error
                .unwrap_or_else(|| SiftError::Other("map stage produced no digests".to_string())));
        }

        let started = Instant::now();
        let options = bulleted_options(opts);
        let prompt = prompts::reduce(&combined, target);
        let reduced = self
            .call(&mut rec, Stage::Reduce, &opts.model, prompt, &options, deadline)
            .await?;
        rec.stage("reduce", started);

        let normalizer = self.settings.normalizer.for_source(text);
        let tail = tail_chars(&combined, self.settings.long_tail_chars);
        self.finish_bulleted(
            rec,
            reduced,
            &opts.model,
            &options,
            &normalizer,
            tail,
            RepairBudget::LONG,
            deadline,
            hit_deadline,
        )
        .await
    }

    /// Normalize, assess and repair the first bulleted result, then assemble.
    async fn finish_bulleted(
        &self,
        mut rec: MetricsRecorder,
        first: GenerationResult,
        model: &str,
        options: &GenerationOptions,
        normalizer: &NormalizerConfig,
        tail: &str,
        budget: RepairBudget,
        deadline: Instant,
        already_degraded: bool,
    ) -> Result<SummaryOutcome, SiftError> {
        let target = self.settings.target_bullets;
        let parsed = parse_bullets(&first.text, normalizer);
        rec.first_result(first.stop_reason, parsed.len());

        let state = SummaryState::from_bullets(parsed, target);
        let assessment = assess(state.bullets(), target, first.stop_reason);
        let cause = match assessment {
            Assessment::NeedsRepair(cause) => Some(cause),
            _ => None,
        };
        rec.assessment(assessment.as_str(), cause);
        tracing::debug!(
            assessment = assessment.as_str(),
            bullets = state.len(),
            stop_reason = first.stop_reason.as_str(),
            "first result assessed"
        );

        let started = Instant::now();
        let ctx = RepairContext {
            model,
            tail,
            options,
            normalizer,
            budget,
            deadline,
        };
        let repaired = orchestrate(self.backend.as_ref(), &ctx, state, assessment).await?;
        if !repaired.steps.is_empty() {
            rec.stage("repair", started);
        }
        rec.calls(repaired.calls);
        rec.repair_steps(repaired.steps);

        let bullets = repaired.state.into_bullets();
        Ok(SummaryOutcome {
            summary: bullets::render(&bullets),
            bullets_returned: bullets.len(),
            bullets,
            degraded: repaired.degraded || already_degraded,
            sent_chars: 0,
            metrics: rec.finish(),
        })
    }

    async fn run_single(
        &self,
        text: &str,
        opts: &SummarizeOptions,
        deadline: Instant,
    ) -> Result<SummaryOutcome, SiftError> {
        let mut rec = MetricsRecorder::new("single");
        let options = GenerationOptions {
            temperature: opts.temperature,
            top_p: opts.top_p,
            max_output_tokens: opts.max_output_tokens,
            context_window: SINGLE_CONTEXT_WINDOW,
            stop_sequences: stop_sequences(),
        };
        let prompt = match opts.mode {
            Mode::Structured => prompts::structured(text),
            _ => prompts::plain(text, PLAIN_MAX_LINES),
        };

        let started = Instant::now();
        let result = self
            .call(&mut rec, Stage::Single, &opts.model, prompt, &options, deadline)
            .await?;
        rec.stage("single", started);

        let lines = tidy_lines(&result.text);
        rec.first_result(result.stop_reason, lines.len());
        Ok(SummaryOutcome {
            summary: lines.join("\n"),
            bullets: Vec::new(),
            bullets_returned: lines.len(),
            degraded: false,
            sent_chars: 0,
            metrics: rec.finish(),
        })
    }

    /// One controller-issued call with its metrics recorded either way.
    async fn call(
        &self,
        rec: &mut MetricsRecorder,
        stage: Stage,
        model: &str,
        prompt: String,
        options: &GenerationOptions,
        deadline: Instant,
    ) -> Result<GenerationResult, SiftError> {
        let req = GenerationRequest {
            model: model.to_string(),
            prompt,
            options: options.clone(),
            deadline,
        };
        let started = Instant::now();
        match self.backend.generate(&req).await {
            Ok(result) => {
                rec.call(CallMetrics::success(stage, None, &result));
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(stage = stage.as_str(), error = %e, "backend call failed");
                let latency_ms = started.elapsed().as_millis() as u64;
                rec.call(CallMetrics::failure(stage, None, &e, latency_ms));
                Err(e)
            }
        }
    }
}

fn stop_sequences() -> Vec<String> {
    STOP_SEQUENCES.iter().map(|s| s.to_string()).collect()
}

/// Decoding options for every bulleted-mode call.
pub fn bulleted_options(opts: &SummarizeOptions) -> GenerationOptions {
    GenerationOptions {
        temperature: opts.temperature.min(BULLETED_MAX_TEMPERATURE),
        top_p: opts.top_p,
        max_output_tokens: opts
            .max_output_tokens
            .clamp(BULLETED_MIN_OUTPUT, BULLETED_MAX_OUTPUT),
        context_window: BULLETED_CONTEXT_WINDOW,
        stop_sequences: stop_sequences(),
    }
}

/// Last `n` characters of `text`.
pub fn tail_chars(text: &str, n: usize) -> &str {
    let total = text.chars().count();
    if total <= n {
        return text;
    }
    match text.char_indices().nth(total - n) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Plain-mode cleanup: sentinel stripped, blank lines dropped, repeated
/// lines dropped (first wins).
pub fn tidy_lines(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    bullets::strip_sentinel(raw)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && seen.insert(*line))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(temperature: f64, max_output_tokens: u32) -> SummarizeOptions {
        SummarizeOptions {
            model: "phi3".to_string(),
            mode: Mode::Bulleted,
            temperature,
            top_p: 0.9,
            max_output_tokens,
            max_input_chars: 3000,
        }
    }

    #[test]
    fn mode_aliases() {
        assert_eq!(Mode::parse("news"), Some(Mode::Bulleted));
        assert_eq!(Mode::parse(" Default "), Some(Mode::Plain));
        assert_eq!(Mode::parse("report"), Some(Mode::Structured));
        assert_eq!(Mode::parse("poem"), None);
        let m: Mode = serde_json::from_str("\"news\"").unwrap();
        assert_eq!(m, Mode::Bulleted);
    }

    #[test]
    fn bulleted_options_clamp_budget_and_temperature() {
        let o = bulleted_options(&opts(0.8, 50));
        assert_eq!(o.temperature, 0.2);
        assert_eq!(o.max_output_tokens, 120);
        assert_eq!(o.context_window, 2048);
        assert_eq!(o.stop_sequences.len(), 3);

        let o = bulleted_options(&opts(0.05, 4000));
        assert_eq!(o.temperature, 0.05);
        assert_eq!(o.max_output_tokens, 260);
    }

    #[test]
    fn map_budget_is_a_share_of_the_request() {
        let settings = PipelineSettings {
            request_timeout: Duration::from_secs(10),
            map_time_share: 0.6,
            ..PipelineSettings::default()
        };
        assert_eq!(settings.map_budget(), Duration::from_secs(6));
        let all = PipelineSettings {
            map_time_share: 4.0,
            ..settings
        };
        assert_eq!(all.map_budget(), Duration::from_secs(10));
    }

    #[test]
    fn tail_chars_counts_characters() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("가나다라", 2), "다라");
    }

    #[test]
    fn tidy_lines_dedups_and_drops_blanks() {
        let raw = "First line.\n\n  Second line.\nFirst line.\n<END>\nignored";
        assert_eq!(tidy_lines(raw), vec!["First line.", "Second line."]);
    }
}
