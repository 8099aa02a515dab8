use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::dispatch::ollama::OllamaSettings;
use crate::extract::{DEFAULT_MAX_BYTES, DEFAULT_MAX_TEXT_CHARS, ExtractLimits};
use crate::summarize::bullets::NormalizerConfig;
use crate::summarize::pipeline::PipelineSettings;

/// Config file read when `SIFT_CONFIG` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "sift.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub pipeline: PipelineConfig,
    pub normalizer: NormalizerSection,
    pub extract: ExtractConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub default_model: String,
    pub keep_alive: String,
    pub call_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_connections: usize,
    pub num_batch: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            default_model: "phi3".to_string(),
            keep_alive: "30m".to_string(),
            call_timeout_secs: 180,
            connect_timeout_secs: 10,
            max_connections: 20,
            num_batch: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub target_bullets: usize,
    pub chunk_max_chars: usize,
    pub map_concurrency: usize,
    pub max_chunks: usize,
    pub chunk_output_tokens: u32,
    pub short_tail_chars: usize,
    pub long_tail_chars: usize,
    pub request_timeout_secs: u64,
    pub map_time_share: f64,
    pub default_max_input_chars: usize,
    pub max_input_chars_limit: usize,
    pub default_temperature: f64,
    pub default_top_p: f64,
    pub default_max_output_tokens: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_bullets: 5,
            chunk_max_chars: 2000,
            map_concurrency: 4,
            max_chunks: 32,
            chunk_output_tokens: 160,
            short_tail_chars: 1200,
            long_tail_chars: 800,
            request_timeout_secs: 300,
            map_time_share: 0.6,
            default_max_input_chars: 3000,
            max_input_chars_limit: 200_000,
            default_temperature: 0.1,
            default_top_p: 0.9,
            default_max_output_tokens: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizerSection {
    pub min_chars: usize,
    pub ascii_ratio_threshold: f64,
    pub ascii_check_min_chars: usize,
}

impl Default for NormalizerSection {
    fn default() -> Self {
        let base = NormalizerConfig::default();
        Self {
            min_chars: base.min_chars,
            ascii_ratio_threshold: base.ascii_ratio_threshold,
            ascii_check_min_chars: base.ascii_check_min_chars,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    pub max_bytes: usize,
    pub max_text_chars: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
        }
    }
}

impl Config {
    /// Defaults, then the TOML file (if any), then `SIFT_*` environment
    /// overrides. Out-of-range values are clamped, never fatal.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("SIFT_CONFIG")
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                let p = PathBuf::from(DEFAULT_CONFIG_FILE);
                p.exists().then_some(p)
            });

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok());
        config.sanitize();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config TOML '{}'", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `SIFT_*` overrides through `lookup` so tests need not touch the
    /// process environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("SIFT_LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Some(v) = lookup("SIFT_OLLAMA_URL") {
            self.backend.base_url = v;
        }
        if let Some(v) = lookup("SIFT_DEFAULT_MODEL") {
            self.backend.default_model = v;
        }
        if let Some(v) = parse_env(&lookup, "SIFT_CALL_TIMEOUT_SECS") {
            self.backend.call_timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "SIFT_REQUEST_TIMEOUT_SECS") {
            self.pipeline.request_timeout_secs = v;
        }
        if let Some(v) = parse_env(&lookup, "SIFT_MAX_CONNECTIONS") {
            self.backend.max_connections = v;
        }
    }

    /// Clamp every knob into a usable range, warning on each change.
    pub fn sanitize(&mut self) {
        clamp_warn("backend.call_timeout_secs", &mut self.backend.call_timeout_secs, 1, 3600);
        clamp_warn("backend.connect_timeout_secs", &mut self.backend.connect_timeout_secs, 1, 300);
        clamp_warn("backend.max_connections", &mut self.backend.max_connections, 1, 256);
        clamp_warn("backend.num_batch", &mut self.backend.num_batch, 1, 4096);
        if self.backend.default_model.trim().is_empty() {
            tracing::warn!("backend.default_model is empty, using phi3");
            self.backend.default_model = BackendConfig::default().default_model;
        }

        let p = &mut self.pipeline;
        clamp_warn("pipeline.target_bullets", &mut p.target_bullets, 1, 20);
        clamp_warn("pipeline.chunk_max_chars", &mut p.chunk_max_chars, 200, 50_000);
        clamp_warn("pipeline.map_concurrency", &mut p.map_concurrency, 1, 64);
        clamp_warn("pipeline.max_chunks", &mut p.max_chunks, 1, 256);
        clamp_warn("pipeline.chunk_output_tokens", &mut p.chunk_output_tokens, 32, 1024);
        clamp_warn("pipeline.short_tail_chars", &mut p.short_tail_chars, 100, 10_000);
        clamp_warn("pipeline.long_tail_chars", &mut p.long_tail_chars, 100, 10_000);
        clamp_warn("pipeline.request_timeout_secs", &mut p.request_timeout_secs, 1, 3600);
        clamp_warn("pipeline.map_time_share", &mut p.map_time_share, 0.1, 0.9);
        clamp_warn("pipeline.max_input_chars_limit", &mut p.max_input_chars_limit, 1, 2_000_000);
        let limit = p.max_input_chars_limit;
        clamp_warn("pipeline.default_max_input_chars", &mut p.default_max_input_chars, 1, limit);
        clamp_warn("pipeline.default_temperature", &mut p.default_temperature, 0.0, 2.0);
        clamp_warn("pipeline.default_top_p", &mut p.default_top_p, 0.01, 1.0);
        clamp_warn("pipeline.default_max_output_tokens", &mut p.default_max_output_tokens, 1, 4096);

        let n = &mut self.normalizer;
        clamp_warn("normalizer.min_chars", &mut n.min_chars, 1, 200);
        clamp_warn("normalizer.ascii_ratio_threshold", &mut n.ascii_ratio_threshold, 0.0, 1.0);
        clamp_warn("normalizer.ascii_check_min_chars", &mut n.ascii_check_min_chars, 1, 500);

        clamp_warn("extract.max_bytes", &mut self.extract.max_bytes, 1, 256 * 1024 * 1024);
        clamp_warn("extract.max_text_chars", &mut self.extract.max_text_chars, 1, 20_000_000);
    }

    pub fn ollama_settings(&self) -> OllamaSettings {
        OllamaSettings {
            base_url: self.backend.base_url.clone(),
            keep_alive: self.backend.keep_alive.clone(),
            call_timeout: Duration::from_secs(self.backend.call_timeout_secs),
            connect_timeout: Duration::from_secs(self.backend.connect_timeout_secs),
            max_connections: self.backend.max_connections,
            num_batch: self.backend.num_batch,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let p = &self.pipeline;
        PipelineSettings {
            target_bullets: p.target_bullets,
            chunk_max_chars: p.chunk_max_chars,
            map_concurrency: p.map_concurrency,
            max_chunks: p.max_chunks,
            chunk_output_tokens: p.chunk_output_tokens,
            short_tail_chars: p.short_tail_chars,
            long_tail_chars: p.long_tail_chars,
            request_timeout: Duration::from_secs(p.request_timeout_secs),
            map_time_share: p.map_time_share,
            normalizer: NormalizerConfig {
                min_chars: self.normalizer.min_chars,
                ascii_ratio_threshold: self.normalizer.ascii_ratio_threshold,
                ascii_check_min_chars: self.normalizer.ascii_check_min_chars,
                filter_ascii_filler: false,
            },
        }
    }

    pub fn extract_limits(&self) -> ExtractLimits {
        ExtractLimits {
            max_bytes: self.extract.max_bytes,
            max_text_chars: self.extract.max_text_chars,
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

fn clamp_warn<T>(name: &str, value: &mut T, min: T, max: T)
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let clamped = if *value < min {
        min
    } else if *value > max {
        max
    } else {
        return;
    };
    tracing::warn!("{name}={} out of range, using {clamped}", *value);
    *value = clamped;
}
