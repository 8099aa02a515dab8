//! Bullet normalization: raw generated text → ordered, deduplicated bullets.
//!
//! Everything here is pure string work so it can be tested without a backend.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Sentinel the prompts ask the model to print after the last bullet.
pub const END_SENTINEL: &str = "<END>";

/// Hyphen/dot markers may hug the text; numbered markers need a space so
/// "1.5 million" is not read as item 1.
static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•·●▪‣–]\s*|(?:\d{1,2}[.)]|\(\d{1,2}\))\s+)(.*)$")
        .expect("marker regex is valid")
});

/// Echoes of the output-format template ("- Key point 3").
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:key\s*point|bullet|point|fact|핵심\s*내용|요약)\s*\d*\s*[.:]?$")
        .expect("placeholder regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizerConfig {
    /// Bullets with fewer trimmed characters are noise.
    pub min_chars: usize,
    /// ASCII-letter share at or above which a bullet counts as filler.
    pub ascii_ratio_threshold: f64,
    /// Bullets shorter than this skip the ASCII check.
    pub ascii_check_min_chars: usize,
    /// Only set for sources written in a non-Latin script; see [`NormalizerConfig::for_source`].
    pub filter_ascii_filler: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            min_chars: 6,
            ascii_ratio_threshold: 0.7,
            ascii_check_min_chars: 12,
            filter_ascii_filler: false,
        }
    }
}

impl NormalizerConfig {
    /// Enable the ASCII filler filter only when the source itself is mostly
    /// non-Latin; for English input every real bullet would trip it.
    pub fn for_source(mut self, source: &str) -> Self {
        self.filter_ascii_filler = ascii_letter_ratio(source) < 0.3;
        self
    }
}

/// A canonical summary line and its dedup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bullet {
    text: String,
    key: String,
}

impl Bullet {
    /// Build from marker-free text. Returns None when nothing is left after
    /// trimming or the key is empty (pure punctuation).
    pub fn new(text: &str) -> Option<Self> {
        let text = text.trim();
        let key = dedup_key(text);
        if text.is_empty() || key.is_empty() {
            return None;
        }
        Some(Self {
            text: text.to_string(),
            key,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Rendered output line.
    pub fn render(&self) -> String {
        format!("- {}", self.text)
    }
}

/// Drop the end sentinel and anything the model wrote after it.
pub fn strip_sentinel(raw: &str) -> &str {
    match raw.find(END_SENTINEL) {
        Some(idx) => &raw[..idx],
        None => raw,
    }
}

/// Remainder of a marker-led line, or None when the line has no marker.
pub fn strip_marker(line: &str) -> Option<&str> {
    MARKER
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Canonical content key: marker stripped, punctuation and decoration
/// removed (decimal separators between digits survive), whitespace
/// collapsed, lowercased.
pub fn dedup_key(text: &str) -> String {
    let text = strip_marker(text).unwrap_or(text);
    let chars: Vec<char> = text.chars().collect();
    let mut key = String::with_capacity(text.len());
    let mut pending_space = false;

    for (i, &c) in chars.iter().enumerate() {
        let numeric_separator = matches!(c, '.' | ',')
            && i > 0
            && chars[i - 1].is_ascii_digit()
            && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit());

        if c.is_alphanumeric() || numeric_separator {
            if pending_space && !key.is_empty() {
                key.push(' ');
            }
            pending_space = false;
            key.extend(c.to_lowercase());
        } else if c.is_whitespace() {
            pending_space = true;
        }
    }
    key
}

/// Share of ASCII letters among non-whitespace characters.
pub fn ascii_letter_ratio(text: &str) -> f64 {
    let (letters, total) = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .fold((0usize, 0usize), |(l, t), c| {
            (l + usize::from(c.is_ascii_alphabetic()), t + 1)
        });
    if total == 0 {
        0.0
    } else {
        letters as f64 / total as f64
    }
}

pub fn is_placeholder(text: &str) -> bool {
    PLACEHOLDER.is_match(text.trim())
}

/// Garbage check for a marker-free candidate.
pub fn is_noise(text: &str, cfg: &NormalizerConfig) -> bool {
    let len = text.chars().count();
    if len < cfg.min_chars || is_placeholder(text) {
        return true;
    }
    cfg.filter_ascii_filler
        && len >= cfg.ascii_check_min_chars
        && ascii_letter_ratio(text) >= cfg.ascii_ratio_threshold
}

/// Parse marker-led lines into bullets, dropping noise and duplicates.
/// First occurrence wins; order is preserved. Not truncated to any target.
pub fn parse_bullets(raw: &str, cfg: &NormalizerConfig) -> Vec<Bullet> {
    let candidates = strip_sentinel(raw)
        .lines()
        .filter_map(strip_marker)
        .filter(|text| !is_noise(text, cfg));
    dedup(candidates)
}

/// Fallback for rewrite output that the strict parser rejected entirely:
/// marker-led lines with only the emptiness/placeholder checks, or failing
/// that, every plain line that does not look like a heading.
pub fn parse_bullets_lenient(raw: &str) -> Vec<Bullet> {
    let body = strip_sentinel(raw);
    let marked: Vec<Bullet> = dedup(
        body.lines()
            .filter_map(strip_marker)
            .filter(|text| !is_placeholder(text)),
    );
    if !marked.is_empty() {
        return marked;
    }
    dedup(
        body.lines()
            .map(str::trim)
            .filter(|line| !looks_like_heading(line) && !is_placeholder(line)),
    )
}

fn looks_like_heading(line: &str) -> bool {
    line.is_empty()
        || line.starts_with('#')
        || line.starts_with('[')
        || line.ends_with(':')
}

fn dedup<'a>(candidates: impl Iterator<Item = &'a str>) -> Vec<Bullet> {
    let mut seen = HashSet::new();
    candidates
        .filter_map(Bullet::new)
        .filter(|b| seen.insert(b.key.clone()))
        .collect()
}

/// Render bullets one per line.
pub fn render(bullets: &[Bullet]) -> String {
    bullets
        .iter()
        .map(Bullet::render)
        .collect::<Vec<_>>()
        .join("\n")
}
