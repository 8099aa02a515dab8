//! Prompt templates for every call the pipeline makes.
//!
//! All templates ask for output in the source's own language and forbid
//! figures that are not in the source.

use std::fmt::Write;

use crate::summarize::bullets::{Bullet, END_SENTINEL};

fn bullet_rules(target: usize) -> String {
    format!(
        "[Rules]\n\
         1. Write in the same language as the source text.\n\
         2. Exactly {target} bullets, one fact per bullet, each a complete declarative sentence.\n\
         3. Do not invent or estimate numbers that are not in the source.\n\
         4. Keep names, dates, amounts and other figures exactly as written in the source.\n\
         5. No preamble, greeting or closing remarks.\n\
         6. Start every line with \"- \".\n\
         7. Never output more than {target} lines.\n\
         8. After the last bullet print {END_SENTINEL} on its own line and stop."
    )
}

fn self_check(target: usize) -> String {
    format!(
        "[Self-check]\n\
         Count your bullet lines before finishing. If there are not exactly {target}, \
         fix the list so there are exactly {target}."
    )
}

fn output_format(target: usize) -> String {
    let mut out = String::from("[Output format]");
    for i in 1..=target {
        let _ = write!(out, "\n- Key point {i}");
    }
    out
}

fn bullet_list(bullets: &[Bullet]) -> String {
    if bullets.is_empty() {
        return "(none)".to_string();
    }
    bullets
        .iter()
        .map(Bullet::render)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Single-call bulleted summary of the whole (clipped) text.
pub fn bulleted(text: &str, target: usize) -> String {
    format!(
        "[Role]\nYou summarize documents faithfully, preserving key figures and facts without distortion.\n\n\
         [Task]\nSummarize the source text below in exactly {target} bullet points.\n\n\
         {rules}\n\n{check}\n\n{format}\n\n[Source]\n{text}",
        rules = bullet_rules(target),
        check = self_check(target),
        format = output_format(target),
    )
}

/// Condensed digest of one chunk (map stage).
pub fn chunk_digest(chunk: &str) -> String {
    format!(
        "Summarize the passage below concisely.\n\n\
         Rules:\n\
         - Write in the same language as the passage.\n\
         - Do not add anything that is not in the passage.\n\
         - Convey the key content in 3 to 5 sentences.\n\
         - Keep proper nouns, figures and years exactly as written.\n\
         - No preamble or greeting.\n\n\
         [Passage]\n{chunk}"
    )
}

/// Synthesis of all chunk digests into the final list (reduce stage).
pub fn reduce(digests: &str, target: usize) -> String {
    format!(
        "[Role]\nYou merge partial summaries of one document into a single faithful summary.\n\n\
         [Task]\nThe notes below summarize consecutive parts of one document, in order. \
         Combine them into exactly {target} bullet points covering the most important facts \
         of the whole document. Merge facts that repeat across notes.\n\n\
         {rules}\n\n{check}\n\n{format}\n\n[Notes]\n{digests}",
        rules = bullet_rules(target),
        check = self_check(target),
        format = output_format(target),
    )
}

/// Full rewrite of a mangled list.
pub fn repair(bullets: &[Bullet], tail: &str, target: usize) -> String {
    format!(
        "The summary below is incomplete: a bullet may stop mid-sentence or the list may be short.\n\
         Rewrite it as exactly {target} complete bullets. First finish any bullet that was cut off, \
         then keep every fact already stated, without repeating a fact in two bullets.\n\n\
         {rules}\n\n[Current summary]\n{current}\n\n[Source (closing excerpt)]\n{tail}",
        rules = bullet_rules(target),
        current = bullet_list(bullets),
    )
}

/// Continuation that appends only the missing bullets.
pub fn add(bullets: &[Bullet], tail: &str, missing: usize) -> String {
    let noun = if missing == 1 { "bullet" } else { "bullets" };
    format!(
        "The summary below needs exactly {missing} more {noun}.\n\
         Write only the {missing} new {noun}, in the same format, each with a fact that is NOT \
         already covered. Do not restate any figure, name or entity from the existing bullets.\n\
         Write in the same language as the source. Start each line with \"- \". \
         After the last new bullet print {END_SENTINEL} on its own line and stop. \
         No preamble or explanation.\n\n\
         [Existing bullets, do not repeat]\n{current}\n\n[Source (closing excerpt)]\n{tail}",
        current = bullet_list(bullets),
    )
}

/// Short free-form summary.
pub fn plain(text: &str, max_lines: usize) -> String {
    format!(
        "Summarize the text below in at most {max_lines} lines, in the same language as the text.\n\n\
         [Source]\n{text}"
    )
}

/// Sectioned summary for report-style output.
pub fn structured(text: &str) -> String {
    format!(
        "Write a structured summary of the text below in the same language as the text. \
         Use short headed sections (overview, key facts, figures, outlook) and keep every \
         figure exactly as written.\n\n[Source]\n{text}"
    )
}
