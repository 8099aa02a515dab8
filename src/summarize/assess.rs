//! Completion assessment: is a bullet set done, short, or mangled?

use serde::Serialize;

use crate::dispatch::StopReason;
use crate::summarize::bullets::Bullet;

/// Endings that mean the model stopped mid-thought.
const CUT_ENDINGS: &[char] = &[
    '(', '[', '{', '“', '‘', '"', '\'', '’', '·', ':', ',', ';', '-', '/', '&', '「', '『',
];

/// Trailing words that leave a clause dangling.
const DANGLING_WORDS: &[&str] = &[
    "and", "or", "but", "the", "a", "an", "of", "to", "with", "for", "in", "on", "by", "as",
    "및", "또는", "그리고", "하지만", "그러나", "등",
];

/// Closers allowed after the terminal mark, e.g. `(in May.)` or `“…다.”`.
const TRAILING_CLOSERS: &[char] = &[')', ']', '”', '」', '』', '》', '〉'];

const TERMINAL_MARKS: &[char] = &['.', '!', '?', '。', '！', '？', '…'];

/// Korean declarative and nominal sentence endings commonly used in summaries.
const TERMINAL_SYLLABLES: &[char] = &['다', '요', '음', '함', '됨', '임', '죠'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairCause {
    /// Nothing usable was parsed.
    NoBullets,
    LooksCut,
    UnfinishedSentence,
    LengthLimit,
}

/// Classification of a bullet set, in decision-table priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    NeedsRepair(RepairCause),
    NeedsAdd { missing: usize },
    Complete,
}

impl Assessment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NeedsRepair(_) => "needs_repair",
            Self::NeedsAdd { .. } => "needs_add",
            Self::Complete => "complete",
        }
    }
}

/// Repair outranks add: a full set with a mangled ending is rewritten, not
/// extended. An empty set is treated as mangled since there is nothing to
/// extend.
pub fn assess(bullets: &[Bullet], target: usize, stop_reason: StopReason) -> Assessment {
    let Some(last) = bullets.last() else {
        return Assessment::NeedsRepair(RepairCause::NoBullets);
    };

    if looks_cut(last.text()) {
        return Assessment::NeedsRepair(RepairCause::LooksCut);
    }
    if !is_sentence_complete(last.text()) {
        return Assessment::NeedsRepair(RepairCause::UnfinishedSentence);
    }
    if stop_reason == StopReason::LengthLimit {
        return Assessment::NeedsRepair(RepairCause::LengthLimit);
    }
    if bullets.len() < target {
        return Assessment::NeedsAdd {
            missing: target - bullets.len(),
        };
    }
    Assessment::Complete
}

/// True when the line ends on a dangling punctuation mark or connective.
pub fn looks_cut(line: &str) -> bool {
    let s = line.trim();
    let Some(last) = s.chars().last() else {
        return true;
    };
    if CUT_ENDINGS.contains(&last) {
        return true;
    }
    s.split_whitespace()
        .last()
        .is_some_and(|w| DANGLING_WORDS.contains(&w.to_lowercase().as_str()))
}

/// True when the line ends with a terminal clause marker, ignoring closing
/// brackets and quotes after it.
pub fn is_sentence_complete(line: &str) -> bool {
    let s = line.trim().trim_end_matches(TRAILING_CLOSERS).trim_end();
    s.chars()
        .last()
        .is_some_and(|c| TERMINAL_MARKS.contains(&c) || TERMINAL_SYLLABLES.contains(&c))
}

/// Both completeness checks at once.
pub fn is_finished(line: &str) -> bool {
    !looks_cut(line) && is_sentence_complete(line)
}
