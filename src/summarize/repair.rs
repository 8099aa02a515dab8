//! Bounded repair/add state machine run after the first bulleted result.

use std::time::Instant;

use serde::Serialize;

use crate::dispatch::{CompletionBackend, GenerationOptions, GenerationRequest, MIN_CALL_BUDGET};
use crate::error::SiftError;
use crate::summarize::assess::{Assessment, RepairCause, is_finished};
use crate::summarize::bullets::{Bullet, NormalizerConfig, parse_bullets, parse_bullets_lenient};
use crate::summarize::metrics::{CallMetrics, Stage};
use crate::summarize::prompts;
use crate::summarize::state::SummaryState;

/// Output budget for an add call: 60 tokens per missing bullet.
pub fn add_output_budget(missing: usize) -> u32 {
    (60 * missing as u32).clamp(100, 260)
}

/// Orchestrator states. `Complete` is terminal; every call moves the machine
/// strictly forward, so the loop ends within the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPhase {
    NeedsRepair(RepairCause),
    NeedsAdd { missing: usize },
    Complete,
}

impl From<Assessment> for RepairPhase {
    fn from(a: Assessment) -> Self {
        match a {
            Assessment::NeedsRepair(cause) => Self::NeedsRepair(cause),
            Assessment::NeedsAdd { missing } => Self::NeedsAdd { missing },
            Assessment::Complete => Self::Complete,
        }
    }
}

/// What the orchestrator did, in order. Reported in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RepairStep {
    Repair { cause: RepairCause, bullets: usize },
    Add { requested: usize, added: usize },
    /// Too little of the request deadline was left to issue the next call.
    SkippedDeadline,
    BudgetExhausted,
}

/// Call limits. Each of repair and add runs at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairBudget {
    pub max_calls: usize,
}

impl RepairBudget {
    /// Short documents: repair then add.
    pub const SHORT: Self = Self { max_calls: 2 };
    /// Long documents: a single final pass after reduce.
    pub const LONG: Self = Self { max_calls: 1 };
}

/// Fixed inputs for one orchestration.
pub struct RepairContext<'a> {
    pub model: &'a str,
    /// Trailing window of the source (or of the digests on the long path).
    pub tail: &'a str,
    pub options: &'a GenerationOptions,
    pub normalizer: &'a NormalizerConfig,
    pub budget: RepairBudget,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct RepairOutcome {
    pub state: SummaryState,
    pub steps: Vec<RepairStep>,
    pub calls: Vec<CallMetrics>,
    pub degraded: bool,
}

/// Drive `state` from its first assessment to a terminal phase. Backend
/// errors escalate; running out of budget or time only degrades the result.
pub async fn orchestrate<B: CompletionBackend>(
    backend: &B,
    ctx: &RepairContext<'_>,
    mut state: SummaryState,
    first: Assessment,
) -> Result<RepairOutcome, SiftError> {
    let mut phase = RepairPhase::from(first);
    let mut steps = Vec::new();
    let mut calls = Vec::new();
    let mut repaired = false;
    let mut added = false;

    while phase != RepairPhase::Complete {
        if calls.len() >= ctx.budget.max_calls
            || (repaired && matches!(phase, RepairPhase::NeedsRepair(_)))
            || (added && matches!(phase, RepairPhase::NeedsAdd { .. }))
        {
            steps.push(RepairStep::BudgetExhausted);
            break;
        }
        if ctx.deadline.saturating_duration_since(Instant::now()) <= MIN_CALL_BUDGET {
            tracing::warn!(phase = ?phase, "too little time left, skipping repair call");
            steps.push(RepairStep::SkippedDeadline);
            break;
        }

        phase = match phase {
            RepairPhase::NeedsRepair(cause) => {
                let prompt = prompts::repair(state.bullets(), ctx.tail, state.target());
                let budget = ctx.options.max_output_tokens;
                let text = call(backend, ctx, Stage::Repair, prompt, budget, &mut calls).await?;
                repaired = true;

                let mut rewritten = parse_bullets(&text, ctx.normalizer);
                if rewritten.is_empty() {
                    rewritten = parse_bullets_lenient(&text);
                }
                if rewritten.is_empty() {
                    // Nothing usable came back; keep what we had minus a cut tail.
                    rewritten = state.bullets().to_vec();
                }
                drop_unfinished_tail(&mut rewritten);
                state.replace(rewritten);
                steps.push(RepairStep::Repair {
                    cause,
                    bullets: state.len(),
                });
                tracing::info!(cause = ?cause, bullets = state.len(), "repair pass done");

                match state.remaining() {
                    0 => RepairPhase::Complete,
                    missing => RepairPhase::NeedsAdd { missing },
                }
            }
            RepairPhase::NeedsAdd { missing } => {
                let prompt = prompts::add(state.bullets(), ctx.tail, missing);
                let budget = add_output_budget(missing);
                let text = call(backend, ctx, Stage::Add, prompt, budget, &mut calls).await?;
                added = true;

                let mut extra = parse_bullets(&text, ctx.normalizer);
                drop_unfinished_tail(&mut extra);
                let accepted = state.merge(extra);
                steps.push(RepairStep::Add {
                    requested: missing,
                    added: accepted,
                });
                tracing::info!(requested = missing, added = accepted, "add pass done");

                // One add per run; whatever is still missing is reported as degraded.
                RepairPhase::Complete
            }
            RepairPhase::Complete => RepairPhase::Complete,
        };
    }

    let unresolved = matches!(phase, RepairPhase::NeedsRepair(_));
    if !unresolved && state.is_full() {
        state.mark_complete();
    }
    let degraded = !state.is_complete();
    if degraded {
        tracing::warn!(
            bullets = state.len(),
            target = state.target(),
            unresolved,
            "summary is degraded"
        );
    }

    Ok(RepairOutcome {
        state,
        steps,
        calls,
        degraded,
    })
}

async fn call<B: CompletionBackend>(
    backend: &B,
    ctx: &RepairContext<'_>,
    stage: Stage,
    prompt: String,
    max_output_tokens: u32,
    calls: &mut Vec<CallMetrics>,
) -> Result<String, SiftError> {
    let req = GenerationRequest {
        model: ctx.model.to_string(),
        prompt,
        options: GenerationOptions {
            max_output_tokens,
            ..ctx.options.clone()
        },
        deadline: ctx.deadline,
    };
    let started = Instant::now();
    match backend.generate(&req).await {
        Ok(result) => {
            calls.push(CallMetrics::success(stage, None, &result));
            Ok(result.text)
        }
        Err(e) => {
            calls.push(CallMetrics::failure(
                stage,
                None,
                &e,
                started.elapsed().as_millis() as u64,
            ));
            Err(e)
        }
    }
}

/// A trailing bullet that still reads as cut off is worse than no bullet.
fn drop_unfinished_tail(bullets: &mut Vec<Bullet>) {
    if bullets.last().is_some_and(|b| !is_finished(b.text())) {
        bullets.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_budget_is_clamped() {
        assert_eq!(add_output_budget(1), 100);
        assert_eq!(add_output_budget(3), 180);
        assert_eq!(add_output_budget(5), 260);
    }

    #[test]
    fn phase_follows_assessment() {
        assert_eq!(
            RepairPhase::from(Assessment::NeedsAdd { missing: 2 }),
            RepairPhase::NeedsAdd { missing: 2 }
        );
        assert_eq!(RepairPhase::from(Assessment::Complete), RepairPhase::Complete);
    }

    #[test]
    fn unfinished_tail_is_dropped_once() {
        let mut bullets: Vec<Bullet> = ["Sales rose 4%.", "Costs fell 2%.", "Margins were"]
            .iter()
            .filter_map(|t| Bullet::new(t))
            .collect();
        drop_unfinished_tail(&mut bullets);
        assert_eq!(bullets.len(), 2);
        drop_unfinished_tail(&mut bullets);
        assert_eq!(bullets.len(), 2);
    }

    #[test]
    fn step_serializes_with_tag() {
        let json = serde_json::to_value(RepairStep::Repair {
            cause: RepairCause::LengthLimit,
            bullets: 5,
        })
        .unwrap();
        assert_eq!(json["step"], "repair");
        assert_eq!(json["cause"], "length_limit");
    }
}
