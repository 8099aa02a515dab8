//! Map stage: concurrent per-chunk digests joined in chunk order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{Id as TaskId, JoinError, JoinSet};

use crate::dispatch::{CompletionBackend, GenerationOptions, GenerationRequest, GenerationResult};
use crate::error::SiftError;
use crate::summarize::bullets::strip_sentinel;
use crate::summarize::metrics::{CallMetrics, MapMetrics, Stage};
use crate::summarize::prompts;

/// How long to wait for aborted tasks to unwind before giving up on them.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Result of the map stage. `digests` only holds successful chunks, in the
/// order their chunks appeared in the source.
#[derive(Debug)]
pub struct MapOutcome {
    pub digests: Vec<String>,
    pub calls: Vec<CallMetrics>,
    pub metrics: MapMetrics,
    /// First failure by chunk index, kept for escalation when nothing succeeded.
    pub first_error: Option<SiftError>,
}

impl MapOutcome {
    pub fn combined(&self) -> String {
        self.digests.join("\n\n")
    }
}

type TaskOutput = (usize, Result<GenerationResult, SiftError>, u64);

/// Per-chunk result slot. Each task owns exactly one.
enum Slot {
    Pending,
    Done(Result<GenerationResult, SiftError>, u64),
}

/// Fan out one digest call per chunk, at most `concurrency` in flight on top
/// of the backend's own connection limit. Failed chunks are dropped. When
/// `deadline` passes, outstanding calls are aborted and counted as timed out.
/// Callers pass a map-only deadline that leaves room for the stages after it.
pub async fn map_chunks<B>(
    backend: Arc<B>,
    chunks: Vec<String>,
    model: &str,
    options: &GenerationOptions,
    concurrency: usize,
    deadline: Instant,
) -> MapOutcome
where
    B: CompletionBackend + 'static,
{
    let limiter = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut task_chunks: HashMap<TaskId, usize> = HashMap::new();
    let mut slots: Vec<Slot> = (0..chunks.len()).map(|_| Slot::Pending).collect();

    for (index, chunk) in chunks.iter().enumerate() {
        let backend = backend.clone();
        let limiter = limiter.clone();
        let req = GenerationRequest {
            model: model.to_string(),
            prompt: prompts::chunk_digest(chunk),
            options: options.clone(),
            deadline,
        };

        let handle = set.spawn(async move {
            let started = Instant::now();
            let result = match limiter.acquire_owned().await {
                Ok(_permit) => backend.generate(&req).await,
                Err(_) => Err(SiftError::Other("map limiter closed".to_string())),
            };
            (index, result, started.elapsed().as_millis() as u64)
        });
        task_chunks.insert(handle.id(), index);
    }

    let cutoff = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
    tokio::pin!(cutoff);

    loop {
        tokio::select! {
            biased; // a finished call beats the deadline when both are ready
            joined = set.join_next() => match joined {
                Some(joined) => fill_slot(&mut slots, &task_chunks, joined),
                None => break,
            },
            _ = &mut cutoff => {
                tracing::warn!(outstanding = set.len(), "request deadline reached during map stage");
                set.abort_all();
                break;
            }
        }
    }

    // Calls that finished while abort_all() was being delivered still count.
    let drain_grace = tokio::time::sleep(DRAIN_GRACE);
    tokio::pin!(drain_grace);
    loop {
        tokio::select! {
            biased;
            joined = set.join_next() => match joined {
                Some(joined) => fill_slot(&mut slots, &task_chunks, joined),
                None => break,
            },
            _ = &mut drain_grace => {
                tracing::warn!("{} map tasks hung after abort, abandoning drain", set.len());
                break;
            }
        }
    }

    collect(slots)
}

fn fill_slot(
    slots: &mut [Slot],
    task_chunks: &HashMap<TaskId, usize>,
    joined: Result<TaskOutput, JoinError>,
) {
    match joined {
        Ok((index, result, latency_ms)) => slots[index] = Slot::Done(result, latency_ms),
        Err(e) if e.is_panic() => {
            tracing::error!("map task panicked: {e}");
            if let Some(&index) = task_chunks.get(&e.id()) {
                slots[index] = Slot::Done(Err(SiftError::Other(format!("task panicked: {e}"))), 0);
            }
        }
        Err(_) => {} // cancelled by abort_all()
    }
}

fn collect(slots: Vec<Slot>) -> MapOutcome {
    let mut outcome = MapOutcome {
        digests: Vec::new(),
        calls: Vec::new(),
        metrics: MapMetrics {
            chunks: slots.len(),
            ..MapMetrics::default()
        },
        first_error: None,
    };

    for (index, slot) in slots.into_iter().enumerate() {
        match slot {
            Slot::Pending => outcome.metrics.timed_out += 1,
            Slot::Done(Ok(result), _) => {
                outcome
                    .calls
                    .push(CallMetrics::success(Stage::Map, Some(index), &result));
                let digest = strip_sentinel(&result.text).trim();
                if digest.is_empty() {
                    tracing::warn!(chunk = index, "empty digest, chunk dropped");
                    outcome.metrics.failed += 1;
                } else {
                    outcome.digests.push(digest.to_string());
                    outcome.metrics.succeeded += 1;
                }
            }
            Slot::Done(Err(e), latency_ms) => {
                tracing::warn!(chunk = index, error = %e, "chunk digest failed, chunk dropped");
                outcome
                    .calls
                    .push(CallMetrics::failure(Stage::Map, Some(index), &e, latency_ms));
                match e {
                    SiftError::Timeout(_) => outcome.metrics.timed_out += 1,
                    _ => outcome.metrics.failed += 1,
                }
                if outcome.first_error.is_none() {
                    outcome.first_error = Some(e);
                }
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{StopReason, Usage};

    fn ok(text: &str) -> Slot {
        Slot::Done(
            Ok(GenerationResult {
                text: text.to_string(),
                stop_reason: StopReason::NaturalEnd,
                usage: Usage::default(),
                latency_ms: 1,
            }),
            1,
        )
    }

    #[test]
    fn collect_keeps_chunk_order_and_counts() {
        let slots = vec![
            ok("first digest"),
            Slot::Done(Err(SiftError::BackendUnavailable("down".into())), 3),
            ok("third digest <END> trailing"),
            Slot::Pending,
        ];
        let outcome = collect(slots);
        assert_eq!(outcome.digests, vec!["first digest", "third digest"]);
        assert_eq!(
            outcome.metrics,
            MapMetrics {
                chunks: 4,
                succeeded: 2,
                failed: 1,
                timed_out: 1
            }
        );
        assert_eq!(outcome.calls.len(), 3);
        assert!(outcome.metrics.hit_deadline());
        assert!(matches!(
            outcome.first_error,
            Some(SiftError::BackendUnavailable(_))
        ));
        assert_eq!(outcome.combined(), "first digest\n\nthird digest");
    }

    #[test]
    fn timed_out_call_is_not_a_plain_failure() {
        let outcome = collect(vec![
            ok("kept"),
            Slot::Done(Err(SiftError::Timeout(0)), 90),
            Slot::Pending,
        ]);
        assert_eq!(outcome.metrics.timed_out, 2);
        assert_eq!(outcome.metrics.failed, 0);
        assert!(outcome.metrics.hit_deadline());
        assert!(matches!(outcome.first_error, Some(SiftError::Timeout(_))));
    }

    #[test]
    fn blank_digest_counts_as_failed() {
        let outcome = collect(vec![ok("  \n"), ok("real")]);
        assert_eq!(outcome.digests, vec!["real"]);
        assert_eq!(outcome.metrics.failed, 1);
        assert!(outcome.first_error.is_none());
    }
}
