//! In-process scripted backend for pipeline and server tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::dispatch::{
    CompletionBackend, GenerationRequest, GenerationResult, MIN_CALL_BUDGET, StopReason, Usage,
};
use crate::error::SiftError;

/// One scripted answer.
pub enum Reply {
    Text(String, StopReason),
    Fail(SiftError),
}

struct Rule {
    needle: String,
    replies: VecDeque<(Reply, Option<Duration>)>,
}

/// Answers calls from a script. A call takes the next reply of the first
/// rule whose needle occurs in the prompt and that still has replies, else
/// the next default reply. Running dry is an error, not a panic.
///
/// Deadlines are enforced like the HTTP client does: a call with too little
/// time left fails at once, and a delay that outlives the deadline ends in
/// `Timeout` when the deadline passes.
#[derive(Default)]
pub struct ScriptedBackend {
    rules: Mutex<Vec<Rule>>,
    defaults: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a default reply.
    pub fn reply(self, text: &str, stop: StopReason) -> Self {
        self.push_default(Reply::Text(text.to_string(), stop))
    }

    /// Queue a default failure.
    pub fn fail(self, err: SiftError) -> Self {
        self.push_default(Reply::Fail(err))
    }

    /// Reply to prompts containing `needle`.
    pub fn on(self, needle: &str, text: &str, stop: StopReason) -> Self {
        self.push_rule(needle, Reply::Text(text.to_string(), stop), None)
    }

    pub fn on_fail(self, needle: &str, err: SiftError) -> Self {
        self.push_rule(needle, Reply::Fail(err), None)
    }

    /// Reply to prompts containing `needle` after sleeping `delay`.
    pub fn on_delayed(self, needle: &str, text: &str, delay: Duration) -> Self {
        self.push_rule(
            needle,
            Reply::Text(text.to_string(), StopReason::NaturalEnd),
            Some(delay),
        )
    }

    fn push_default(self, reply: Reply) -> Self {
        if let Ok(mut defaults) = self.defaults.lock() {
            defaults.push_back(reply);
        }
        self
    }

    fn push_rule(self, needle: &str, reply: Reply, delay: Option<Duration>) -> Self {
        if let Ok(mut rules) = self.rules.lock() {
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back((reply, delay)),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([(reply, delay)]),
                }),
            }
        }
        self
    }

    /// Every request seen so far, in arrival order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    /// Number of prompts containing `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.requests
            .lock()
            .map(|r| r.iter().filter(|req| req.prompt.contains(needle)).count())
            .unwrap_or_default()
    }

    /// Highest number of calls that were in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, prompt: &str) -> (Option<Reply>, Option<Duration>) {
        if let Ok(mut rules) = self.rules.lock()
            && let Some(rule) = rules
                .iter_mut()
                .find(|r| !r.replies.is_empty() && prompt.contains(&r.needle))
            && let Some((reply, delay)) = rule.replies.pop_front()
        {
            return (Some(reply), delay);
        }
        let reply = self.defaults.lock().ok().and_then(|mut d| d.pop_front());
        (reply, None)
    }
}

impl CompletionBackend for ScriptedBackend {
    async fn generate(&self, req: &GenerationRequest) -> Result<GenerationResult, SiftError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(req.clone());
        }
        let (reply, delay) = self.next_reply(&req.prompt);

        let remaining = req.deadline.saturating_duration_since(Instant::now());
        if remaining <= MIN_CALL_BUDGET {
            return Err(SiftError::Timeout(0));
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Yield so concurrent callers overlap even without a delay.
        let in_time = match delay {
            Some(d) => tokio::time::timeout(remaining, tokio::time::sleep(d)).await.is_ok(),
            None => {
                tokio::task::yield_now().await;
                true
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !in_time {
            return Err(SiftError::Timeout(remaining.as_millis() as u64));
        }

        match reply {
            Some(Reply::Text(text, stop_reason)) => Ok(GenerationResult {
                usage: Usage {
                    prompt_tokens: Some(req.prompt.split_whitespace().count() as u64),
                    output_tokens: Some(text.split_whitespace().count() as u64),
                    ..Usage::default()
                },
                text,
                stop_reason,
                latency_ms: delay.map_or(0, |d| d.as_millis() as u64),
            }),
            Some(Reply::Fail(err)) => Err(err),
            None => Err(SiftError::Other("scripted backend has no reply left".to_string())),
        }
    }
}
