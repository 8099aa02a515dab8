//! Bounded bullet summarization: chunking, map/reduce, normalization,
//! completion assessment and the repair state machine.

pub mod assess;
pub mod bullets;
pub mod chunker;
pub mod map;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod repair;
pub mod state;

pub use pipeline::{Mode, Pipeline, PipelineSettings, SummarizeOptions, SummaryOutcome};
