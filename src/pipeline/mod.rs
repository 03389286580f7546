//! Digest pipeline.
//!
//! Every run for an account flows through:
//! 1. `MessageSource::fetch()` labeled unread newsletters
//! 2. `Normalizer::normalize()` HTML → bounded plain text + links
//! 3. `Summarizer::summarize()` 1–3 bullets per item
//! 4. `DigestCompiler::compile()` + `DigestDispatcher::send()`
//! 5. `MessageSource::mark_consumed()`

pub mod orchestrator;
pub mod types;

pub use orchestrator::Orchestrator;
pub use types::{
    Digest, DispatchStatus, ItemReport, Link, MarkFailure, NormalizedItem, RawMessage,
    RunOutcome, RunReport, RunStage, SummarizedItem, SummaryOutcome,
};
