//! Insight generation building blocks.
//!
//! ```text
//! prompt ──► InsightClient ──► parse_candidates ──► InsightValidator ──► build_record
//!                (external)       (per element)       (drop failures)      (tallies)
//! ```

mod client;
mod record;
mod validator;

pub use client::{
    build_prompt, create_insight_client, parse_candidates, prompt_hash, InsightClient,
    ParsedCandidates, PromptInput,
};
pub use record::{build_record, verify_record, RecordProvenance};
pub use validator::{InsightValidator, ValidationOutcome};
