//! Enrichment: derive a word-count metric from note content and persist it

mod worker;

pub use worker::{EnrichOutcome, EnrichmentSettings, EnrichmentWorker, MessageDisposition};

/// Number of whitespace-delimited tokens in `content`.
///
/// Runs of Unicode whitespace count as a single separator; blank content is 0.
pub fn word_count(content: &str) -> i64 {
    content.split_whitespace().count() as i64
}
