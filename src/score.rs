//! Due-time scores for the delay queue.
//!
//! A score is a decimal string: seconds since the epoch concatenated with a
//! 3-digit zero-padded millisecond component. The encoding sorts correctly
//! under a length-then-lexicographic comparison, which keeps the arithmetic
//! exact where a 64-bit float score would round.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

fn wall_clock() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Current wall clock in score form.
pub(crate) fn now_score() -> String {
    let now = wall_clock();
    format!("{}{:03}", now.as_secs(), now.subsec_millis())
}

/// Score for an entry due `delay_ms` from now.
pub(crate) fn delayed_score(delay_ms: u64) -> Result<String> {
    let now = wall_clock();
    compose_score(now.as_secs(), u64::from(now.subsec_millis()), delay_ms)
}

/// Add `delay_ms` to `(secs, ms)` and format, carrying milliseconds into the
/// seconds part. Overflow means the requested delay is not representable.
pub(crate) fn compose_score(secs: u64, ms: u64, delay_ms: u64) -> Result<String> {
    let total_ms = ms
        .checked_add(delay_ms)
        .ok_or_else(|| Error::transport("Message delay is too big"))?;
    let secs = secs
        .checked_add(total_ms / 1_000)
        .ok_or_else(|| Error::transport("Message delay is too big"))?;
    Ok(format!("{}{:03}", secs, total_ms % 1_000))
}

/// Length-then-lexicographic ordering: a longer score is a later instant,
/// equal lengths compare bytewise.
pub(crate) fn is_after(score: &str, reference: &str) -> bool {
    score.len() > reference.len() || (score.len() == reference.len() && score > reference)
}
