//! Retrying tag calls that race the provider's eventual consistency.

use std::time::Duration;

use crate::runner::RunnerError;

/// Attempts made before a tag failure is recorded and ignored.
pub const TAG_ATTEMPTS: u32 = 10;

/// Result of [`tag_with_retry`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TagOutcome {
    /// Tags were applied on this 1-based attempt.
    Tagged {
        /// Attempt that succeeded.
        attempt: u32,
    },
    /// Every attempt failed.
    Exhausted {
        /// Rendered error of the final attempt.
        last_error: String,
    },
}

/// Calls `apply` up to `attempts` times, sleeping `delay` between failures.
/// Failures never propagate.
pub async fn tag_with_retry<F>(attempts: u32, delay: Duration, mut apply: F) -> TagOutcome
where
    F: FnMut() -> Result<(), RunnerError>,
{
    let mut last_error = String::from("no attempts made");
    for attempt in 1..=attempts {
        match apply() {
            Ok(()) => return TagOutcome::Tagged { attempt },
            Err(err) => {
                tracing::debug!(attempt, error = %err, "tagging failed, retrying");
                last_error = err.to_string();
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    tracing::warn!(attempts, error = %last_error, "giving up on tagging");
    TagOutcome::Exhausted { last_error }
}
