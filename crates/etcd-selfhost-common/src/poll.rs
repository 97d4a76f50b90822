//! Deadline-bounded polling
//!
//! Consolidates the pattern of polling a condition in a loop with a delay,
//! bounded by an absolute wall-clock deadline rather than a retry count, so a
//! slow-but-progressing cluster is still bounded. Each check is raced against
//! the remaining time, which means an in-flight probe is dropped (and its
//! request cancelled) the moment the deadline passes instead of outliving it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default poll interval for membership and health checks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Why polling stopped without the condition being met
#[derive(Debug)]
pub enum PollError<E> {
    /// The deadline passed; carries the last check error, if any
    DeadlineExceeded {
        /// Most recent error returned by the check, if it was failing
        last_error: Option<E>,
    },
    /// The cancellation token fired
    Cancelled,
    /// The check returned an error the caller marked as fatal
    Fatal(E),
}

/// Outcome of a single poll check
#[derive(Debug, PartialEq)]
pub enum Poll<T> {
    /// Condition met
    Ready(T),
    /// Keep waiting
    Pending,
}

/// Poll `check` every `interval` until it returns `Ready`, `deadline` passes,
/// or `cancel` fires.
///
/// Check errors are treated as transient and retried silently unless
/// `is_fatal` returns true for them. The deadline is never reported early:
/// sleeps are clipped to the remaining time, and the final check is allowed
/// to run until exactly the deadline.
pub async fn poll_until_deadline<T, E, F, Fut>(
    description: &str,
    deadline: Instant,
    interval: Duration,
    cancel: &CancellationToken,
    is_fatal: impl Fn(&E) -> bool,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>, E>>,
    E: std::fmt::Display,
{
    let mut last_error = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            debug!(description, "deadline reached while polling");
            return Err(PollError::DeadlineExceeded { last_error });
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => None,
            result = check() => Some(result),
        };

        match outcome {
            None => {
                debug!(description, "deadline reached during in-flight check");
                return Err(PollError::DeadlineExceeded { last_error });
            }
            Some(Ok(Poll::Ready(value))) => return Ok(value),
            Some(Ok(Poll::Pending)) => {
                trace!(description, "condition not yet met");
                last_error = None;
            }
            Some(Err(e)) if is_fatal(&e) => return Err(PollError::Fatal(e)),
            Some(Err(e)) => {
                debug!(description, error = %e, "poll check failed, retrying");
                last_error = Some(e);
            }
        }

        let wake = std::cmp::min(Instant::now() + interval, deadline);
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}
