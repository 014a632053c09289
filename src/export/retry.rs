//! Bounded retries around a portal call.
//!
//! The controller is a small state machine:
//!
//! ```text
//! Idle --acquire ok--> Authenticated --call ok--> done
//!   ^                      |
//!   |                 retryable cause, attempts left
//!   |                      v
//!   +---- slept ------ Retrying
//!
//! any other failure (login or call) --> Failed
//! ```
//!
//! An auth-related failure invalidates the cached session on the way to
//! `Retrying`, so the next `Idle` logs in again.

use crate::portal::client::Portal;
use crate::portal::error::{FailureCause, PortalError};
use crate::portal::session::{Session, SessionManager};
use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Option<Duration>,
    pub retryable_causes: Vec<FailureCause>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(8),
            backoff_multiplier: 2.0,
            max_delay: Some(Duration::from_secs(120)),
            retryable_causes: vec![
                FailureCause::TransientAuthExpired,
                FailureCause::RateLimited,
                FailureCause::NetworkTimeout,
                FailureCause::PortalUnavailable,
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs)
            .unwrap_or_else(|_| self.max_delay.unwrap_or(Duration::MAX));
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    pub fn is_retryable(&self, cause: FailureCause) -> bool {
        self.retryable_causes.contains(&cause)
    }

    fn after_failure(&self, attempt: u32, error: PortalError) -> RetryState {
        let cause = error.cause();
        if self.is_retryable(cause) && attempt < self.max_attempts {
            let delay = self.delay_for(attempt);
            warn!(
                "Attempt {}/{} failed ({}): {}; retrying in {:?}",
                attempt, self.max_attempts, cause, error, delay
            );
            RetryState::Retrying { attempt, delay }
        } else {
            debug!("Attempt {} failed terminally ({})", attempt, cause);
            RetryState::Failed { attempt, error }
        }
    }
}

#[derive(Debug)]
enum RetryState {
    Idle { attempt: u32 },
    Authenticated { attempt: u32, session: Session },
    Retrying { attempt: u32, delay: Duration },
    Failed { attempt: u32, error: PortalError },
}

/// A successful result and what it took to get it.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub delays: Vec<Duration>,
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {source}")]
pub struct RetryFailure {
    pub attempts: u32,
    pub delays: Vec<Duration>,
    #[source]
    pub source: PortalError,
}

impl RetryFailure {
    pub fn cause(&self) -> FailureCause {
        self.source.cause()
    }
}

/// Runs `operation` with a session from `sessions`, retrying per `policy`.
///
/// The login itself counts as part of an attempt: a transient login failure is
/// retried like a transient call failure, rejected credentials are not.
pub async fn with_retry<P, F, Fut, T>(
    policy: &RetryPolicy,
    sessions: &mut SessionManager,
    portal: &P,
    mut operation: F,
) -> Result<Retried<T>, RetryFailure>
where
    P: Portal,
    F: FnMut(Session) -> Fut,
    Fut: Future<Output = Result<T, PortalError>>,
{
    let mut delays = Vec::new();
    let mut state = RetryState::Idle { attempt: 1 };
    loop {
        state = match state {
            RetryState::Idle { attempt } => match sessions.acquire(portal).await {
                Ok(session) => RetryState::Authenticated { attempt, session },
                Err(error) => policy.after_failure(attempt, error),
            },
            RetryState::Authenticated { attempt, session } => {
                match operation(session.clone()).await {
                    Ok(value) => {
                        return Ok(Retried {
                            value,
                            attempts: attempt,
                            delays,
                        })
                    }
                    Err(error) => {
                        if error.cause().is_auth_related() {
                            sessions.invalidate(&session);
                        }
                        policy.after_failure(attempt, error)
                    }
                }
            }
            RetryState::Retrying { attempt, delay } => {
                tokio::time::sleep(delay).await;
                delays.push(delay);
                RetryState::Idle {
                    attempt: attempt + 1,
                }
            }
            RetryState::Failed { attempt, error } => {
                return Err(RetryFailure {
                    attempts: attempt,
                    delays,
                    source: error,
                })
            }
        };
    }
}
