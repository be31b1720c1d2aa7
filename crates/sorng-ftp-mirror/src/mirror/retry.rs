//! Bounded retry of transient failures.
//!
//! Only errors for which [`FtpError::is_transient`] holds are retried, and
//! they are retried immediately. Once more than `max_retries` attempts
//! have failed (`-1` never gives up) the last error is surfaced as
//! `RetriesExhausted`.

use crate::mirror::error::{FtpError, FtpResult};
use crate::mirror::types::RetryPolicy;
use std::future::Future;

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `action` until it succeeds, fails permanently or the policy
    /// gives up.
    pub async fn execute<T, F, Fut>(&self, description: &str, mut action: F) -> FtpResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FtpResult<T>>,
    {
        let mut tracker = self.tracker(description);
        loop {
            match action().await {
                Ok(value) => return Ok(value),
                Err(e) => tracker.record(e)?,
            }
        }
    }

    /// Attempt bookkeeping for call sites that re-issue a borrowed
    /// operation themselves through the `retrying!` macro.
    pub fn tracker<'d>(&self, description: &'d str) -> RetryTracker<'d> {
        RetryTracker {
            policy: self.policy,
            description,
            attempts: 0,
        }
    }
}

/// Counts failed attempts of one operation.
#[derive(Debug)]
pub struct RetryTracker<'d> {
    policy: RetryPolicy,
    description: &'d str,
    attempts: u32,
}

impl RetryTracker<'_> {
    /// `Ok(())` when the operation should be issued again, otherwise the
    /// error to surface.
    pub fn record(&mut self, err: FtpError) -> FtpResult<()> {
        if !err.is_transient() {
            return Err(err);
        }
        self.attempts += 1;
        log::warn!(
            "try #{}: error on {}: {}",
            self.attempts,
            self.description,
            err
        );
        let max = self.policy.max_retries;
        if max >= 0 && self.attempts > max as u32 {
            log::warn!("try #{}: giving up on {}", self.attempts, self.description);
            return Err(FtpError::retries_exhausted(self.description, self.attempts, err));
        }
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Re-evaluate a fallible expression under a [`RetryExecutor`]'s policy.
///
/// ```ignore
/// let ok = retrying!(retry, "deleting a.txt", session.delete_file("a.txt").await);
/// ```
macro_rules! retrying {
    ($retry:expr, $description:expr, $op:expr) => {{
        let mut tracker = $retry.tracker($description);
        loop {
            match $op {
                Ok(value) => break value,
                Err(e) => tracker.record(e)?,
            }
        }
    }};
}
pub(crate) use retrying;
