// Copyright 2025 Tileverse
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Retry policies for ranged reads and the loop that drives them.
//!
//! The HTTP and object-store backends retry the failures their servers
//! document as safe to retry: request timeouts (408), throttling (429), and
//! server errors (5xx), plus transport failures that never produced a
//! response. Everything else is permanent. Policies compose: wrap a base
//! policy with [RetryPolicyExt::with_attempt_limit] or
//! [RetryPolicyExt::with_time_limit] to bound the loop.

use crate::Result;
use crate::backoff::BackoffPolicy;
use crate::error::{Error, ErrorKind};
use std::sync::Arc;
use std::time::Duration;

/// The result of a retry policy decision.
///
/// All variants carry the error so composed policies can re-classify the
/// inner policy's decision.
#[derive(Debug)]
pub enum RetryResult {
    /// Stop the retry loop because this is a permanent error.
    Permanent(Error),
    /// Stop the retry loop. The error is retryable, but the retry attempts
    /// are exhausted.
    Exhausted(Error),
    /// The error was retryable, continue the retry loop.
    Continue(Error),
}

impl RetryResult {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted(_))
    }
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue(_))
    }

    /// Consumes the decision and returns the error it carries.
    pub fn into_error(self) -> Error {
        match self {
            Self::Permanent(e) | Self::Exhausted(e) | Self::Continue(e) => e,
        }
    }
}

/// Determines how errors are handled in the retry loop.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Query the retry policy after an error.
    ///
    /// `attempt_count` includes the initial attempt, so it is never zero
    /// here. `idempotent` widens the set of retryable errors; ranged GETs are
    /// idempotent.
    fn on_error(
        &self,
        loop_start: std::time::Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult;

    /// The remaining time in the retry policy.
    ///
    /// Time-based policies return the remaining budget so the loop can trim
    /// per-attempt timeouts; other policies return `None`.
    fn remaining_time(
        &self,
        _loop_start: std::time::Instant,
        _attempt_count: u32,
    ) -> Option<Duration> {
        None
    }
}

/// Extension trait for [RetryPolicy] composition.
pub trait RetryPolicyExt: RetryPolicy + Sized {
    /// Limits the total elapsed time in the retry loop.
    fn with_time_limit(self, maximum_duration: Duration) -> LimitedElapsedTime<Self> {
        LimitedElapsedTime {
            inner: self,
            maximum_duration,
        }
    }

    /// Limits the number of attempts, including the initial one.
    fn with_attempt_limit(self, maximum_attempts: u32) -> LimitedAttemptCount<Self> {
        LimitedAttemptCount {
            inner: self,
            maximum_attempts,
        }
    }
}

impl<T: RetryPolicy> RetryPolicyExt for T {}

/// Retries the errors ranged-read servers document as safe to retry.
///
/// Transport failures without a status code are retried when the request is
/// idempotent, as are 408, 429, and all 5xx responses. Authentication,
/// missing sources, unsupported ranges, and caller errors are permanent.
#[derive(Clone, Debug)]
pub struct TransientErrors;

impl RetryPolicy for TransientErrors {
    fn on_error(
        &self,
        _loop_start: std::time::Instant,
        _attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        if !idempotent {
            return RetryResult::Permanent(error);
        }
        if let Some(code) = error.http_status_code() {
            return match code {
                408 | 429 | 500..600 => RetryResult::Continue(error),
                _ => RetryResult::Permanent(error),
            };
        }
        match error.kind() {
            ErrorKind::Io => RetryResult::Continue(error),
            _ => RetryResult::Permanent(error),
        }
    }
}

/// A retry policy that never retries.
#[derive(Clone, Debug)]
pub struct NeverRetry;

impl RetryPolicy for NeverRetry {
    fn on_error(
        &self,
        _loop_start: std::time::Instant,
        _attempt_count: u32,
        _idempotent: bool,
        error: Error,
    ) -> RetryResult {
        RetryResult::Exhausted(error)
    }
}

/// A retry policy decorator that limits the total time in the retry loop.
#[derive(Clone, Debug)]
pub struct LimitedElapsedTime<P = TransientErrors>
where
    P: RetryPolicy,
{
    inner: P,
    maximum_duration: Duration,
}

impl LimitedElapsedTime {
    pub fn new(maximum_duration: Duration) -> Self {
        Self {
            inner: TransientErrors,
            maximum_duration,
        }
    }
}

impl<P> RetryPolicy for LimitedElapsedTime<P>
where
    P: RetryPolicy,
{
    fn on_error(
        &self,
        loop_start: std::time::Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        match self.inner.on_error(loop_start, attempt_count, idempotent, error) {
            RetryResult::Continue(e) if loop_start.elapsed() >= self.maximum_duration => {
                RetryResult::Exhausted(e)
            }
            other => other,
        }
    }

    fn remaining_time(
        &self,
        loop_start: std::time::Instant,
        attempt_count: u32,
    ) -> Option<Duration> {
        let deadline = self.maximum_duration.saturating_sub(loop_start.elapsed());
        match self.inner.remaining_time(loop_start, attempt_count) {
            Some(inner) => Some(std::cmp::min(inner, deadline)),
            None => Some(deadline),
        }
    }
}

/// A retry policy decorator that limits the number of attempts.
#[derive(Clone, Debug)]
pub struct LimitedAttemptCount<P = TransientErrors>
where
    P: RetryPolicy,
{
    inner: P,
    maximum_attempts: u32,
}

impl LimitedAttemptCount {
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            inner: TransientErrors,
            maximum_attempts,
        }
    }
}

impl<P> RetryPolicy for LimitedAttemptCount<P>
where
    P: RetryPolicy,
{
    fn on_error(
        &self,
        loop_start: std::time::Instant,
        attempt_count: u32,
        idempotent: bool,
        error: Error,
    ) -> RetryResult {
        match self.inner.on_error(loop_start, attempt_count, idempotent, error) {
            RetryResult::Continue(e) if attempt_count >= self.maximum_attempts => {
                RetryResult::Exhausted(e)
            }
            other => other,
        }
    }

    fn remaining_time(
        &self,
        loop_start: std::time::Instant,
        attempt_count: u32,
    ) -> Option<Duration> {
        self.inner.remaining_time(loop_start, attempt_count)
    }
}

/// Runs the retry loop for a given function.
///
/// Calls `inner` until it succeeds, the retry policy declares the error
/// permanent, or the budget is exhausted. Between attempts the loop sleeps
/// for the duration prescribed by the backoff policy; a sleep that would
/// outlast the remaining time budget ends the loop instead.
pub async fn retry_loop<F, S, T>(
    mut inner: F,
    sleep: S,
    idempotent: bool,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_policy: Arc<dyn BackoffPolicy>,
) -> Result<T>
where
    F: AsyncFnMut(Option<Duration>) -> Result<T> + Send,
    S: AsyncFn(Duration) -> () + Send,
{
    let loop_start = std::time::Instant::now();
    let mut attempt_count = 0_u32;
    let mut pending_delay: Option<(Duration, Error)> = None;
    loop {
        let remaining = retry_policy.remaining_time(loop_start, attempt_count);
        if let Some((delay, prev_error)) = pending_delay.take() {
            if remaining.is_some_and(|remaining| remaining < delay) {
                return Err(prev_error);
            }
            sleep(delay).await;
        }
        attempt_count += 1;
        match inner(remaining).await {
            Ok(r) => return Ok(r),
            Err(e) => {
                let delay = backoff_policy.on_failure(loop_start, attempt_count);
                match retry_policy.on_error(loop_start, attempt_count, idempotent, e) {
                    RetryResult::Permanent(e) | RetryResult::Exhausted(e) => return Err(e),
                    RetryResult::Continue(e) => pending_delay = Some((delay, e)),
                }
            }
        }
    }
}

/// Equivalent to [retry_loop], but for an `inner` that borrows a receiver
/// `this` on every attempt.
///
/// `retry_loop`'s `AsyncFnMut` bound cannot be proven `Send` for an
/// arbitrary borrow lifetime when `inner` closes over `&self` (a current
/// rustc limitation with async closures that capture a reference). Taking
/// `this` as an explicit argument and returning an already-boxed future
/// sidesteps that: a plain `FnMut` returning `Pin<Box<dyn Future>>` is
/// provably higher-ranked over the borrow lifetime the way an async closure
/// capturing the borrow is not.
pub(crate) async fn retry_loop_on<R, F, S, T>(
    this: &R,
    mut inner: F,
    sleep: S,
    idempotent: bool,
    retry_policy: Arc<dyn RetryPolicy>,
    backoff_policy: Arc<dyn BackoffPolicy>,
) -> Result<T>
where
    R: Sync,
    F: for<'a> FnMut(
        &'a R,
        Option<Duration>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>,
    S: AsyncFn(Duration) -> () + Send,
{
    let loop_start = std::time::Instant::now();
    let mut attempt_count = 0_u32;
    let mut pending_delay: Option<(Duration, Error)> = None;
    loop {
        let remaining = retry_policy.remaining_time(loop_start, attempt_count);
        if let Some((delay, prev_error)) = pending_delay.take() {
            if remaining.is_some_and(|remaining| remaining < delay) {
                return Err(prev_error);
            }
            sleep(delay).await;
        }
        attempt_count += 1;
        match inner(this, remaining).await {
            Ok(r) => return Ok(r),
            Err(e) => {
                let delay = backoff_policy.on_failure(loop_start, attempt_count);
                match retry_policy.on_error(loop_start, attempt_count, idempotent, e) {
                    RetryResult::Permanent(e) | RetryResult::Exhausted(e) => return Err(e),
                    RetryResult::Continue(e) => pending_delay = Some((delay, e)),
                }
            }
        }
    }
}
