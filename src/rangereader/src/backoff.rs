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

//! Truncated exponential backoff with full jitter for the retry loop.

use crate::Result;
use crate::error::Error;
use std::time::Duration;

/// Determines how long the retry loop waits before the next attempt.
pub trait BackoffPolicy: Send + Sync + std::fmt::Debug {
    /// Returns the delay before the attempt following `attempt_count` failed
    /// attempts.
    fn on_failure(&self, loop_start: std::time::Instant, attempt_count: u32) -> Duration;
}

/// Builds [ExponentialBackoff] policies.
#[derive(Clone, Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    maximum_delay: Duration,
    scaling: f64,
}

impl ExponentialBackoffBuilder {
    /// Creates a builder with the default parameters.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use tileverse_rangereader::backoff::ExponentialBackoffBuilder;
    ///
    /// let policy = ExponentialBackoffBuilder::new()
    ///     .with_initial_delay(Duration::from_millis(100))
    ///     .with_maximum_delay(Duration::from_secs(5))
    ///     .with_scaling(4.0)
    ///     .build()?;
    /// # Ok::<(), tileverse_rangereader::Error>(())
    /// ```
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            maximum_delay: Duration::from_secs(10),
            scaling: 2.0,
        }
    }

    /// Change the initial delay.
    pub fn with_initial_delay<V: Into<Duration>>(mut self, v: V) -> Self {
        self.initial_delay = v.into();
        self
    }

    /// Change the maximum delay.
    pub fn with_maximum_delay<V: Into<Duration>>(mut self, v: V) -> Self {
        self.maximum_delay = v.into();
        self
    }

    /// Change the scaling factor.
    pub fn with_scaling<V: Into<f64>>(mut self, v: V) -> Self {
        self.scaling = v.into();
        self
    }

    /// Creates the policy, validating the parameters.
    pub fn build(self) -> Result<ExponentialBackoff> {
        if self.scaling < 1.0 {
            return Err(Error::configuration(format!(
                "scaling ({}) must be >= 1.0",
                self.scaling
            )));
        }
        if self.initial_delay.is_zero() {
            return Err(Error::configuration(format!(
                "initial delay must be greater than zero, got={:?}",
                self.initial_delay
            )));
        }
        if self.maximum_delay < self.initial_delay {
            return Err(Error::configuration(format!(
                "maximum delay ({:?}) must be greater or equal to the initial delay ({:?})",
                self.maximum_delay, self.initial_delay
            )));
        }
        Ok(ExponentialBackoff {
            initial_delay: self.initial_delay,
            maximum_delay: self.maximum_delay,
            scaling: self.scaling,
        })
    }
}

impl std::default::Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Implements truncated exponential backoff.
///
/// The delay after attempt `N` is `initial_delay * scaling^(N-1)`, capped at
/// the maximum delay, with full jitter: the actual sleep is drawn uniformly
/// from `[0, delay]`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    maximum_delay: Duration,
    scaling: f64,
}

impl ExponentialBackoff {
    fn delay(&self, attempt_count: u32) -> Duration {
        let exp = std::cmp::min(i32::MAX as u32, attempt_count) as i32;
        let exp = exp.saturating_sub(1);
        let scaling = self.scaling.powi(exp);
        if scaling >= self.maximum_delay.div_duration_f64(self.initial_delay) {
            self.maximum_delay
        } else {
            self.initial_delay.mul_f64(scaling)
        }
    }

    fn delay_with_jitter(&self, attempt_count: u32, rng: &mut impl rand::Rng) -> Duration {
        let delay = self.delay(attempt_count);
        rng.random_range(Duration::ZERO..=delay)
    }
}

impl std::default::Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            maximum_delay: Duration::from_secs(10),
            scaling: 2.0,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn on_failure(&self, _loop_start: std::time::Instant, attempt_count: u32) -> Duration {
        self.delay_with_jitter(attempt_count, &mut rand::rng())
    }
}
