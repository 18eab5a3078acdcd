//! Class-based retry policy
//!
//! Every failure is mapped to a `RetryClass`, and each class owns a fixed
//! strategy:
//!
//! | class      | strategy    | retries      | delay before retry n (1-based)          |
//! |------------|-------------|--------------|-----------------------------------------|
//! | network    | exponential | max          | `base·factor^(n-1)`, capped             |
//! | timeout    | exponential | max − 1      | `base·2·factor^(n-1)`, capped           |
//! | permission | none        | 0            | -                                       |
//! | not_found  | fixed       | 1            | `not_found_delay`                       |
//! | validation | none        | 0            | -                                       |
//! | unknown    | linear      | max − 1      | `base + (n-1)·1.5s`, capped at max/2    |
//!
//! `execute` also enforces a cumulative ceiling across all attempts so a
//! long chain of slow failures cannot run unbounded.

use std::future::Future;
use std::time::Duration;

use portal::ErrorKind;
use rand::RngExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Result;

/// Step added per retry by the linear strategy.
const LINEAR_STEP: Duration = Duration::from_millis(1500);

/// Failure classes the retry policy distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryClass {
    Network,
    Timeout,
    Permission,
    NotFound,
    Validation,
    Unknown,
}

impl RetryClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryClass::Network => "network",
            RetryClass::Timeout => "timeout",
            RetryClass::Permission => "permission",
            RetryClass::NotFound => "not_found",
            RetryClass::Validation => "validation",
            RetryClass::Unknown => "unknown",
        }
    }
}

impl From<ErrorKind> for RetryClass {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Network => RetryClass::Network,
            ErrorKind::Timeout => RetryClass::Timeout,
            ErrorKind::Permission => RetryClass::Permission,
            ErrorKind::NotFound => RetryClass::NotFound,
            ErrorKind::Validation => RetryClass::Validation,
            // A challenge that survived the in-place retries is worth a
            // fresh login later, but not an aggressive one
            ErrorKind::Challenge | ErrorKind::Unknown => RetryClass::Unknown,
        }
    }
}

/// Delay growth strategy for a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    None,
    Fixed,
    Linear,
    Exponential,
}

/// Randomization applied to computed delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Exact delays
    #[default]
    None,
    /// random[0, delay]
    Full,
    /// delay/2 + random[0, delay/2]
    Equal,
}

impl Jitter {
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return delay;
        }
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rand::rng().random_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rand::rng().random_range(0..=half)
                };
                Duration::from_millis(half + jitter)
            }
        }
    }
}

/// One attempt made by `RetryPolicy::execute`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Failure class, `None` when the attempt succeeded
    pub class: Option<RetryClass>,
    /// Time since the first attempt started, measured when this one finished
    pub elapsed: Duration,
    /// Sleep scheduled after this attempt, `None` if the run stopped here
    pub delay: Option<Duration>,
}

/// Outcome of `RetryPolicy::execute` with its full attempt record.
#[derive(Debug)]
pub struct RetryRun<T> {
    pub result: Result<T>,
    pub records: Vec<RetryRecord>,
}

/// Maps failure classes to retry decisions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn strategy(class: RetryClass) -> Strategy {
        match class {
            RetryClass::Network | RetryClass::Timeout => Strategy::Exponential,
            RetryClass::NotFound => Strategy::Fixed,
            RetryClass::Unknown => Strategy::Linear,
            RetryClass::Permission | RetryClass::Validation => Strategy::None,
        }
    }

    /// Number of retries allowed after the first failure of `class`.
    pub fn max_retries(&self, class: RetryClass) -> u32 {
        let max = self.config.max_retries;
        match class {
            RetryClass::Network => max,
            RetryClass::Timeout | RetryClass::Unknown => max.saturating_sub(1),
            RetryClass::NotFound => 1,
            RetryClass::Permission | RetryClass::Validation => 0,
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` if the class
    /// does not allow that many retries. Jitter is not applied here.
    pub fn delay_for(&self, class: RetryClass, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries(class) {
            return None;
        }
        let n = (retry - 1).min(i32::MAX as u32) as i32;
        let base = self.config.base_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();

        let secs = match class {
            RetryClass::Network => base * self.config.factor.powi(n),
            RetryClass::Timeout => base * 2.0 * self.config.factor.powi(n),
            RetryClass::NotFound => return Some(self.config.not_found_delay),
            RetryClass::Unknown => {
                let linear = base + f64::from(n as u32) * LINEAR_STEP.as_secs_f64();
                return Some(clamp_secs(linear, max / 2.0));
            }
            RetryClass::Permission | RetryClass::Validation => return None,
        };
        Some(clamp_secs(secs, max))
    }

    /// Run `op` until it succeeds or the policy says stop.
    ///
    /// `op` receives the 1-based attempt number. On failure the error is
    /// classified; the run stops when the class allows no further retry or
    /// when the cumulative elapsed time (including the next delay) would pass
    /// `total_timeout`. The last error is returned unchanged.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> RetryRun<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut attempt = 1u32;

        loop {
            let outcome = op(attempt).await;
            let elapsed = started.elapsed();

            let error = match outcome {
                Ok(value) => {
                    records.push(RetryRecord {
                        attempt,
                        class: None,
                        elapsed,
                        delay: None,
                    });
                    return RetryRun {
                        result: Ok(value),
                        records,
                    };
                }
                Err(e) => e,
            };

            let class = error.class();
            let delay = self
                .delay_for(class, attempt)
                .map(|d| self.config.jitter.apply(d))
                .filter(|d| elapsed + *d <= self.config.total_timeout);

            records.push(RetryRecord {
                attempt,
                class: Some(class),
                elapsed,
                delay,
            });

            let Some(delay) = delay else {
                if elapsed >= self.config.total_timeout {
                    warn!(attempt, class = class.as_str(), ?elapsed, "retry ceiling exceeded");
                } else {
                    debug!(attempt, class = class.as_str(), error = %error, "not retrying");
                }
                return RetryRun {
                    result: Err(error),
                    records,
                };
            };

            warn!(
                attempt,
                class = class.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "operation failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn clamp_secs(secs: f64, max_secs: f64) -> Duration {
    if !secs.is_finite() || secs < 0.0 || secs > max_secs {
        Duration::from_secs_f64(max_secs.max(0.0))
    } else {
        Duration::from_secs_f64(secs)
    }
}
