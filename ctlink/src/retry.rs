//! Bounded retry combinator.
//!
//! One policy type drives the exchange correlator, the clock exchange and the
//! OTA sequencer: an attempt limit, a fixed delay between attempts and an
//! optional budget that every failed attempt is charged against.

use {
    crate::error::Error,
    log::debug,
    std::{thread, time::Duration},
};

/// What a single attempt produced.
#[derive(Debug)]
pub enum Attempt<T> {
    /// The operation succeeded.
    Done(T),
    /// The operation failed but may be retried; `charge` is deducted from
    /// the budget.
    Retry {
        /// Budget consumed by this attempt.
        charge: Duration,
        /// Why the attempt failed.
        error: Error,
    },
    /// The operation failed permanently.
    Abort(Error),
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError {
    /// Every attempt was used.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        last: Error,
    },
    /// The budget ran out before the attempts did.
    BudgetSpent {
        /// Attempts made.
        attempts: u32,
        /// Budget charged so far.
        spent: Duration,
    },
    /// An attempt aborted.
    Aborted(Error),
}

impl RetryError {
    /// The underlying error, if one attempt produced it.
    pub fn into_last_error(self) -> Option<Error> {
        match self {
            Self::Exhausted { last, .. } | Self::Aborted(last) => Some(last),
            Self::BudgetSpent { .. } => None,
        }
    }
}

/// Context handed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct AttemptInfo {
    /// 1-based attempt number.
    pub number: u32,
    /// Budget still available, if the policy has one.
    pub remaining: Option<Duration>,
}

/// Attempt count, inter-attempt delay and optional budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
    /// Total budget failed attempts may consume.
    pub budget: Option<Duration>,
}

/// Attempts for clock reads and writes.
pub const CLOCK_ATTEMPTS: u32 = 3;

/// Delay between clock attempts.
pub const CLOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::clock()
    }
}

impl RetryPolicy {
    /// Create a policy without budget.
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay,
            budget: None,
        }
    }

    /// The clock exchange policy: three attempts, one second apart.
    pub const fn clock() -> Self {
        Self::new(CLOCK_ATTEMPTS, CLOCK_RETRY_DELAY)
    }

    /// Set the budget.
    #[must_use]
    pub const fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Set the delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Drive `op` until it succeeds, aborts, or the attempts or budget run
    /// out.
    pub fn drive<T, F>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(AttemptInfo) -> Attempt<T>,
    {
        let attempts = self.attempts.max(1);
        let mut spent = Duration::ZERO;
        let mut number = 0;

        loop {
            number += 1;
            let info = AttemptInfo {
                number,
                remaining: self
                    .budget
                    .map(|b| b.saturating_sub(spent)),
            };

            match op(info) {
                Attempt::Done(value) => return Ok(value),
                Attempt::Abort(err) => return Err(RetryError::Aborted(err)),
                Attempt::Retry { charge, error } => {
                    spent += charge;
                    debug!("attempt {number}/{attempts} failed: {error}");

                    if number >= attempts {
                        return Err(RetryError::Exhausted {
                            attempts: number,
                            last: error,
                        });
                    }
                    if let Some(budget) = self.budget {
                        if spent >= budget {
                            return Err(RetryError::BudgetSpent {
                                attempts: number,
                                spent,
                            });
                        }
                    }
                },
            }

            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
        }
    }

    /// Retry a fallible operation. Errors that cannot improve on retry
    /// (disconnection, interruption, missing selection) abort immediately.
    pub fn run<T, F>(&self, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut(u32) -> crate::Result<T>,
    {
        self.drive(|info| match op(info.number) {
            Ok(value) => Attempt::Done(value),
            Err(err) if err.is_retryable() => Attempt::Retry {
                charge: Duration::ZERO,
                error: err,
            },
            Err(err) => Attempt::Abort(err),
        })
    }
}
