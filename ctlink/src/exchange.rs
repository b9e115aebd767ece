//! Request/response correlation.
//!
//! A [`Correlator`] serialises exchanges on one connector and drives each
//! through the retry combinator. The transport supplies a closure performing
//! one attempt (write, then wait up to the given timeout for the peer's
//! verdict); the correlator owns the timeout arithmetic and the retry and
//! budget accounting.

use {
    crate::{
        config::LinkConfig,
        error::{Error, Result},
        protocol::Channel,
        retry::{Attempt, RetryError, RetryPolicy},
    },
    log::debug,
    std::{
        sync::{
            Mutex, MutexGuard, PoisonError, TryLockError,
            atomic::{AtomicU32, AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    },
};

/// The peer's verdict on one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Accepted, optionally with response data.
    Ack(Option<Vec<u8>>),
    /// Rejected or corrupted; worth another attempt.
    Nack(String),
    /// Nothing arrived within the attempt timeout.
    Silent,
}

/// Per-connector exchange gate and timing.
#[derive(Debug)]
pub struct Correlator {
    guard: Mutex<()>,
    multiplier_bits: AtomicU64,
    bitrate: AtomicU32,
    min_packet_timeout: Duration,
}

impl Correlator {
    /// Create a correlator for a link running at `bitrate` bits/s.
    pub fn new(config: &LinkConfig, bitrate: u32) -> Self {
        Self {
            guard: Mutex::new(()),
            multiplier_bits: AtomicU64::new(config.timeout_multiplier.to_bits()),
            bitrate: AtomicU32::new(bitrate.max(1)),
            min_packet_timeout: config.min_packet_timeout,
        }
    }

    /// Update the link speed.
    pub fn set_bitrate(&self, bitrate: u32) {
        self.bitrate.store(bitrate.max(1), Ordering::SeqCst);
    }

    /// Current timeout multiplier.
    pub fn multiplier(&self) -> f64 {
        f64::from_bits(self.multiplier_bits.load(Ordering::SeqCst))
    }

    fn set_multiplier(&self, value: f64) {
        self.multiplier_bits.store(value.to_bits(), Ordering::SeqCst);
    }

    /// Scale timeouts by `factor` until the returned guard drops.
    pub fn boost_timeouts(&self, factor: f64) -> TimeoutBoost<'_> {
        let previous = self.multiplier();
        self.set_multiplier(previous * factor);
        debug!("timeout multiplier {previous} -> {}", previous * factor);
        TimeoutBoost {
            correlator: self,
            previous,
        }
    }

    /// Timeout of one attempt carrying `len` bytes:
    /// `max(len * 8000 * multiplier / bitrate, min_packet_timeout)` ms.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn attempt_timeout(&self, len: usize) -> Duration {
        let bitrate = f64::from(self.bitrate.load(Ordering::SeqCst));
        let millis = (len as f64) * 8000.0 * self.multiplier() / bitrate;
        Duration::from_millis(millis.ceil() as u64).max(self.min_packet_timeout)
    }

    /// Take the write guard, waiting if another exchange holds it.
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        match self.guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("exchange in flight, waiting for the write guard");
                self.guard
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
            },
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        }
    }

    /// Hold the write guard across several exchanges, for example a write
    /// and the read of its response.
    pub fn exclusive(&self) -> Exclusive<'_> {
        Exclusive {
            correlator: self,
            _guard: self.acquire(),
        }
    }

    /// Run one exchange under a freshly taken write guard.
    ///
    /// See [`Exclusive::initiate`].
    pub fn initiate<F>(
        &self,
        channel: Channel,
        payload: &[u8],
        max_retries: u32,
        budget: Duration,
        attempt: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(Duration) -> Result<Reply>,
    {
        self.exclusive()
            .initiate(channel, payload, max_retries, budget, attempt)
    }

    fn drive_exchange<F>(
        &self,
        channel: Channel,
        payload: &[u8],
        max_retries: u32,
        budget: Duration,
        mut attempt: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(Duration) -> Result<Reply>,
    {
        let started = Instant::now();
        let per_attempt = self.attempt_timeout(payload.len());

        let mut policy = RetryPolicy::new(max_retries, Duration::ZERO);
        if !budget.is_zero() {
            policy = policy.with_budget(budget);
        }

        debug!(
            "exchange on {channel:?}: {} bytes, {} retries, {per_attempt:?} per attempt",
            payload.len(),
            max_retries
        );

        let outcome = policy.drive(|info| {
            let timeout = info
                .remaining
                .map_or(per_attempt, |remaining| per_attempt.min(remaining));
            match attempt(timeout) {
                Ok(Reply::Ack(data)) => Attempt::Done(data),
                Ok(Reply::Nack(reason)) => Attempt::Retry {
                    charge: per_attempt,
                    error: Error::Protocol(reason),
                },
                Ok(Reply::Silent) => Attempt::Abort(Error::ResponseTimeout {
                    elapsed_ms: elapsed_ms(started),
                }),
                Err(e) if e.is_retryable() => Attempt::Retry {
                    charge: per_attempt,
                    error: e,
                },
                Err(e) => Attempt::Abort(e),
            }
        });

        outcome.map_err(|err| match err {
            RetryError::Exhausted { attempts, .. } => Error::WriteFailed { attempts },
            RetryError::BudgetSpent { .. } => Error::ResponseTimeout {
                elapsed_ms: elapsed_ms(started),
            },
            RetryError::Aborted(e) => e,
        })
    }
}

/// The write guard of a [`Correlator`], held until dropped.
#[derive(Debug)]
pub struct Exclusive<'a> {
    correlator: &'a Correlator,
    _guard: MutexGuard<'a, ()>,
}

impl Exclusive<'_> {
    /// Run one exchange while the guard is held.
    ///
    /// `attempt` is called with the timeout for that attempt. A nack costs
    /// one retry and one attempt timeout from `budget`; running out of
    /// retries fails with [`Error::WriteFailed`], running out of budget or
    /// hearing nothing fails with [`Error::ResponseTimeout`]. Errors that
    /// cannot improve on retry abort the exchange unchanged.
    pub fn initiate<F>(
        &self,
        channel: Channel,
        payload: &[u8],
        max_retries: u32,
        budget: Duration,
        attempt: F,
    ) -> Result<Option<Vec<u8>>>
    where
        F: FnMut(Duration) -> Result<Reply>,
    {
        self.correlator
            .drive_exchange(channel, payload, max_retries, budget, attempt)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Restores the timeout multiplier on drop.
#[derive(Debug)]
pub struct TimeoutBoost<'a> {
    correlator: &'a Correlator,
    previous: f64,
}

impl Drop for TimeoutBoost<'_> {
    fn drop(&mut self) {
        self.correlator.set_multiplier(self.previous);
    }
}
