//! Clock synchronisation.
//!
//! Clock reads and writes are retried with the configured policy (three
//! attempts, one second apart by default). Controllers can also push clock
//! samples unprompted; a [`ClockSlot`] decides whether a sample answers a
//! pending read or must be forwarded to the engine.

use {
    crate::{
        error::{Error, ErrorCategory, Result},
        protocol::ClockSample,
        retry::{RetryError, RetryPolicy},
    },
    log::{debug, warn},
    std::{
        sync::{
            Mutex, PoisonError,
            mpsc::{self, Receiver, Sender},
        },
        time::Instant,
    },
};

/// A millisecond clock that can be set and keeps running.
#[derive(Debug)]
pub struct LogicalClock {
    anchor: Mutex<(Instant, u64)>,
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl LogicalClock {
    /// Start the clock at `millis`.
    pub fn new(millis: u64) -> Self {
        Self {
            anchor: Mutex::new((Instant::now(), millis)),
        }
    }

    /// Current value.
    #[allow(clippy::cast_possible_truncation)]
    pub fn millis(&self) -> u64 {
        let anchor = self
            .anchor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        anchor.1 + anchor.0.elapsed().as_millis() as u64
    }

    /// Jump to `millis`.
    pub fn set_millis(&self, millis: u64) {
        let mut anchor = self
            .anchor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *anchor = (Instant::now(), millis);
    }
}

fn settle(err: RetryError, permanent: Error) -> Error {
    match err {
        RetryError::Aborted(e)
            if matches!(e, Error::Interrupted)
                || e.category() == ErrorCategory::Connection =>
        {
            e
        },
        other => {
            if let Some(last) = other.into_last_error() {
                warn!("{permanent}: {last}");
            }
            permanent
        },
    }
}

/// Write the clock with retries; fails with [`Error::ClockWriteFailed`].
pub fn write_clock<F>(policy: &RetryPolicy, mut write: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    policy
        .run(|attempt| {
            debug!("clock write attempt {attempt}/{}", policy.attempts);
            write()
        })
        .map_err(|e| settle(e, Error::ClockWriteFailed))
}

/// Read the clock with retries; fails with [`Error::ClockReadFailed`].
pub fn read_clock<F>(policy: &RetryPolicy, mut read: F) -> Result<ClockSample>
where
    F: FnMut() -> Result<ClockSample>,
{
    policy
        .run(|attempt| {
            debug!("clock read attempt {attempt}/{}", policy.attempts);
            read()
        })
        .map_err(|e| settle(e, Error::ClockReadFailed))
}

/// Rendezvous between a pending clock read and incoming clock samples.
#[derive(Debug, Default)]
pub struct ClockSlot {
    waiting: Mutex<Option<Sender<ClockSample>>>,
}

impl ClockSlot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a clock response.
    pub fn begin(&self) -> Receiver<ClockSample> {
        let (tx, rx) = mpsc::channel();
        *self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Stop waiting.
    pub fn finish(&self) {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Whether a read is waiting.
    pub fn is_waiting(&self) -> bool {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Offer an incoming sample.
    ///
    /// Returns the sample back when nobody is waiting, meaning it was an
    /// unsolicited push.
    pub fn offer(&self, sample: ClockSample) -> Option<ClockSample> {
        let mut waiting = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match waiting.take() {
            Some(tx) => match tx.send(sample) {
                Ok(()) => None,
                Err(returned) => Some(returned.0),
            },
            None => Some(sample),
        }
    }
}
