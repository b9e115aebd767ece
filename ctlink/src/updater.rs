//! Firmware update sequencing.
//!
//! A session walks `RESET -> BEGIN -> WRITE* -> END -> REBOOT_REQUEST` with
//! one exchange per step. Any failed step abandons the session; a new update
//! starts again from `RESET`.

use {
    crate::{
        engine::LinkContext,
        error::{Error, Result},
        event::{ConnectorEvent, EventBus, OtaStatus},
        protocol::OtaCommand,
    },
    log::{debug, info, warn},
    std::{
        sync::Arc,
        thread,
        time::{Duration, Instant},
    },
};

/// Step of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaPhase {
    /// Nothing sent yet.
    Idle,
    /// `RESET` acknowledged.
    Reset,
    /// `BEGIN` acknowledged.
    Begin,
    /// At least one `WRITE` acknowledged.
    Write,
    /// `END` acknowledged.
    End,
    /// `REBOOT_REQUEST` sent.
    RebootRequest,
}

impl OtaPhase {
    fn may_enter(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Reset)
                | (Self::Reset, Self::Begin)
                | (Self::Begin | Self::Write, Self::Write)
                | (Self::Write, Self::End)
                | (Self::End, Self::RebootRequest)
        )
    }
}

/// Progress in percent with two decimals: `floor(written * 10000 / total) / 100`.
#[allow(clippy::cast_precision_loss)]
pub fn progress_percent(written: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    ((written as u64 * 10000) / total as u64) as f64 / 100.0
}

/// State of one update.
#[derive(Debug)]
pub struct OtaSession {
    firmware: Arc<[u8]>,
    chunk_size: usize,
    written: usize,
    started: Instant,
    phase: OtaPhase,
}

impl OtaSession {
    /// Snapshot `firmware` for an update in `chunk_size` pieces.
    pub fn new(firmware: &[u8], chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 || chunk_size % 16 != 0 {
            return Err(Error::Config(format!(
                "OTA chunk size {chunk_size} is not a positive multiple of 16"
            )));
        }
        if firmware.is_empty() {
            return Err(Error::UpdateFailed("firmware image is empty".into()));
        }
        if u32::try_from(firmware.len()).is_err() {
            return Err(Error::UpdateFailed("firmware image exceeds 4 GiB".into()));
        }

        Ok(Self {
            firmware: Arc::from(firmware),
            chunk_size,
            written: 0,
            started: Instant::now(),
            phase: OtaPhase::Idle,
        })
    }

    /// Current phase.
    pub fn phase(&self) -> OtaPhase {
        self.phase
    }

    /// Bytes acknowledged so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Image length.
    pub fn total(&self) -> usize {
        self.firmware.len()
    }

    /// Current progress in percent.
    pub fn progress(&self) -> f64 {
        progress_percent(self.written, self.total())
    }

    /// Time since the session was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn advance(&mut self, next: OtaPhase) -> Result<()> {
        if !self.phase.may_enter(next) {
            return Err(Error::UpdateFailed(format!(
                "invalid transition {:?} -> {next:?}",
                self.phase
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// The command for the next step, or `None` once the reboot was sent.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_command(&self) -> Option<OtaCommand> {
        // Lengths were checked against u32 in new()
        let total = self.total() as u32;
        match self.phase {
            OtaPhase::Idle => Some(OtaCommand::Reset),
            OtaPhase::Reset => Some(OtaCommand::Begin { total_len: total }),
            OtaPhase::Begin | OtaPhase::Write if self.written < self.total() => {
                let end = (self.written + self.chunk_size).min(self.total());
                Some(OtaCommand::Write {
                    offset: self.written as u32,
                    data: self.firmware[self.written..end].to_vec(),
                })
            },
            OtaPhase::Begin | OtaPhase::Write => Some(OtaCommand::End {
                written: self.written as u32,
            }),
            OtaPhase::End => Some(OtaCommand::RebootRequest),
            OtaPhase::RebootRequest => None,
        }
    }

    /// Record that `command` was acknowledged.
    pub fn complete(&mut self, command: &OtaCommand) -> Result<()> {
        match command {
            OtaCommand::Reset => self.advance(OtaPhase::Reset),
            OtaCommand::Begin { .. } => self.advance(OtaPhase::Begin),
            OtaCommand::Write { offset, data } => {
                if *offset as usize != self.written {
                    return Err(Error::UpdateFailed(format!(
                        "write at {offset} while {} bytes are written",
                        self.written
                    )));
                }
                self.advance(OtaPhase::Write)?;
                self.written += data.len();
                Ok(())
            },
            OtaCommand::End { .. } => {
                if self.written != self.total() {
                    return Err(Error::UpdateFailed(format!(
                        "end after {} of {} bytes",
                        self.written,
                        self.total()
                    )));
                }
                self.advance(OtaPhase::End)
            },
            OtaCommand::RebootRequest => self.advance(OtaPhase::RebootRequest),
        }
    }
}

/// Drives update sessions over any exchange function.
#[derive(Debug, Clone)]
pub struct OtaSequencer {
    chunk_size: usize,
    erase_delay: Duration,
    write_pacing: Duration,
}

impl OtaSequencer {
    /// Sequencer sending `chunk_size`-byte writes.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            erase_delay: Duration::ZERO,
            write_pacing: Duration::ZERO,
        }
    }

    /// Pause after `BEGIN` and between writes.
    #[must_use]
    pub fn with_pacing(mut self, erase_delay: Duration, write_pacing: Duration) -> Self {
        self.erase_delay = erase_delay;
        self.write_pacing = write_pacing;
        self
    }

    /// Sequencer configured from the context's pacing settings.
    pub fn from_context(ctx: &LinkContext, chunk_size: usize) -> Self {
        let config = ctx.config();
        Self::new(chunk_size).with_pacing(config.ota_erase_delay, config.ota_write_pacing)
    }

    /// Run a full session.
    ///
    /// `exchange` performs one acknowledged exchange per command. Emits
    /// `ota_status` and progress events on `events`.
    pub fn run<F>(
        &self,
        firmware: &[u8],
        ctx: &LinkContext,
        events: &EventBus,
        mut exchange: F,
    ) -> Result<()>
    where
        F: FnMut(&OtaCommand) -> Result<()>,
    {
        events.emit(ConnectorEvent::OtaStatus(OtaStatus::Begin));
        match self.drive(firmware, ctx, events, &mut exchange) {
            Ok(session) => {
                info!(
                    "firmware update finished: {} bytes in {:.1}s",
                    session.total(),
                    session.elapsed().as_secs_f64()
                );
                events.emit(ConnectorEvent::OtaStatus(OtaStatus::Success));
                Ok(())
            },
            Err(e) => {
                warn!("firmware update failed: {e}");
                events.emit(ConnectorEvent::OtaStatus(OtaStatus::Fail));
                Err(match e {
                    // Cancellation surfaces as `Interrupted`
                    Error::Interrupted | Error::UpdateFailed(_) => e,
                    other => Error::UpdateFailed(other.to_string()),
                })
            },
        }
    }

    fn drive<F>(
        &self,
        firmware: &[u8],
        ctx: &LinkContext,
        events: &EventBus,
        exchange: &mut F,
    ) -> Result<OtaSession>
    where
        F: FnMut(&OtaCommand) -> Result<()>,
    {
        let mut session = OtaSession::new(firmware, self.chunk_size)?;
        info!(
            "firmware update: {} bytes in {}-byte chunks",
            session.total(),
            self.chunk_size
        );

        while let Some(command) = session.next_command() {
            ctx.check_interrupted()?;

            if command == OtaCommand::RebootRequest {
                // The controller may reboot before answering
                if let Err(e) = exchange(&command) {
                    debug!("reboot request unanswered: {e}");
                }
                session.complete(&command)?;
                continue;
            }

            exchange(&command)?;
            session.complete(&command)?;

            match command {
                OtaCommand::Begin { .. } if !self.erase_delay.is_zero() => {
                    thread::sleep(self.erase_delay);
                },
                OtaCommand::Write { .. } => {
                    let progress = session.progress();
                    debug!("firmware update progress {progress:.2}%");
                    events.emit(ConnectorEvent::OtaProgress(progress));
                    if !self.write_pacing.is_zero() {
                        thread::sleep(self.write_pacing);
                    }
                },
                _ => {},
            }
        }

        Ok(session)
    }
}
