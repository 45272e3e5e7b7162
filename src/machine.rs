//! The update state machine.
//!
//! An [`Updater`] walks the flash region four times: unlocking, erasing, writing and finally locking it again.
//! Every call to [`Updater::step`] performs at most one hardware operation on one page or sector,
//! so that the loop driving it can service a watchdog in between.

use core::ops::ControlFlow;
use core::task::Poll;

use crate::Error;
use crate::flash::{FlashDevice, FlashError, FlashManager, FlashRegion, LockGranularity};
use crate::report::{Diagnostics, Message, Progress, format_message};
use crate::restart::{Restart, RestartMode};
use crate::source::{Acknowledgement, BlockRequest, BlockSource, ChecksumRecord, Fetch, SourceError, TransferBlock};

/// Phase of the update. The order of the variants is the order in which they are passed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProgramState {
    Initializing,
    UnlockingFlash,
    ErasingFlash,
    WritingUpgrade,
    VerifyingChecksum,
    SendingChecksumOk,
    SendingChecksumError,
    LockingFlash,
}

impl core::fmt::Display for ProgramState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ProgramState::Initializing => "Initializing",
            ProgramState::UnlockingFlash => "UnlockingFlash",
            ProgramState::ErasingFlash => "ErasingFlash",
            ProgramState::WritingUpgrade => "WritingUpgrade",
            ProgramState::VerifyingChecksum => "VerifyingChecksum",
            ProgramState::SendingChecksumOk => "SendingChecksumOk",
            ProgramState::SendingChecksumError => "SendingChecksumError",
            ProgramState::LockingFlash => "LockingFlash",
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Consecutive failures of a single step that are retried.
    pub max_retries: u8,
    /// Report progress every this many percent.
    pub progress_increment: u8,
    /// Times the image is written again after the host rejected its checksum.
    pub max_rewrites: u8,
}

impl Config {
    pub const fn new() -> Self {
        Self {
            max_retries: 5,
            progress_increment: 20,
            max_rewrites: 3,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures of the step currently attempted.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryCounter {
    count: u8,
    max: u8,
}

impl RetryCounter {
    pub const fn new(max: u8) -> Self {
        Self { count: 0, max }
    }

    pub fn get(&self) -> u8 {
        self.count
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// Count another failure, yielding the retry number if the step may be attempted again.
    ///
    /// Once exhausted the count stays at the maximum.
    pub fn fail(&mut self) -> Option<u8> {
        if self.count >= self.max {
            None
        } else {
            self.count += 1;
            Some(self.count)
        }
    }
}

/// Reason the update was abandoned.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fatal {
    RetriesExhausted { state: ProgramState, retries: u8 },
    Source(SourceError),
    ChecksumTimeout,
    AcknowledgementTimeout,
    ImageRejected { rewrites: u8 },
    /// The source kept delivering data after the region was full.
    ImageTooBig,
}

impl core::fmt::Display for Fatal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fatal::RetriesExhausted { state, retries } => {
                write!(f, "Operation {state} failed after {retries} retries")
            }
            Fatal::Source(e) => write!(f, "{e}"),
            Fatal::ChecksumTimeout => f.write_str("Timeout while waiting for checksum"),
            Fatal::AcknowledgementTimeout => f.write_str("Timeout while reporting CRC error"),
            Fatal::ImageRejected { rewrites } => {
                write!(f, "CRC mismatch after {rewrites} rewrites")
            }
            Fatal::ImageTooBig => f.write_str("Image does not fit in flash"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// The new image is written, verified and locked.
    Updated,
    Failed(Fatal),
}

impl Outcome {
    pub fn restart_mode(&self) -> RestartMode {
        match self {
            Outcome::Updated => RestartMode::Firmware,
            Outcome::Failed(_) => RestartMode::Recovery,
        }
    }
}

enum Failure {
    Flash(FlashError),
    Source(SourceError),
    Fatal(Fatal),
}

impl From<FlashError> for Failure {
    fn from(e: FlashError) -> Self {
        Failure::Flash(e)
    }
}

impl From<SourceError> for Failure {
    fn from(e: SourceError) -> Self {
        if e.is_fatal() {
            Failure::Fatal(Fatal::Source(e))
        } else {
            Failure::Source(e)
        }
    }
}

impl From<Fatal> for Failure {
    fn from(e: Fatal) -> Self {
        Failure::Fatal(e)
    }
}

enum Flow {
    Continue,
    Done,
}

/// Replaces the contents of a flash region with an image from a [`BlockSource`].
///
/// Blocks of `N` bytes are fetched from the source and written one page at a time.
pub struct Updater<F, S, D, const N: usize> {
    flash: FlashManager<F>,
    source: S,
    diagnostics: D,
    config: Config,
    state: ProgramState,
    cursor: u32,
    retry: RetryCounter,
    block: TransferBlock<N>,
    /// `block` holds data that is not completely written yet.
    buffered: bool,
    /// `block` is the last block of the image.
    last_block: bool,
    /// Checksum received from the host, kept while the comparison is retried.
    checksum: Option<ChecksumRecord>,
    rewrites: u8,
    progress: Progress,
    last_message: Message,
}

impl<F, S, D, const N: usize> Updater<F, S, D, N>
where
    F: FlashDevice,
    S: BlockSource<N>,
    D: Diagnostics,
{
    pub fn new(device: F, region: FlashRegion, source: S, diagnostics: D, config: Config) -> Result<Self, Error> {
        let flash = FlashManager::new(device, region)?;

        let page_size = flash.page_size() as usize;
        if N == 0 || N % page_size != 0 {
            return Err(Error::BlockSize);
        }

        Ok(Self {
            flash,
            source,
            diagnostics,
            config,
            state: ProgramState::Initializing,
            cursor: region.start(),
            retry: RetryCounter::new(config.max_retries),
            block: TransferBlock::new(),
            buffered: false,
            last_block: false,
            checksum: None,
            rewrites: 0,
            progress: Progress::new(config.progress_increment),
            last_message: Message::new(),
        })
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    /// Address of the page or sector the next step operates on.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn retries(&self) -> u8 {
        self.retry.get()
    }

    pub fn flash(&self) -> &FlashManager<F> {
        &self.flash
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn diagnostics(&self) -> &D {
        &self.diagnostics
    }

    /// The most recent status message.
    pub fn last_message(&self) -> &str {
        &self.last_message
    }

    /// Advance the update by a single operation.
    ///
    /// Breaks once the update is finished, after which the device must be restarted.
    pub async fn step(&mut self) -> ControlFlow<Outcome> {
        self.diagnostics.tick();

        if self.state == ProgramState::Initializing {
            self.enter(ProgramState::UnlockingFlash);
        }

        let result = match self.state {
            ProgramState::Initializing | ProgramState::UnlockingFlash => self.unlock().await,
            ProgramState::ErasingFlash => self.erase().await,
            ProgramState::WritingUpgrade => self.write().await,
            ProgramState::VerifyingChecksum => self.verify_checksum().await,
            ProgramState::SendingChecksumOk => self.send_checksum_ok(),
            ProgramState::SendingChecksumError => self.send_checksum_error(),
            ProgramState::LockingFlash => self.lock().await,
        };

        match result {
            Ok(Flow::Continue) => ControlFlow::Continue(()),
            Ok(Flow::Done) => {
                info!("update complete");
                self.report(format_args!("Update successful! Rebooting..."));
                ControlFlow::Break(Outcome::Updated)
            }
            Err(Failure::Fatal(fatal)) => self.abort(fatal).await,
            Err(failure) => match self.retry.fail() {
                Some(retry) => {
                    self.retrying(&failure, retry);
                    ControlFlow::Continue(())
                }
                None => {
                    let fatal = Fatal::RetriesExhausted {
                        state: self.state,
                        retries: self.retry.get(),
                    };
                    self.abort(fatal).await
                }
            },
        }
    }

    /// Step until the update is finished.
    pub async fn complete(&mut self) -> Outcome {
        loop {
            if let ControlFlow::Break(outcome) = self.step().await {
                return outcome;
            }
        }
    }

    fn report(&mut self, args: core::fmt::Arguments<'_>) {
        self.last_message = format_message(args);
        self.diagnostics.message(&self.last_message);
    }

    fn enter(&mut self, state: ProgramState) {
        debug!("{} -> {} at {=u32:#x}", self.state, state, self.cursor);
        self.state = state;
        self.retry.clear();

        match state {
            ProgramState::UnlockingFlash => self.report(format_args!("Unlocking flash")),
            ProgramState::ErasingFlash => self.report(format_args!("Erasing flash")),
            ProgramState::WritingUpgrade => self.report(format_args!("Writing data")),
            _ => {}
        }
    }

    fn retrying(&mut self, failure: &Failure, retry: u8) {
        match failure {
            Failure::Flash(e) => warn!("{} failed at {=u32:#x}: {}, retry {=u8}", self.state, self.cursor, e, retry),
            Failure::Source(e) => warn!("{} failed at {=u32:#x}: {}, retry {=u8}", self.state, self.cursor, e, retry),
            Failure::Fatal(_) => {}
        }

        match (self.state, failure) {
            (ProgramState::ErasingFlash, _) => self.report(format_args!("Erase retry #{retry}")),
            (ProgramState::WritingUpgrade, Failure::Flash(_)) => {
                self.report(format_args!("Flash write retry #{retry}"))
            }
            (ProgramState::WritingUpgrade, Failure::Source(SourceError::Io)) => {
                self.report(format_args!("Read file retry #{retry}"))
            }
            (ProgramState::WritingUpgrade, Failure::Source(_)) => {
                self.report(format_args!("Waiting for host, retry #{retry}"))
            }
            _ => {}
        }
    }

    async fn abort(&mut self, fatal: Fatal) -> ControlFlow<Outcome> {
        error!("aborting in {} at {=u32:#x}: {}", self.state, self.cursor, fatal);
        self.report(format_args!("ERROR: {fatal}"));

        // The old image is only damaged once writing started.
        if self.state >= ProgramState::WritingUpgrade {
            let message = self.last_message.clone();
            if self.flash.persist_message(&message, self.block.buffer_mut()).await.is_err() {
                warn!("could not persist error message");
            }
        }

        ControlFlow::Break(Outcome::Failed(fatal))
    }

    /// Unlock or lock the page at the cursor, or the whole region at once.
    ///
    /// Yields whether the end of the region was reached.
    async fn protect(&mut self, lock: bool) -> Result<bool, FlashError> {
        let region = self.flash.region();
        let range = match self.flash.lock_granularity() {
            LockGranularity::Page => self.cursor..self.cursor + self.flash.page_size(),
            LockGranularity::Region => region.start()..region.end(),
        };

        if lock {
            self.flash.lock(range.clone()).await?;
        } else {
            self.flash.unlock(range.clone()).await?;
        }

        self.cursor = range.end;
        self.retry.clear();
        Ok(self.cursor >= region.end())
    }

    async fn unlock(&mut self) -> Result<Flow, Failure> {
        if self.protect(false).await? {
            self.cursor = self.flash.region().start();
            self.enter(ProgramState::ErasingFlash);
        }
        Ok(Flow::Continue)
    }

    async fn erase(&mut self) -> Result<Flow, Failure> {
        let size = self.flash.erase_sector(self.cursor).await?;
        self.cursor += size;
        self.retry.clear();

        if self.cursor >= self.flash.region().end() {
            self.cursor = self.flash.region().start();
            self.buffered = false;
            self.enter(ProgramState::WritingUpgrade);
        }
        Ok(Flow::Continue)
    }

    async fn write(&mut self) -> Result<Flow, Failure> {
        let region = self.flash.region();

        if !self.buffered {
            let request = BlockRequest {
                address: self.cursor,
                offset: self.cursor - region.start(),
            };
            match self.source.next_block(request, &mut self.block).await? {
                Fetch::Pending => return Ok(Flow::Continue),
                Fetch::Ready => self.last_block = false,
                Fetch::EndOfImage => self.last_block = true,
            }
            trace!(
                "block for {=u32:#x}, {=usize} bytes, last {=bool}",
                self.cursor,
                self.block.valid(),
                self.last_block
            );
            self.retry.clear();

            if self.last_block && self.block.valid() == 0 {
                // Nothing but padding, the image ended with the previous block.
                self.finish_image();
                return Ok(Flow::Continue);
            }
            if self.cursor >= region.end() {
                return Err(Fatal::ImageTooBig.into());
            }
            self.buffered = true;
        }

        let page_size = self.flash.page_size();
        self.flash
            .write_page(self.cursor, self.block.pending(page_size as usize))
            .await?;
        self.block.advance(page_size as usize);
        self.cursor += page_size;
        self.retry.clear();
        self.show_progress();

        // Once the region is full the source is asked for one more block,
        // which has to be an empty end of image.
        let region_full = self.cursor >= region.end();
        if self.block.is_retired() || region_full {
            self.buffered = false;
            if region_full && self.block.written() < self.block.valid() {
                return Err(Fatal::ImageTooBig.into());
            }
            if self.last_block {
                self.finish_image();
            }
        }
        Ok(Flow::Continue)
    }

    fn show_progress(&mut self) {
        let region = self.flash.region();
        let total = self.source.image_size().unwrap_or(region.len());
        if let Some(percent) = self.progress.update(self.cursor - region.start(), total) {
            self.report(format_args!("Flashing firmware, {percent}% completed"));
        }
    }

    fn finish_image(&mut self) {
        match self.source.checksum_exchange() {
            Some(exchange) => {
                exchange.request_checksum();
                self.enter(ProgramState::VerifyingChecksum);
            }
            None => self.start_locking(),
        }
    }

    fn start_locking(&mut self) {
        self.cursor = self.flash.region().start();
        self.enter(ProgramState::LockingFlash);
    }

    async fn verify_checksum(&mut self) -> Result<Flow, Failure> {
        let record = match self.checksum {
            Some(record) => record,
            None => {
                let Some(exchange) = self.source.checksum_exchange() else {
                    self.start_locking();
                    return Ok(Flow::Continue);
                };
                match exchange.poll_checksum() {
                    Poll::Pending => return Ok(Flow::Continue),
                    Poll::Ready(Err(_)) => return Err(Fatal::ChecksumTimeout.into()),
                    Poll::Ready(Ok(record)) => {
                        self.checksum = Some(record);
                        record
                    }
                }
            }
        };

        let expected = record.crc16();
        let length = record.firmware_length();
        let computed = if length <= self.flash.region().len() {
            Some(self.flash.checksum(length).await?)
        } else {
            warn!("host claims {=u32} bytes, more than the region holds", length);
            None
        };
        self.checksum = None;

        let (acknowledgement, next) = if computed == Some(expected) {
            debug!("checksum {=u16:#x} over {=u32} bytes matches", expected, length);
            (Acknowledgement::Ok, ProgramState::SendingChecksumOk)
        } else {
            warn!("checksum mismatch, expected {=u16:#x}, computed {}", expected, computed);
            self.report(format_args!("CRC mismatch"));
            (Acknowledgement::ChecksumError, ProgramState::SendingChecksumError)
        };

        if let Some(exchange) = self.source.checksum_exchange() {
            exchange.send_acknowledgement(acknowledgement);
        }
        self.enter(next);
        Ok(Flow::Continue)
    }

    fn poll_acknowledgement(&mut self) -> Poll<Result<(), SourceError>> {
        match self.source.checksum_exchange() {
            Some(exchange) => exchange.poll_acknowledgement(),
            None => Poll::Ready(Ok(())),
        }
    }

    fn send_checksum_ok(&mut self) -> Result<Flow, Failure> {
        match self.poll_acknowledgement() {
            Poll::Pending => return Ok(Flow::Continue),
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => {
                // The image is verified, only the host missed the verdict.
                self.report(format_args!("Timeout while exchanging checksum acknowledgement"));
            }
        }
        self.start_locking();
        Ok(Flow::Continue)
    }

    fn send_checksum_error(&mut self) -> Result<Flow, Failure> {
        match self.poll_acknowledgement() {
            Poll::Pending => return Ok(Flow::Continue),
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(_)) => return Err(Fatal::AcknowledgementTimeout.into()),
        }

        if self.rewrites >= self.config.max_rewrites {
            return Err(Fatal::ImageRejected {
                rewrites: self.rewrites,
            }
            .into());
        }
        self.rewrites += 1;
        info!("writing image again, attempt {=u8}", self.rewrites);

        self.cursor = self.flash.region().start();
        self.buffered = false;
        self.enter(ProgramState::WritingUpgrade);
        Ok(Flow::Continue)
    }

    async fn lock(&mut self) -> Result<Flow, Failure> {
        if self.protect(true).await? {
            Ok(Flow::Done)
        } else {
            Ok(Flow::Continue)
        }
    }
}

/// Drive `updater` to the end and restart accordingly.
pub async fn run<F, S, D, R, const N: usize>(mut updater: Updater<F, S, D, N>, restart: &mut R) -> !
where
    F: FlashDevice,
    S: BlockSource<N>,
    D: Diagnostics,
    R: Restart,
{
    let outcome = updater.complete().await;
    restart.restart(outcome.restart_mode())
}
