pub mod file;
pub mod host;

use core::ops::Range;
use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::vec::Vec;

use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

use crate::flash::{ERASED, FlashDevice, LockGranularity};
use crate::report::Diagnostics;

pub use file::MockFile;
pub use host::{HostReply, MockClock, MockHostLink};

pub const PAGE_SIZE: u32 = 256;

/// Start of the application region; everything below belongs to the updater.
pub const REGION_START: u32 = 0x1000;

const MEMORY_SIZE: u32 = 0x2000;

/// Mutating operations on the mock flash, in order of invocation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operation {
    Unlock(u32),
    Lock(u32),
    Erase(u32),
    Write(u32),
}

/// Counts invocations of the erase primitive per sector.
#[derive(Debug)]
pub struct WearTracker(BTreeMap<u32, usize>);

impl WearTracker {
    pub const fn new() -> Self {
        WearTracker(BTreeMap::new())
    }

    pub fn increase(&mut self, sector: u32) {
        *self.0.entry(sector).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

/// NOR flash in memory: erasing sets bits, writing can only clear them.
///
/// Sectors grow from 512 bytes at the region start to 2K, like parts with small boot sectors.
pub struct MockFlash {
    memory: Vec<u8>,
    locked: Vec<bool>,
    granularity: LockGranularity,
    log: Vec<Operation>,
    pub wear: WearTracker,
    pub fail_unlocks: usize,
    pub fail_locks: usize,
    pub fail_erases: usize,
    /// Erases that report success but leave the memory untouched.
    pub ineffective_erases: usize,
    pub fail_writes: usize,
    pub fail_reads: usize,
    /// Writes that report success but leave the first byte erased.
    pub corrupt_writes: usize,
}

fn take(counter: &mut usize) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

impl MockFlash {
    pub fn new() -> Self {
        MockFlash {
            memory: std::vec![ERASED; MEMORY_SIZE as usize],
            locked: std::vec![false; (MEMORY_SIZE / PAGE_SIZE) as usize],
            granularity: LockGranularity::Page,
            log: Vec::new(),
            wear: WearTracker::new(),
            fail_unlocks: 0,
            fail_locks: 0,
            fail_erases: 0,
            ineffective_erases: 0,
            fail_writes: 0,
            fail_reads: 0,
            corrupt_writes: 0,
        }
    }

    /// Start out write protected, as flash holding a running application is.
    pub fn locked(mut self) -> Self {
        self.locked.fill(true);
        self
    }

    pub fn with_granularity(mut self, granularity: LockGranularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Pre-existing contents, like the application being replaced.
    pub fn with_contents(mut self, address: u32, contents: &[u8]) -> Self {
        let start = address as usize;
        self.memory[start..start + contents.len()].copy_from_slice(contents);
        self
    }

    pub fn end(&self) -> u32 {
        MEMORY_SIZE
    }

    pub fn poke(&mut self, address: u32, value: u8) {
        self.memory[address as usize] = value;
    }

    pub fn peek(&self, address: u32, len: usize) -> &[u8] {
        &self.memory[address as usize..address as usize + len]
    }

    pub fn erase_count(&self) -> usize {
        self.wear.total()
    }

    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    pub fn all_locked(&self, range: Range<u32>) -> bool {
        self.pages(range).all(|page| self.locked[page])
    }

    fn pages(&self, range: Range<u32>) -> Range<usize> {
        (range.start / PAGE_SIZE) as usize..range.end.div_ceil(PAGE_SIZE) as usize
    }

    fn check(&self, offset: u32, len: usize) -> Result<Range<usize>, NorFlashErrorKind> {
        let start = offset as usize;
        let end = start + len;
        if end > self.memory.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        if self.pages(offset..end as u32).any(|page| self.locked[page]) {
            return Err(NorFlashErrorKind::Other);
        }
        Ok(start..end)
    }

    fn set_lock(&mut self, range: Range<u32>, locked: bool) {
        let pages = match self.granularity {
            LockGranularity::Page => self.pages(range),
            LockGranularity::Region => 0..self.locked.len(),
        };
        self.locked[pages].fill(locked);
    }
}

impl ErrorType for MockFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MockFlash {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        if take(&mut self.fail_reads) {
            return Err(NorFlashErrorKind::Other);
        }
        let start = offset as usize;
        let source = self
            .memory
            .get(start..start + bytes.len())
            .ok_or(NorFlashErrorKind::OutOfBounds)?;
        bytes.copy_from_slice(source);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.memory.len()
    }
}

impl NorFlash for MockFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 512;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        let range = self.check(from, (to - from) as usize)?;
        self.log.push(Operation::Erase(from));
        self.wear.increase(from);

        if take(&mut self.fail_erases) {
            return Err(NorFlashErrorKind::Other);
        }
        if !take(&mut self.ineffective_erases) {
            self.memory[range].fill(ERASED);
        }
        Ok(())
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let range = self.check(offset, bytes.len())?;
        self.log.push(Operation::Write(offset));

        if take(&mut self.fail_writes) {
            return Err(NorFlashErrorKind::Other);
        }

        // A corrupt write leaves the first byte unprogrammed.
        let skip = usize::from(take(&mut self.corrupt_writes));
        for (cell, byte) in self.memory[range].iter_mut().zip(bytes).skip(skip) {
            *cell &= *byte;
        }
        Ok(())
    }
}

impl FlashDevice for MockFlash {
    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    fn sector_size_at(&self, address: u32) -> u32 {
        match address {
            a if a < REGION_START => REGION_START,
            a if a < REGION_START + 0x400 => 512,
            a if a < REGION_START + 0x800 => 1024,
            _ => 2048,
        }
    }

    fn lock_granularity(&self) -> LockGranularity {
        self.granularity
    }

    async fn unlock(&mut self, range: Range<u32>) -> Result<(), Self::Error> {
        self.log.push(Operation::Unlock(range.start));
        if take(&mut self.fail_unlocks) {
            return Err(NorFlashErrorKind::Other);
        }
        self.set_lock(range, false);
        Ok(())
    }

    async fn lock(&mut self, range: Range<u32>) -> Result<(), Self::Error> {
        self.log.push(Operation::Lock(range.start));
        if take(&mut self.fail_locks) {
            return Err(NorFlashErrorKind::Other);
        }
        self.set_lock(range, true);
        Ok(())
    }
}

/// Keeps every status line for inspection.
#[derive(Default)]
pub struct RecordingDiagnostics {
    pub messages: Vec<String>,
    pub ticks: usize,
}

impl RecordingDiagnostics {
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.iter().any(|m| m.contains(needle))
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn message(&mut self, text: &str) {
        self.messages.push(text.to_string());
    }

    fn tick(&mut self) {
        self.ticks += 1;
    }
}

/// Growable sink for status lines.
#[derive(Default)]
pub struct VecWriter(pub Vec<u8>);

impl embedded_io::ErrorType for VecWriter {
    type Error = core::convert::Infallible;
}

impl embedded_io::Write for VecWriter {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
