//! Program flash region management.
//!
//! Wraps the raw [`FlashDevice`] primitives with the guarantees the updater relies upon:
//! erasing is idempotent, every page write is read back and compared, and addresses never leave the region.

use core::ops::Range;

use embedded_storage_async::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use crate::{Error, checksum};

/// Value of every byte of erased flash.
pub const ERASED: u8 = 0xFF;

/// Bytes read at once when comparing or checksumming flash contents.
const CHUNK: usize = 64;

/// Granularity at which a device locks and unlocks its memory.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LockGranularity {
    /// Every page has to be (un)locked individually.
    Page,
    /// The whole region can be (un)locked with a single call.
    Region,
}

/// Flash controller capable of programming the application image.
///
/// The [`NorFlash`] supertrait provides reading, erasing and writing in terms of offsets from the start of the device.
/// All other methods, and all of [`FlashManager`], work with absolute memory addresses.
/// [`FlashDevice::base_address`] relates the two.
#[allow(async_fn_in_trait)]
pub trait FlashDevice: NorFlash {
    /// Memory address at which offset `0` of the device is mapped.
    fn base_address(&self) -> u32 {
        0
    }

    /// Smallest unit that can be programmed in one operation.
    fn page_size(&self) -> u32;

    /// Size of the erasable sector starting at `address`.
    ///
    /// Some devices have a few small sectors at the start, and larger ones thereafter.
    fn sector_size_at(&self, address: u32) -> u32 {
        let _ = address;
        Self::ERASE_SIZE as u32
    }

    fn lock_granularity(&self) -> LockGranularity {
        LockGranularity::Page
    }

    /// Remove write protection from `range`.
    ///
    /// Devices with coarse lock regions may round the range outwards.
    async fn unlock(&mut self, range: Range<u32>) -> Result<(), Self::Error>;

    /// Restore write protection on `range`.
    async fn lock(&mut self, range: Range<u32>) -> Result<(), Self::Error>;
}

/// Contiguous part of program memory that holds the application image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashRegion {
    start: u32,
    end: u32,
}

impl FlashRegion {
    /// Region spanning `start..end`, in absolute addresses.
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub const fn start(&self) -> u32 {
        self.start
    }

    pub const fn end(&self) -> u32 {
        self.end
    }

    /// Capacity of the region in bytes.
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn contains(&self, address: u32) -> bool {
        self.start <= address && address < self.end
    }
}

/// Failure of a single flash operation.
///
/// All of these are considered transient by the updater, and are retried.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    Unlock,
    Lock,
    Erase,
    /// The sector still contains programmed bytes after erasing it.
    NotErased,
    Write,
    /// Reading back a freshly written page yielded different contents.
    Verify,
    Read,
    /// The operation would touch memory outside of the region.
    OutOfRange,
}

impl core::fmt::Display for FlashError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            FlashError::Unlock => "unlock failed",
            FlashError::Lock => "lock failed",
            FlashError::Erase => "erase failed",
            FlashError::NotErased => "sector not erased",
            FlashError::Write => "write failed",
            FlashError::Verify => "verification failed",
            FlashError::Read => "read failed",
            FlashError::OutOfRange => "address out of range",
        })
    }
}

/// Log the device error behind a failed `operation`, then yield the operation.
fn failed<E: NorFlashError>(operation: FlashError, offset: u32) -> impl FnOnce(E) -> FlashError {
    move |e| {
        let kind = match e.kind() {
            NorFlashErrorKind::NotAligned => "not aligned",
            NorFlashErrorKind::OutOfBounds => "out of bounds",
            _ => "other",
        };
        warn!("{} at offset {=u32:#x}: {=str}", operation, offset, kind);
        operation
    }
}

/// Exclusive owner of the flash region during an update.
pub struct FlashManager<F> {
    device: F,
    region: FlashRegion,
}

impl<F: FlashDevice> FlashManager<F> {
    /// Take ownership of `device` for programming `region`.
    ///
    /// The region has to start and end on page boundaries, and its sectors have to tile it exactly.
    pub fn new(device: F, region: FlashRegion) -> Result<Self, Error> {
        let page_size = device.page_size();
        let base = device.base_address();

        if page_size == 0
            || region.is_empty()
            || region.start < base
            || (region.start - base) % page_size != 0
            || (region.end - base) % page_size != 0
        {
            return Err(Error::PageMisaligned);
        }

        let mut address = region.start;
        while address < region.end {
            let sector_size = device.sector_size_at(address);
            if sector_size == 0 || sector_size % page_size != 0 {
                return Err(Error::SectorMisaligned);
            }
            address = address.checked_add(sector_size).ok_or(Error::SectorMisaligned)?;
        }
        if address != region.end {
            return Err(Error::SectorMisaligned);
        }

        Ok(Self { device, region })
    }

    pub fn region(&self) -> FlashRegion {
        self.region
    }

    pub fn page_size(&self) -> u32 {
        self.device.page_size()
    }

    pub fn sector_size_at(&self, address: u32) -> u32 {
        self.device.sector_size_at(address)
    }

    pub fn lock_granularity(&self) -> LockGranularity {
        self.device.lock_granularity()
    }

    pub fn device(&self) -> &F {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut F {
        &mut self.device
    }

    pub fn release(self) -> F {
        self.device
    }

    fn check_range(&self, address: u32, size: u32) -> Result<u32, FlashError> {
        let end = address.checked_add(size).ok_or(FlashError::OutOfRange)?;
        if address < self.region.start || end > self.region.end {
            return Err(FlashError::OutOfRange);
        }
        Ok(address - self.device.base_address())
    }

    pub async fn unlock(&mut self, range: Range<u32>) -> Result<(), FlashError> {
        let start = range.start;
        self.device.unlock(range).await.map_err(failed(FlashError::Unlock, start))
    }

    pub async fn lock(&mut self, range: Range<u32>) -> Result<(), FlashError> {
        let start = range.start;
        self.device.lock(range).await.map_err(failed(FlashError::Lock, start))
    }

    /// Whether every byte in `address..address + size` reads as [`ERASED`].
    pub async fn is_erased(&mut self, address: u32, size: u32) -> Result<bool, FlashError> {
        let mut offset = self.check_range(address, size)?;
        let end = offset + size;
        let mut buffer = [0u8; CHUNK];

        while offset < end {
            let len = (end - offset).min(CHUNK as u32) as usize;
            let chunk = &mut buffer[..len];
            self.device
                .read(offset, chunk)
                .await
                .map_err(failed(FlashError::Read, offset))?;

            if chunk.iter().any(|b| *b != ERASED) {
                return Ok(false);
            }
            offset += len as u32;
        }

        Ok(true)
    }

    /// Erase the sector starting at `address`, returning its size.
    ///
    /// A sector that already reads as erased is left alone.
    /// Either way the sector is checked afterwards,
    /// and [`FlashError::NotErased`] is returned if any byte is still programmed.
    pub async fn erase_sector(&mut self, address: u32) -> Result<u32, FlashError> {
        let size = self.device.sector_size_at(address);
        let offset = self.check_range(address, size)?;

        if self.is_erased(address, size).await? {
            trace!("sector {=u32:#x} already erased", address);
        } else {
            self.device
                .erase(offset, offset + size)
                .await
                .map_err(failed(FlashError::Erase, offset))?;
        }

        if self.is_erased(address, size).await? {
            Ok(size)
        } else {
            Err(FlashError::NotErased)
        }
    }

    /// Program `data` at `address` and compare the result byte for byte.
    pub async fn write_page(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let offset = self.check_range(address, data.len() as u32)?;

        self.device
            .write(offset, data)
            .await
            .map_err(failed(FlashError::Write, offset))?;

        let mut buffer = [0u8; CHUNK];
        for (i, expected) in data.chunks(CHUNK).enumerate() {
            let actual = &mut buffer[..expected.len()];
            let chunk_offset = offset + (i * CHUNK) as u32;
            self.device
                .read(chunk_offset, actual)
                .await
                .map_err(failed(FlashError::Read, chunk_offset))?;

            if actual != expected {
                return Err(FlashError::Verify);
            }
        }

        Ok(())
    }

    /// CRC16 over `length` bytes of flash starting at the region start.
    pub async fn checksum(&mut self, length: u32) -> Result<u16, FlashError> {
        let mut offset = self.check_range(self.region.start, length)?;
        let end = offset + length;
        let mut buffer = [0u8; CHUNK];
        let mut digest = checksum::crc16_digest();

        while offset < end {
            let len = (end - offset).min(CHUNK as u32) as usize;
            let chunk = &mut buffer[..len];
            self.device
                .read(offset, chunk)
                .await
                .map_err(failed(FlashError::Read, offset))?;
            digest.update(chunk);
            offset += len as u32;
        }

        Ok(digest.finalize())
    }

    /// Store `message` at the very start of the region, for post-mortem inspection.
    ///
    /// Destroys the first sector. `scratch` must hold at least one page.
    pub async fn persist_message(&mut self, message: &str, scratch: &mut [u8]) -> Result<(), FlashError> {
        let start = self.region.start;
        let page_size = self.page_size();
        let sector_size = self.sector_size_at(start);
        let page = scratch
            .get_mut(..page_size as usize)
            .ok_or(FlashError::OutOfRange)?;

        let len = message.len().min(page.len());
        page.fill(ERASED);
        page[..len].copy_from_slice(&message.as_bytes()[..len]);

        self.unlock(start..start + sector_size).await?;
        self.erase_sector(start).await?;
        self.write_page(start, page).await
    }
}
