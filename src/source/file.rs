//! Image read from a file on removable storage.
//!
//! Two layouts are supported, selected by the file name:
//! a raw image, copied to flash verbatim, and a UF2 file, of which only the record payloads are copied.

use embedded_io_async::{Read, Seek, SeekFrom};
use zerocopy::{FromZeros, IntoBytes};

use crate::flash::FlashRegion;
use crate::source::uf2::Uf2Record;
use crate::source::{BlockRequest, BlockSource, Fetch, SourceError, TransferBlock};

/// File name prefix the application writes in front of a handed-over file name.
pub const DEFAULT_PREFIX: &str = "0:/";

/// File flashed when the application did not hand over a name.
pub const DEFAULT_FILE_NAME: &str = "0:/firmware/firmware.bin";

/// Determine the file to flash from the bytes the application left for the updater.
///
/// The name is used only if it starts with `prefix`, is NUL terminated and is valid UTF-8.
/// Otherwise `default` is returned.
pub fn firmware_file_name<'a>(handoff: &'a [u8], prefix: &str, default: &'a str) -> &'a str {
    if !handoff.starts_with(prefix.as_bytes()) {
        return default;
    }

    handoff
        .iter()
        .position(|b| *b == 0)
        .and_then(|len| core::str::from_utf8(&handoff[..len]).ok())
        .unwrap_or(default)
}

/// On-disk representation of the image.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Layout {
    /// The file is the flash image, byte for byte.
    Raw,
    /// The file is a sequence of UF2 records.
    Uf2,
}

impl Layout {
    /// `.uf2` files (in any letter case) are UF2, everything else is raw.
    pub fn from_file_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let is_uf2 = bytes.len() >= 4 && bytes[bytes.len() - 4..].eq_ignore_ascii_case(b".uf2");

        if is_uf2 { Layout::Uf2 } else { Layout::Raw }
    }

    /// File bytes per image byte.
    pub const fn expansion(&self) -> u32 {
        match self {
            Layout::Raw => 1,
            Layout::Uf2 => (Uf2Record::SIZE / Uf2Record::PAYLOAD_SIZE) as u32,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OpenError {
    /// The image would not fit in the flash region.
    TooBig { size: u32, limit: u32 },
    /// A UF2 file that does not consist of whole records.
    Truncated { size: u32 },
}

impl core::fmt::Display for OpenError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            OpenError::TooBig { size, limit } => {
                write!(f, "file is too big ({size} bytes, limit {limit})")
            }
            OpenError::Truncated { size } => {
                write!(f, "file of {size} bytes is not a whole number of UF2 blocks")
            }
        }
    }
}

/// Block source reading an opened firmware file.
///
/// Every block is read starting with a seek, so retrying after a failed read continues at the right spot.
pub struct FileSource<F, const N: usize> {
    file: F,
    layout: Layout,
    file_size: u32,
    record: Uf2Record,
}

impl<F: Read + Seek, const N: usize> FileSource<F, N> {
    /// Wrap `file` of `file_size` bytes, to be flashed into `region`.
    pub fn new(file: F, file_size: u32, layout: Layout, region: FlashRegion) -> Result<Self, OpenError> {
        const {
            assert!(
                N > 0 && N % Uf2Record::PAYLOAD_SIZE == 0,
                "block size must be a multiple of the UF2 payload size"
            )
        };

        let limit = region.len().saturating_mul(layout.expansion());
        if file_size > limit {
            return Err(OpenError::TooBig {
                size: file_size,
                limit,
            });
        }

        if layout == Layout::Uf2 && file_size as usize % Uf2Record::SIZE != 0 {
            return Err(OpenError::Truncated { size: file_size });
        }

        debug!("opened {} file of {=u32} bytes", layout, file_size);

        Ok(Self {
            file,
            layout,
            file_size,
            record: Uf2Record::new_zeroed(),
        })
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn release(self) -> F {
        self.file
    }

    async fn seek(&mut self, position: u32) -> Result<(), SourceError> {
        self.file
            .seek(SeekFrom::Start(position as u64))
            .await
            .map_err(|_| {
                warn!("seek to {=u32} failed", position);
                SourceError::Io
            })?;
        Ok(())
    }

    async fn read_raw(
        &mut self,
        request: BlockRequest,
        block: &mut TransferBlock<N>,
    ) -> Result<Fetch, SourceError> {
        let remaining = self.file_size.saturating_sub(request.offset) as usize;
        let len = remaining.min(N);

        if len > 0 {
            self.seek(request.offset).await?;
            self.file
                .read_exact(&mut block.buffer_mut()[..len])
                .await
                .map_err(|_| {
                    warn!("read of {=usize} bytes at {=u32} failed", len, request.offset);
                    SourceError::Io
                })?;
        }

        block.commit(len);

        if len == remaining {
            Ok(Fetch::EndOfImage)
        } else {
            Ok(Fetch::Ready)
        }
    }

    async fn read_uf2(
        &mut self,
        request: BlockRequest,
        block: &mut TransferBlock<N>,
    ) -> Result<Fetch, SourceError> {
        let start = request.offset.saturating_mul(self.layout.expansion());
        self.seek(start).await?;

        let mut filled = 0;
        let mut position = start;
        while filled < N && position < self.file_size {
            self.file
                .read_exact(self.record.as_mut_bytes())
                .await
                .map_err(|_| {
                    warn!("read of UF2 block at {=u32} failed", position);
                    SourceError::Io
                })?;

            if !self.record.has_valid_magic() {
                return Err(SourceError::BadMagic { offset: position });
            }

            let expected = request.address.wrapping_add(filled as u32);
            if self.record.target_addr.get() != expected
                || self.record.payload_size.get() as usize != Uf2Record::PAYLOAD_SIZE
            {
                return Err(SourceError::UnexpectedBlock { offset: position });
            }

            block.buffer_mut()[filled..filled + Uf2Record::PAYLOAD_SIZE]
                .copy_from_slice(self.record.payload());

            filled += Uf2Record::PAYLOAD_SIZE;
            position += Uf2Record::SIZE as u32;
        }

        block.commit(filled);

        if position >= self.file_size {
            Ok(Fetch::EndOfImage)
        } else {
            Ok(Fetch::Ready)
        }
    }
}

impl<F: Read + Seek, const N: usize> BlockSource<N> for FileSource<F, N> {
    async fn next_block(
        &mut self,
        request: BlockRequest,
        block: &mut TransferBlock<N>,
    ) -> Result<Fetch, SourceError> {
        match self.layout {
            Layout::Raw => self.read_raw(request, block).await,
            Layout::Uf2 => self.read_uf2(request, block).await,
        }
    }

    fn image_size(&self) -> Option<u32> {
        Some(self.file_size / self.layout.expansion())
    }
}
