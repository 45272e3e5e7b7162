//! Sources of the new application image, delivering it one fixed-size block at a time.

use core::task::Poll;

use crate::flash::ERASED;

pub mod file;
pub mod host;
pub mod uf2;

pub use host::{Acknowledgement, ChecksumRecord};

/// Fixed-capacity buffer holding one block of the image while it is written page by page.
pub struct TransferBlock<const N: usize> {
    data: [u8; N],
    /// Bytes of real image data, the remainder is padding.
    valid: usize,
    /// Bytes already committed to flash.
    written: usize,
}

impl<const N: usize> TransferBlock<N> {
    pub const fn new() -> Self {
        Self {
            data: [ERASED; N],
            valid: 0,
            written: 0,
        }
    }

    /// Buffer to be filled by a source, followed by [`TransferBlock::commit`].
    pub fn buffer_mut(&mut self) -> &mut [u8; N] {
        &mut self.data
    }

    /// Mark the first `valid` bytes as image data, pad the remainder and rewind the write offset.
    pub fn commit(&mut self, valid: usize) {
        let valid = valid.min(N);
        self.data[valid..].fill(ERASED);
        self.valid = valid;
        self.written = 0;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn valid(&self) -> usize {
        self.valid
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// All bytes have been committed to flash.
    pub fn is_retired(&self) -> bool {
        self.written >= N
    }

    /// The next `size` bytes to be written.
    pub(crate) fn pending(&self, size: usize) -> &[u8] {
        let end = (self.written + size).min(N);
        &self.data[self.written..end]
    }

    pub(crate) fn advance(&mut self, size: usize) {
        self.written = (self.written + size).min(N);
    }
}

impl<const N: usize> Default for TransferBlock<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the requested block will end up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockRequest {
    /// Absolute flash address of the first byte of the block.
    pub address: u32,
    /// Distance of `address` from the region start, which equals the number of image bytes written so far.
    pub offset: u32,
}

/// Result of asking a source for the next block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Fetch {
    /// The block is filled completely with image data.
    Ready,
    /// The block holds the tail of the image, padded with erased bytes.
    EndOfImage,
    /// Nothing yet, ask again on the next iteration.
    Pending,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SourceError {
    /// Seeking or reading the file failed.
    Io,
    /// A UF2 record at file offset `offset` does not carry the expected magic numbers.
    BadMagic { offset: u32 },
    /// A UF2 record at file offset `offset` targets another address or carries an unexpected payload size.
    UnexpectedBlock { offset: u32 },
    /// The host did not start transferring within the timeout.
    HostSilent,
    /// The host stopped responding after part of the image was transferred.
    HostLost,
}

impl SourceError {
    /// Fatal errors abort the update immediately, all others are retried.
    ///
    /// A malformed file will not improve by reading it again, and resuming without a host that
    /// disappeared halfway is unsafe.
    pub fn is_fatal(&self) -> bool {
        match self {
            SourceError::Io | SourceError::HostSilent => false,
            SourceError::BadMagic { .. }
            | SourceError::UnexpectedBlock { .. }
            | SourceError::HostLost => true,
        }
    }
}

impl core::fmt::Display for SourceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SourceError::Io => f.write_str("file read failed"),
            SourceError::BadMagic { offset } => write!(f, "bad UF2 block at offset {offset}"),
            SourceError::UnexpectedBlock { offset } => {
                write!(f, "unexpected data in UF2 block at offset {offset}")
            }
            SourceError::HostSilent => f.write_str("Timeout while waiting for host"),
            SourceError::HostLost => f.write_str("Timeout while waiting for response"),
        }
    }
}

/// Provider of the new image.
#[allow(async_fn_in_trait)]
pub trait BlockSource<const N: usize> {
    /// Fill `block` with the image bytes destined for `request.address`.
    ///
    /// Must not block: sources waiting on hardware return [`Fetch::Pending`] instead.
    async fn next_block(
        &mut self,
        request: BlockRequest,
        block: &mut TransferBlock<N>,
    ) -> Result<Fetch, SourceError>;

    /// Size of the image in bytes, if known up front.
    fn image_size(&self) -> Option<u32> {
        None
    }

    /// End-to-end verification offered by the source once the image has been written.
    ///
    /// Sources without one are locked right after the last block.
    fn checksum_exchange(&mut self) -> Option<&mut dyn ChecksumExchange> {
        None
    }
}

/// Request/response exchange validating the written image with the party that sent it.
pub trait ChecksumExchange {
    /// Start receiving the checksum record.
    fn request_checksum(&mut self);

    /// Poll for the checksum record requested earlier.
    fn poll_checksum(&mut self) -> Poll<Result<ChecksumRecord, SourceError>>;

    /// Start sending the verdict on the checksum.
    fn send_acknowledgement(&mut self, acknowledgement: Acknowledgement);

    /// Poll for completion of the acknowledgement sent earlier.
    fn poll_acknowledgement(&mut self) -> Poll<Result<(), SourceError>>;
}
