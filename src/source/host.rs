//! Image pushed by a companion host over a synchronous peripheral link.
//!
//! The device is the clocked side of the link. For every transfer it arms the bulk transfer engine for a fixed
//! number of bytes and signals readiness to the host, after which the host clocks the data in.
//! Completion is signalled by the host releasing its select line.
//!
//! The exchange is:
//! 1. Blocks of exactly `N` bytes, until the host stops sending.
//!    Silence after at least one block means the image is complete.
//! 2. A [`ChecksumRecord`] from the host, covering the image as it sent it.
//! 3. A single [`Acknowledgement`] byte from the device.
//!
//! When the host is told the checksum did not match, it sends the whole image again.

use core::task::Poll;

use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::source::{BlockRequest, BlockSource, ChecksumExchange, Fetch, SourceError, TransferBlock};

/// Bulk transfer peripheral connected to the host.
pub trait HostLink {
    /// Arm a transfer of `incoming` bytes from the host, while shifting out `outgoing` (padded as the link sees fit),
    /// then signal the host that the device is ready.
    fn start_transfer(&mut self, incoming: usize, outgoing: &[u8]);

    /// Whether the host finished the transfer and the transfer engine has drained all data.
    fn is_transfer_complete(&mut self) -> bool;

    /// Disarm the transfer logic.
    fn stop_transfer(&mut self);

    /// Data received by the last completed transfer.
    fn received(&self) -> &[u8];
}

/// Free running millisecond counter, allowed to wrap.
pub trait Clock {
    fn now_ms(&self) -> u32;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    /// Silence after which the image is considered complete, once at least one block was received.
    pub complete_delay_ms: u32,
    /// Silence after which the host is considered gone.
    pub timeout_ms: u32,
}

impl Timing {
    pub const fn new() -> Self {
        Self {
            complete_delay_ms: 400,
            timeout_ms: 2000,
        }
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}

/// Checksum declared by the host, sent after the last block.
#[derive(Clone, Copy, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ChecksumRecord {
    firmware_length: U32,
    crc16: U16,
    reserved: [u8; 2],
}

impl ChecksumRecord {
    pub const SIZE: usize = 8;

    pub fn new(firmware_length: u32, crc16: u16) -> Self {
        Self {
            firmware_length: U32::new(firmware_length),
            crc16: U16::new(crc16),
            reserved: [0; 2],
        }
    }

    /// Number of image bytes covered, counted from the region start.
    pub fn firmware_length(&self) -> u32 {
        self.firmware_length.get()
    }

    pub fn crc16(&self) -> u16 {
        self.crc16.get()
    }
}

const _: () = assert!(core::mem::size_of::<ChecksumRecord>() == ChecksumRecord::SIZE);

/// Verdict on the checksum, sent back to the host.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Acknowledgement {
    Ok = 0x0C,
    ChecksumError = 0xFF,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum Transfer {
    Block,
    Checksum,
    Acknowledgement,
}

/// Block source driven by a companion host.
pub struct HostSource<L, C, const N: usize> {
    link: L,
    clock: C,
    timing: Timing,
    pending: Option<Transfer>,
    started: u32,
}

impl<L: HostLink, C: Clock, const N: usize> HostSource<L, C, N> {
    pub fn new(link: L, clock: C, timing: Timing) -> Self {
        Self {
            link,
            clock,
            timing,
            pending: None,
            started: 0,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn release(self) -> (L, C) {
        (self.link, self.clock)
    }

    fn start(&mut self, transfer: Transfer, incoming: usize, outgoing: &[u8]) {
        trace!("arming {} transfer of {=usize} bytes", transfer, incoming);
        self.link.start_transfer(incoming, outgoing);
        self.pending = Some(transfer);
        self.started = self.clock.now_ms();
    }

    fn stop(&mut self) {
        self.link.stop_transfer();
        self.pending = None;
    }

    fn elapsed(&self) -> u32 {
        self.clock.now_ms().wrapping_sub(self.started)
    }

    /// Wait for the completion of a checksum or acknowledgement transfer.
    fn poll_transfer(&mut self, transfer: Transfer) -> Poll<Result<(), SourceError>> {
        if self.pending != Some(transfer) {
            return Poll::Ready(Err(SourceError::HostLost));
        }

        if self.link.is_transfer_complete() {
            self.pending = None;
            Poll::Ready(Ok(()))
        } else if self.elapsed() > self.timing.timeout_ms {
            warn!("{} transfer timed out", transfer);
            self.stop();
            Poll::Ready(Err(SourceError::HostLost))
        } else {
            Poll::Pending
        }
    }
}

impl<L: HostLink, C: Clock, const N: usize> BlockSource<N> for HostSource<L, C, N> {
    async fn next_block(
        &mut self,
        request: BlockRequest,
        block: &mut TransferBlock<N>,
    ) -> Result<Fetch, SourceError> {
        if self.pending != Some(Transfer::Block) {
            self.start(Transfer::Block, N, &[]);
            return Ok(Fetch::Pending);
        }

        if self.link.is_transfer_complete() {
            self.pending = None;

            let received = self.link.received();
            let len = received.len().min(N);
            block.buffer_mut()[..len].copy_from_slice(&received[..len]);
            block.commit(len);

            return Ok(if len == N {
                Fetch::Ready
            } else {
                Fetch::EndOfImage
            });
        }

        let elapsed = self.elapsed();
        if request.offset != 0 && elapsed > self.timing.complete_delay_ms {
            debug!("host silent after {=u32} bytes, image complete", request.offset);
            self.stop();
            block.commit(0);
            Ok(Fetch::EndOfImage)
        } else if elapsed > self.timing.timeout_ms {
            self.stop();
            if request.offset == 0 {
                Err(SourceError::HostSilent)
            } else {
                Err(SourceError::HostLost)
            }
        } else {
            Ok(Fetch::Pending)
        }
    }

    fn checksum_exchange(&mut self) -> Option<&mut dyn ChecksumExchange> {
        Some(self)
    }
}

impl<L: HostLink, C: Clock, const N: usize> ChecksumExchange for HostSource<L, C, N> {
    fn request_checksum(&mut self) {
        self.start(Transfer::Checksum, ChecksumRecord::SIZE, &[]);
    }

    fn poll_checksum(&mut self) -> Poll<Result<ChecksumRecord, SourceError>> {
        match self.poll_transfer(Transfer::Checksum) {
            Poll::Ready(Ok(())) => Poll::Ready(
                ChecksumRecord::read_from_prefix(self.link.received())
                    .map(|(record, _)| record)
                    .map_err(|_| SourceError::HostLost),
            ),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn send_acknowledgement(&mut self, acknowledgement: Acknowledgement) {
        self.start(Transfer::Acknowledgement, 1, &[acknowledgement as u8]);
    }

    fn poll_acknowledgement(&mut self) -> Poll<Result<(), SourceError>> {
        self.poll_transfer(Transfer::Acknowledgement)
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::flash::ERASED;
    use crate::mock::{HostReply, MockClock, MockHostLink};

    const N: usize = 512;

    fn request(offset: u32) -> BlockRequest {
        BlockRequest {
            address: 0x1000 + offset,
            offset,
        }
    }

    fn source(script: impl IntoIterator<Item = HostReply>) -> (HostSource<MockHostLink, MockClock, N>, MockClock) {
        let clock = MockClock::new(0);
        let source = HostSource::new(MockHostLink::new(script), clock.clone(), Timing::new());
        (source, clock)
    }

    #[test]
    fn block_after_arming() {
        let data: std::vec::Vec<u8> = (0..N as u32).map(|i| (i * 3) as u8).collect();
        let (mut source, _) = source([HostReply::Respond(data.clone())]);
        let mut block = TransferBlock::new();

        assert_eq!(block_on(source.next_block(request(0), &mut block)), Ok(Fetch::Pending));
        assert_eq!(source.link().requested, [N]);

        assert_eq!(block_on(source.next_block(request(0), &mut block)), Ok(Fetch::Ready));
        assert_eq!(block.data(), &data[..]);
    }

    #[test]
    fn silence_after_data_ends_image() {
        let (mut source, clock) = source([HostReply::Silent]);
        let mut block = TransferBlock::<N>::new();
        block.buffer_mut().fill(0);

        assert_eq!(block_on(source.next_block(request(512), &mut block)), Ok(Fetch::Pending));
        clock.advance(300);
        assert_eq!(block_on(source.next_block(request(512), &mut block)), Ok(Fetch::Pending));
        clock.advance(200);
        assert_eq!(
            block_on(source.next_block(request(512), &mut block)),
            Ok(Fetch::EndOfImage)
        );

        assert_eq!(block.valid(), 0);
        assert!(block.data().iter().all(|b| *b == ERASED));
        assert_eq!(source.link().stopped, 1);
    }

    #[test]
    fn silence_before_data_times_out() {
        let (mut source, clock) = source([HostReply::Silent]);
        let mut block = TransferBlock::new();

        assert_eq!(block_on(source.next_block(request(0), &mut block)), Ok(Fetch::Pending));
        clock.advance(1000);
        assert_eq!(block_on(source.next_block(request(0), &mut block)), Ok(Fetch::Pending));
        clock.advance(1001);
        assert_eq!(
            block_on(source.next_block(request(0), &mut block)),
            Err(SourceError::HostSilent)
        );

        // A new transfer is armed on the next request.
        assert_eq!(block_on(source.next_block(request(0), &mut block)), Ok(Fetch::Pending));
        assert_eq!(source.link().requested.len(), 2);
    }

    #[test]
    fn checksum_exchange() {
        let record = ChecksumRecord::new(1234, 0xBEEF);
        let (mut source, _) = source([
            HostReply::Respond(record.as_bytes().to_vec()),
            HostReply::Respond(std::vec![0]),
        ]);

        let exchange = source.checksum_exchange().unwrap();
        exchange.request_checksum();
        let received = match exchange.poll_checksum() {
            Poll::Ready(Ok(record)) => record,
            _ => panic!("expected checksum record"),
        };
        assert_eq!(received.firmware_length(), 1234);
        assert_eq!(received.crc16(), 0xBEEF);

        exchange.send_acknowledgement(Acknowledgement::Ok);
        assert_eq!(exchange.poll_acknowledgement(), Poll::Ready(Ok(())));

        assert_eq!(source.link().requested, [ChecksumRecord::SIZE, 1]);
        assert_eq!(source.link().sent[1], [0x0C]);
    }

    #[test]
    fn checksum_timeout() {
        let (mut source, clock) = source([HostReply::Silent]);

        source.request_checksum();
        assert_eq!(source.poll_checksum().map(|r| r.is_ok()), Poll::Pending);
        clock.advance(2001);
        assert!(matches!(
            source.poll_checksum(),
            Poll::Ready(Err(SourceError::HostLost))
        ));
    }

    #[test]
    fn acknowledgement_without_request() {
        let (mut source, _) = source(std::vec::Vec::new());

        assert_eq!(
            source.poll_acknowledgement(),
            Poll::Ready(Err(SourceError::HostLost))
        );
    }
}
